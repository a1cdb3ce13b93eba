use std::sync::Arc;

use crate::{
    ClassInfo, ExceptionKind, Fault, FiberId, FrozenObject, HeapRef, HostError, MethodInfo,
    Portable, Value,
};

#[derive(Debug)]
pub enum HeapObject {
    Object {
        class: Arc<ClassInfo>,
        fields: Vec<Value>,
    },
    /// A reference cell. Lazy cells start without a value and call `init`
    /// on first read.
    Ref {
        value: Option<Value>,
        init: Option<Arc<MethodInfo>>,
    },
}

/// A fiber's private arena.
///
/// Objects live as long as the fiber; handles are never reused.
#[derive(Debug)]
pub struct Heap {
    fiber: FiberId,
    objects: Vec<HeapObject>,
}

impl Heap {
    pub fn new(fiber: FiberId) -> Self {
        Self {
            fiber,
            objects: Vec::new(),
        }
    }

    pub fn fiber(&self) -> FiberId {
        self.fiber
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn alloc(&mut self, object: HeapObject) -> HeapRef {
        self.objects.push(object);
        HeapRef {
            fiber: self.fiber,
            index: (self.objects.len() - 1) as u32,
        }
    }

    fn slot(&self, r: HeapRef) -> Result<usize, HostError> {
        if r.fiber != self.fiber {
            return Err(HostError::ForeignHandle {
                fiber: self.fiber,
                owner: r.fiber,
            });
        }
        let index = r.index as usize;
        if index >= self.objects.len() {
            return Err(HostError::DanglingHandle { index: r.index });
        }
        Ok(index)
    }

    pub fn get(&self, r: HeapRef) -> Result<&HeapObject, HostError> {
        let index = self.slot(r)?;
        Ok(&self.objects[index])
    }

    pub fn get_mut(&mut self, r: HeapRef) -> Result<&mut HeapObject, HostError> {
        let index = self.slot(r)?;
        Ok(&mut self.objects[index])
    }

    pub fn new_object(&mut self, class: Arc<ClassInfo>, fields: Vec<Value>) -> Value {
        Value::Object(self.alloc(HeapObject::Object { class, fields }))
    }

    pub fn class_of(&self, r: HeapRef) -> Result<&Arc<ClassInfo>, HostError> {
        match self.get(r)? {
            HeapObject::Object { class, .. } => Ok(class),
            HeapObject::Ref { .. } => Err(HostError::WrongObject { index: r.index }),
        }
    }

    pub fn field(&self, r: HeapRef, field: u32) -> Result<Value, HostError> {
        match self.get(r)? {
            HeapObject::Object { class, fields } => {
                fields
                    .get(field as usize)
                    .cloned()
                    .ok_or_else(|| HostError::BadField {
                        class: class.name.clone(),
                        field,
                    })
            }
            HeapObject::Ref { .. } => Err(HostError::WrongObject { index: r.index }),
        }
    }

    pub fn set_field(&mut self, r: HeapRef, field: u32, value: Value) -> Result<(), HostError> {
        if value.is_deferred() {
            return Err(HostError::DeferredRead);
        }
        match self.get_mut(r)? {
            HeapObject::Object { class, fields } => match fields.get_mut(field as usize) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(HostError::BadField {
                    class: class.name.clone(),
                    field,
                }),
            },
            HeapObject::Ref { .. } => Err(HostError::WrongObject { index: r.index }),
        }
    }

    /// Deep-copy the object graph reachable from `value` into an immutable
    /// form that may cross fibers.
    ///
    /// Reference cells and futures stay mutable and are refused, as are
    /// cyclic graphs.
    pub fn freeze(&self, value: &Value) -> Result<Portable, Fault> {
        let mut path = Vec::new();
        self.freeze_value(value, &mut path)
    }

    fn freeze_value(&self, value: &Value, path: &mut Vec<HeapRef>) -> Result<Portable, Fault> {
        match value {
            Value::Object(r) => {
                if path.contains(r) {
                    return Err(Fault::guest(
                        ExceptionKind::NotFreezable,
                        "cannot freeze a cyclic object graph",
                    ));
                }
                let HeapObject::Object { class, fields } = self.get(*r)? else {
                    return Err(HostError::WrongObject { index: r.index }.into());
                };
                path.push(*r);
                let frozen = fields
                    .iter()
                    .map(|field| self.freeze_value(field, path))
                    .collect::<Result<Vec<_>, _>>()?;
                path.pop();
                Ok(Portable::frozen(FrozenObject {
                    class: Arc::clone(class),
                    fields: frozen,
                }))
            }
            Value::Ref(_) | Value::Future(_) | Value::Deferred(_) => Err(Fault::guest(
                ExceptionKind::NotFreezable,
                format!("a {} is not freezable", value.type_name()),
            )),
            other => Portable::mask(other).map_err(Fault::from),
        }
    }
}
