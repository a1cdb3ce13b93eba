use std::{cmp::Ordering, fmt, sync::Arc};

use crate::{
    ClassInfo, Exception, ExceptionKind, FiberId, FutureRef, MethodInfo, ServiceProxy,
};

/// Handle into a fiber's private heap.
///
/// The owning fiber is part of the handle, so a handle that leaks into
/// another fiber is caught on first use instead of aliasing its heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapRef {
    pub(crate) fiber: FiberId,
    pub(crate) index: u32,
}

impl HeapRef {
    pub fn fiber(&self) -> FiberId {
        self.fiber
    }
}

impl fmt::Display for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fiber, self.index)
    }
}

/// An immutable deep copy of a guest object.
#[derive(Debug)]
pub struct FrozenObject {
    pub class: Arc<ClassInfo>,
    pub fields: Vec<Portable>,
}

/// A call that has been prepared but not yet started.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub(crate) method: Arc<MethodInfo>,
    pub(crate) this: Option<Value>,
    pub(crate) args: Vec<Value>,
}

/// A value whose computation has not finished.
///
/// Consumers never read through a deferred value; they hand a
/// continuation to [`Deferred::proceed`] instead.
#[derive(Debug, Clone)]
pub enum Deferred {
    Call(Box<PendingCall>),
    Future(FutureRef),
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    /// Result of a three-way comparison.
    Ordered(Ordering),
    Object(HeapRef),
    Ref(HeapRef),
    Frozen(Arc<FrozenObject>),
    Exception(Arc<Exception>),
    Service(ServiceProxy),
    /// Result of an asynchronous service call, read through on demand.
    Future(FutureRef),
    Deferred(Deferred),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    #[inline]
    pub fn is_deferred(&self) -> bool {
        matches!(self, Value::Deferred(_))
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Boolean",
            Value::Int(_) => "Int",
            Value::Str(_) => "String",
            Value::Ordered(_) => "Ordered",
            Value::Object(_) => "Object",
            Value::Ref(_) => "Ref",
            Value::Frozen(object) => object.class.name.as_str(),
            Value::Exception(_) => "Exception",
            Value::Service(proxy) => proxy.class_name().unwrap_or("Service"),
            Value::Future(_) => "Future",
            Value::Deferred(_) => "Deferred",
        }
    }

    /// Identity for references and services, equality for scalars.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Ordered(a), Value::Ordered(b)) => a == b,
            (Value::Object(a), Value::Object(b)) | (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::Frozen(a), Value::Frozen(b)) => {
                Arc::ptr_eq(a, b)
                    || (Arc::ptr_eq(&a.class, &b.class)
                        && a.fields.len() == b.fields.len()
                        && a.fields
                            .iter()
                            .zip(&b.fields)
                            .all(|(x, y)| x.value().same(y.value())))
            }
            (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
            (Value::Service(a), Value::Service(b)) => a.id() == b.id(),
            (Value::Future(a), Value::Future(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

pub(crate) fn ordering_name(ordering: Ordering) -> &'static str {
    match ordering {
        Ordering::Less => "Lesser",
        Ordering::Equal => "Equal",
        Ordering::Greater => "Greater",
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => f.write_str(s),
            Value::Ordered(o) => f.write_str(ordering_name(*o)),
            Value::Object(r) => write!(f, "Object@{r}"),
            Value::Ref(r) => write!(f, "Ref@{r}"),
            Value::Frozen(object) => {
                write!(f, "{}(", object.class.name)?;
                for (i, field) in object.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", field.value())?;
                }
                f.write_str(")")
            }
            Value::Exception(e) => write!(f, "{e}"),
            Value::Service(proxy) => write!(f, "{proxy:?}"),
            Value::Future(_) => f.write_str("<future>"),
            Value::Deferred(_) => f.write_str("<deferred>"),
        }
    }
}

/// A value that may cross a fiber boundary.
///
/// Only [`Portable::mask`] and freezing produce one from a local value;
/// there is no way to smuggle a heap handle into it.
#[derive(Debug, Clone)]
pub struct Portable(Value);

impl Portable {
    /// Check that `value` may leave its fiber.
    pub fn mask(value: &Value) -> Result<Portable, Exception> {
        match value {
            Value::Null
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Str(_)
            | Value::Ordered(_)
            | Value::Frozen(_)
            | Value::Exception(_)
            | Value::Service(_) => Ok(Portable(value.clone())),
            Value::Object(_) => Err(Exception::new(
                ExceptionKind::Isolation,
                "a mutable object cannot cross a fiber boundary; freeze it first",
            )),
            other => Err(Exception::new(
                ExceptionKind::Isolation,
                format!("a {} cannot cross a fiber boundary", other.type_name()),
            )),
        }
    }

    pub(crate) fn frozen(object: FrozenObject) -> Self {
        Portable(Value::Frozen(Arc::new(object)))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Admit the value on the receiving side if it conforms to `expected`.
    pub fn reveal(self, expected: Option<&str>) -> Result<Value, Exception> {
        match expected {
            Some(ty) if !conforms(&self.0, ty) => Err(Exception::new(
                ExceptionKind::Isolation,
                format!("expected {ty}, got {}", self.0.type_name()),
            )),
            _ => Ok(self.0),
        }
    }

    pub(crate) fn into_value(self) -> Value {
        self.0
    }
}

fn conforms(value: &Value, ty: &str) -> bool {
    match ty {
        "Object" => true,
        "Int" => matches!(value, Value::Int(_)),
        "String" => matches!(value, Value::Str(_)),
        "Boolean" => matches!(value, Value::Bool(_)),
        "Ordered" => matches!(value, Value::Ordered(_)),
        "Exception" => matches!(value, Value::Exception(_)),
        class => match value {
            Value::Frozen(object) => object.class.is_a(class),
            Value::Service(proxy) => proxy.class().is_some_and(|c| c.is_a(class)),
            _ => false,
        },
    }
}

impl From<i64> for Portable {
    fn from(n: i64) -> Self {
        Portable(Value::Int(n))
    }
}

impl From<bool> for Portable {
    fn from(b: bool) -> Self {
        Portable(Value::Bool(b))
    }
}

impl From<&str> for Portable {
    fn from(s: &str) -> Self {
        Portable(Value::str(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_mask_and_reveal() {
        let p = Portable::mask(&Value::Int(5)).unwrap();
        assert!(matches!(p.clone().reveal(Some("Int")), Ok(Value::Int(5))));
        assert!(p.clone().reveal(Some("Object")).is_ok());
        let err = p.reveal(Some("String")).unwrap_err();
        assert_eq!(err.kind, ExceptionKind::Isolation);
    }

    #[test]
    fn local_handles_do_not_mask() {
        let r = HeapRef {
            fiber: FiberId(1),
            index: 0,
        };
        for value in [Value::Object(r), Value::Ref(r)] {
            let err = Portable::mask(&value).unwrap_err();
            assert_eq!(err.kind, ExceptionKind::Isolation);
        }
    }

    #[test]
    fn deferred_calls_are_boxed_out_of_line() {
        assert!(std::mem::size_of::<Value>() <= 32);
    }

    #[test]
    fn sameness() {
        assert!(Value::Int(5).same(&Value::Int(5)));
        assert!(!Value::Int(5).same(&Value::Int(6)));
        assert!(Value::str("a").same(&Value::str("a")));
        assert!(!Value::Int(1).same(&Value::Bool(true)));
        assert_eq!(Value::Ordered(Ordering::Less).to_string(), "Lesser");
    }
}
