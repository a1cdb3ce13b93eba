use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use log::debug;
use strand_bytecode::{Constant, Instruction, LinkError, Module, link};

use crate::{CallChain, CallChainCache, HostError, LoadError, NativeRegistry, NativeType, TypeRef, Value};

/// Upper bound on a method's register file.
pub const MAX_REGISTERS: u32 = 1 << 16;
pub const MAX_FIELDS: u32 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(pub u32);

#[derive(Debug)]
pub struct ClassInfo {
    pub id: ClassId,
    pub name: String,
    pub super_class: Option<ClassId>,
    pub mixins: Vec<ClassId>,
    /// Number of fields of an instance, inherited ones included.
    pub fields: u32,
    pub methods: Vec<MethodId>,
    /// Names this class answers to: itself, its mixins and its ancestors.
    lineage: Vec<String>,
}

impl ClassInfo {
    pub fn new(id: ClassId, name: impl Into<String>, fields: u32) -> Self {
        let name = name.into();
        Self {
            id,
            lineage: vec![name.clone()],
            name,
            super_class: None,
            mixins: Vec::new(),
            fields,
            methods: Vec::new(),
        }
    }

    pub fn is_a(&self, name: &str) -> bool {
        self.lineage.iter().any(|n| n == name)
    }
}

#[derive(Debug)]
pub struct MethodInfo {
    pub id: MethodId,
    pub name: String,
    pub class: Option<ClassId>,
    /// `Class.method` or just `method` for free functions.
    pub qualified_name: String,
    pub params: Vec<Option<String>>,
    pub registers: u32,
    code: Vec<Instruction>,
    linked: OnceLock<Result<Arc<[Instruction]>, LinkError>>,
}

impl MethodInfo {
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// The linked op stream. Linking happens once, on first use.
    pub fn linked(&self) -> Result<Arc<[Instruction]>, LinkError> {
        self.linked
            .get_or_init(|| {
                let mut code = self.code.clone();
                let report = link(&mut code)?;
                debug!(
                    "linked {}: {} branches, {} redundant",
                    self.qualified_name, report.branches, report.redundant
                );
                Ok(code.into())
            })
            .clone()
    }
}

/// Everything the runtime knows about the loaded module.
pub struct Container {
    name: String,
    constants: Vec<Constant>,
    values: Vec<Value>,
    methods: Vec<Arc<MethodInfo>>,
    classes: Vec<Arc<ClassInfo>>,
    class_names: HashMap<String, ClassId>,
    natives: NativeRegistry,
    chains: CallChainCache,
}

impl Container {
    pub fn load(module: &Module) -> Result<Self, LoadError> {
        let mut class_names = HashMap::new();
        for (i, class) in module.classes.iter().enumerate() {
            if class_names.insert(class.name.clone(), ClassId(i as u32)).is_some() {
                return Err(LoadError::DuplicateClass {
                    name: class.name.clone(),
                });
            }
        }
        let resolve = |name: &String| {
            class_names
                .get(name)
                .copied()
                .ok_or_else(|| LoadError::UnknownClass { name: name.clone() })
        };

        if let Some(def) = module.methods.iter().find(|m| m.registers > MAX_REGISTERS) {
            return Err(LoadError::TooManyRegisters {
                method: def.name.clone(),
                registers: def.registers,
            });
        }
        if let Some(def) = module.classes.iter().find(|c| c.fields > MAX_FIELDS) {
            return Err(LoadError::TooManyFields {
                class: def.name.clone(),
                fields: def.fields,
            });
        }

        let mut owners = vec![None; module.methods.len()];
        let mut classes = Vec::with_capacity(module.classes.len());
        for (i, def) in module.classes.iter().enumerate() {
            let mut class = ClassInfo::new(ClassId(i as u32), def.name.clone(), def.fields);
            class.super_class = def.super_class.as_ref().map(resolve).transpose()?;
            class.mixins = def.mixins.iter().map(resolve).collect::<Result<_, _>>()?;
            for &index in &def.methods {
                let Some(owner) = owners.get_mut(index as usize) else {
                    return Err(LoadError::BadMethodIndex {
                        class: def.name.clone(),
                        index,
                    });
                };
                owner.get_or_insert(class.id);
                class.methods.push(MethodId(index));
            }
            classes.push(class);
        }

        for i in 0..classes.len() {
            let names = lineage(&classes, ClassId(i as u32))?;
            classes[i].lineage = names;
        }
        let classes: Vec<Arc<ClassInfo>> = classes.into_iter().map(Arc::new).collect();

        let methods = module
            .methods
            .iter()
            .enumerate()
            .map(|(i, def)| {
                let class = owners[i];
                let qualified_name = match class {
                    Some(id) => format!("{}.{}", classes[id.0 as usize].name, def.name),
                    None => def.name.clone(),
                };
                Arc::new(MethodInfo {
                    id: MethodId(i as u32),
                    name: def.name.clone(),
                    class,
                    qualified_name,
                    params: def.params.clone(),
                    registers: def.registers,
                    code: def.code.clone(),
                    linked: OnceLock::new(),
                })
            })
            .collect();

        for (i, constant) in module.constants.iter().enumerate() {
            if let Constant::Type(name) = constant {
                if NativeType::from_name(name).is_none()
                    && name != "Object"
                    && !class_names.contains_key(name)
                {
                    return Err(LoadError::UnknownType {
                        name: name.clone(),
                        index: i as u32,
                    });
                }
            }
        }
        let values = module
            .constants
            .iter()
            .map(|constant| match constant {
                Constant::Null => Value::Null,
                Constant::Bool(b) => Value::Bool(*b),
                Constant::Int(n) => Value::Int(*n),
                Constant::String(s) | Constant::Type(s) => Value::str(s),
            })
            .collect();

        debug!(
            "loaded module {}: {} classes, {} methods, {} constants",
            module.name,
            classes.len(),
            module.methods.len(),
            module.constants.len()
        );

        Ok(Self {
            name: module.name.clone(),
            constants: module.constants.clone(),
            values,
            methods,
            classes,
            class_names,
            natives: NativeRegistry::new(),
            chains: CallChainCache::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn constant(&self, index: u32) -> Result<Value, HostError> {
        self.values
            .get(index as usize)
            .cloned()
            .ok_or(HostError::BadConstant { index })
    }

    /// A string constant, used for member names.
    pub fn string(&self, index: u32) -> Result<Arc<str>, HostError> {
        match (self.constants.get(index as usize), self.values.get(index as usize)) {
            (Some(Constant::String(_)), Some(Value::Str(s))) => Ok(Arc::clone(s)),
            _ => Err(HostError::BadConstant { index }),
        }
    }

    pub fn type_ref(&self, index: u32) -> Result<TypeRef, HostError> {
        let Some(Constant::Type(name)) = self.constants.get(index as usize) else {
            return Err(HostError::BadConstant { index });
        };
        if let Some(native) = NativeType::from_name(name) {
            return Ok(TypeRef::Native(native));
        }
        match self.class_names.get(name) {
            Some(id) => Ok(TypeRef::Class(Arc::clone(&self.classes[id.0 as usize]))),
            None => Ok(TypeRef::Object),
        }
    }

    pub fn method(&self, index: u32) -> Result<&Arc<MethodInfo>, HostError> {
        self.methods
            .get(index as usize)
            .ok_or(HostError::BadMethod { index })
    }

    pub fn methods(&self) -> &[Arc<MethodInfo>] {
        &self.methods
    }

    /// A method that belongs to no class.
    pub fn function(&self, name: &str) -> Option<&Arc<MethodInfo>> {
        self.methods
            .iter()
            .find(|m| m.class.is_none() && m.name == name)
    }

    pub fn class(&self, index: u32) -> Result<&Arc<ClassInfo>, HostError> {
        self.classes
            .get(index as usize)
            .ok_or(HostError::BadClass { index })
    }

    pub fn class_named(&self, name: &str) -> Option<&Arc<ClassInfo>> {
        self.class_names
            .get(name)
            .map(|id| &self.classes[id.0 as usize])
    }

    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    /// Implementations of `name` for instances of `class`, most specific
    /// first. Built once per pair.
    pub fn call_chain(&self, class: &ClassInfo, name: &str) -> Arc<CallChain> {
        self.chains.get_or_build(class.id, name, || {
            CallChain::build(&self.classes, &self.methods, class.id, name)
        })
    }
}

// class first, then mixins, then the superclass chain
fn lineage(classes: &[ClassInfo], start: ClassId) -> Result<Vec<String>, LoadError> {
    let mut names = Vec::new();
    let mut stack = vec![(start, 0usize)];
    while let Some((id, depth)) = stack.pop() {
        let class = &classes[id.0 as usize];
        if depth > classes.len() {
            return Err(LoadError::InheritanceCycle {
                class: classes[start.0 as usize].name.clone(),
            });
        }
        if !names.contains(&class.name) {
            names.push(class.name.clone());
        }
        if let Some(parent) = class.super_class {
            stack.push((parent, depth + 1));
        }
        for mixin in class.mixins.iter().rev() {
            stack.push((*mixin, depth + 1));
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_bytecode::{ClassDef, MethodDef};

    fn module() -> Module {
        let mut module = Module::new("test");
        let speak = module.add_method(MethodDef {
            name: "speak".into(),
            params: vec![],
            registers: 0,
            code: vec![Instruction::ReturnVoid],
        });
        module.add_method(MethodDef {
            name: "main".into(),
            ..MethodDef::default()
        });
        module.add_class(ClassDef {
            name: "Animal".into(),
            fields: 1,
            methods: vec![speak],
            ..ClassDef::default()
        });
        module.add_class(ClassDef {
            name: "Dog".into(),
            super_class: Some("Animal".into()),
            fields: 2,
            ..ClassDef::default()
        });
        module.constant(Constant::Type("Dog".into()));
        module.constant(Constant::Type("Int".into()));
        module
    }

    #[test]
    fn load_resolves_names() {
        let container = Container::load(&module()).unwrap();
        let dog = container.class_named("Dog").unwrap();
        assert!(dog.is_a("Animal"));
        assert!(!container.class_named("Animal").unwrap().is_a("Dog"));
        assert_eq!(container.method(0).unwrap().qualified_name, "Animal.speak");
        assert!(container.function("main").is_some());
        assert!(container.function("speak").is_none());
        assert!(matches!(container.type_ref(0), Ok(TypeRef::Class(c)) if c.name == "Dog"));
        assert!(matches!(container.type_ref(1), Ok(TypeRef::Native(NativeType::Int))));
    }

    #[test]
    fn unknown_names_fail_the_load() {
        let mut m = module();
        m.classes[1].super_class = Some("Cat".into());
        assert_eq!(
            Container::load(&m).err(),
            Some(LoadError::UnknownClass { name: "Cat".into() })
        );

        let mut m = module();
        m.constant(Constant::Type("Nope".into()));
        assert!(matches!(Container::load(&m), Err(LoadError::UnknownType { .. })));
    }

    #[test]
    fn oversized_frames_and_objects_are_rejected() {
        let mut m = module();
        m.methods[1].registers = u32::MAX;
        assert_eq!(
            Container::load(&m).err(),
            Some(LoadError::TooManyRegisters {
                method: "main".into(),
                registers: u32::MAX,
            })
        );

        let mut m = module();
        m.classes[1].fields = MAX_FIELDS + 1;
        assert!(matches!(
            Container::load(&m),
            Err(LoadError::TooManyFields { class, .. }) if class == "Dog"
        ));
    }

    #[test]
    fn inheritance_cycles_are_rejected() {
        let mut m = module();
        m.classes[0].super_class = Some("Dog".into());
        assert!(matches!(
            Container::load(&m),
            Err(LoadError::InheritanceCycle { .. })
        ));
    }

    #[test]
    fn methods_link_once() {
        let container = Container::load(&module()).unwrap();
        let method = container.method(0).unwrap();
        let a = method.linked().unwrap();
        let b = method.linked().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
