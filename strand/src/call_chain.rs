use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{ClassId, ClassInfo, MethodInfo};

/// Implementations of one method name for one class, most specific first.
///
/// An empty chain means the class does not override the operation and the
/// caller falls back to its default.
#[derive(Debug, Default)]
pub struct CallChain {
    methods: Vec<Arc<MethodInfo>>,
}

impl CallChain {
    /// Walk the class itself, then its mixins in declaration order, then
    /// its superclass, visiting each class once.
    pub fn build(
        classes: &[Arc<ClassInfo>],
        methods: &[Arc<MethodInfo>],
        class: ClassId,
        name: &str,
    ) -> Self {
        let mut chain = Vec::new();
        let mut seen = Vec::new();
        let mut stack = vec![class];
        while let Some(id) = stack.pop() {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            let Some(info) = classes.get(id.0 as usize) else {
                continue;
            };
            for method in &info.methods {
                if let Some(m) = methods.get(method.0 as usize) {
                    if m.name == name {
                        chain.push(Arc::clone(m));
                    }
                }
            }
            if let Some(parent) = info.super_class {
                stack.push(parent);
            }
            stack.extend(info.mixins.iter().rev());
        }
        Self { methods: chain }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn get(&self, depth: usize) -> Option<&Arc<MethodInfo>> {
        self.methods.get(depth)
    }

    pub fn top(&self) -> Option<&Arc<MethodInfo>> {
        self.methods.first()
    }
}

#[derive(Debug, Default)]
pub struct CallChainCache {
    chains: RwLock<HashMap<ClassId, HashMap<String, Arc<CallChain>>>>,
}

impl CallChainCache {
    pub fn get_or_build(
        &self,
        class: ClassId,
        name: &str,
        build: impl FnOnce() -> CallChain,
    ) -> Arc<CallChain> {
        if let Some(chain) = self.chains.read().get(&class).and_then(|m| m.get(name)) {
            return Arc::clone(chain);
        }
        let chain = Arc::new(build());
        let mut chains = self.chains.write();
        let entry = chains
            .entry(class)
            .or_default()
            .entry(name.to_string())
            .or_insert(chain);
        Arc::clone(entry)
    }

    pub fn len(&self) -> usize {
        self.chains.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Container;
    use strand_bytecode::{ClassDef, Instruction, MethodDef, Module};

    fn method(module: &mut Module, name: &str) -> u32 {
        module.add_method(MethodDef {
            name: name.into(),
            code: vec![Instruction::ReturnVoid],
            ..MethodDef::default()
        })
    }

    #[test]
    fn class_then_mixins_then_super() {
        let mut m = Module::new("chains");
        let base = method(&mut m, "describe");
        let mixed = method(&mut m, "describe");
        let own = method(&mut m, "describe");
        let other = method(&mut m, "other");
        m.add_class(ClassDef {
            name: "Base".into(),
            methods: vec![base],
            ..ClassDef::default()
        });
        m.add_class(ClassDef {
            name: "Loud".into(),
            methods: vec![mixed],
            ..ClassDef::default()
        });
        m.add_class(ClassDef {
            name: "Leaf".into(),
            super_class: Some("Base".into()),
            mixins: vec!["Loud".into()],
            methods: vec![own, other],
            ..ClassDef::default()
        });
        let container = Container::load(&m).unwrap();
        let leaf = container.class_named("Leaf").unwrap();

        let chain = container.call_chain(leaf, "describe");
        let ids: Vec<u32> = (0..chain.len()).map(|i| chain.get(i).unwrap().id.0).collect();
        assert_eq!(ids, vec![own, mixed, base]);

        assert!(container.call_chain(leaf, "missing").is_empty());
        let again = container.call_chain(leaf, "describe");
        assert!(Arc::ptr_eq(&chain, &again));
    }
}
