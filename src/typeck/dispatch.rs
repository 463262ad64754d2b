//! Closed-world dispatch: a lookup table from (receiver kind, selector) to
//! an implementation. A missing entry is a type error, never a runtime probe.

use std::collections::BTreeMap;

use crate::types::{ConcreteType, Value};

use super::builtins::{free_functions, primitive_methods, Builtin};
use super::classes::ClassDef;

/// Receiver kind as far as dispatch is concerned.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeTag {
    Void,
    Bool,
    Int,
    Float,
    Class(String),
    Array,
    Struct,
}

impl TypeTag {
    pub fn of(ty: &ConcreteType) -> Self {
        match ty {
            ConcreteType::Void => TypeTag::Void,
            ConcreteType::Bool => TypeTag::Bool,
            ConcreteType::Int => TypeTag::Int,
            ConcreteType::Float => TypeTag::Float,
            ConcreteType::Class(name) => TypeTag::Class(name.clone()),
            ConcreteType::Array(_) => TypeTag::Array,
            ConcreteType::Struct(_) => TypeTag::Struct,
        }
    }

    pub fn of_value(value: &Value) -> Self {
        Self::of(&value.concrete_type())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resolution {
    Builtin(Builtin),
    /// Zero-argument read of a class field.
    Field { class: String, index: usize },
    /// Instance method, inferred per argument types.
    Method { class: String, selector: String },
}

#[derive(Clone, Debug)]
pub struct DispatchTable {
    methods: BTreeMap<(TypeTag, String), Resolution>,
    functions: BTreeMap<String, Builtin>,
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl DispatchTable {
    /// Table holding every primitive method and free function.
    pub fn with_builtins() -> Self {
        let mut methods = BTreeMap::new();
        let kinds = [
            ConcreteType::Void,
            ConcreteType::Bool,
            ConcreteType::Int,
            ConcreteType::Float,
            ConcreteType::Array(Box::default()),
            ConcreteType::Struct(Vec::new()),
        ];
        for kind in &kinds {
            for (selector, builtin) in primitive_methods(kind) {
                methods.insert(
                    (TypeTag::of(kind), selector.to_string()),
                    Resolution::Builtin(builtin),
                );
            }
        }
        let functions = free_functions()
            .into_iter()
            .map(|(name, builtin)| (name.to_string(), builtin))
            .collect();
        Self { methods, functions }
    }

    /// Add field readers and instance methods of a class.
    pub fn register_class(&mut self, class: &ClassDef) {
        let tag = TypeTag::Class(class.name.clone());
        for (index, (field, _)) in class.fields.iter().enumerate() {
            self.methods.insert(
                (tag.clone(), field.clone()),
                Resolution::Field {
                    class: class.name.clone(),
                    index,
                },
            );
        }
        for selector in class.methods.keys() {
            self.methods.insert(
                (tag.clone(), selector.clone()),
                Resolution::Method {
                    class: class.name.clone(),
                    selector: selector.clone(),
                },
            );
        }
    }

    pub fn resolve(&self, tag: &TypeTag, selector: &str) -> Option<&Resolution> {
        self.methods.get(&(tag.clone(), selector.to_string()))
    }

    pub fn resolve_function(&self, name: &str) -> Option<Builtin> {
        self.functions.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.methods.len() + self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
