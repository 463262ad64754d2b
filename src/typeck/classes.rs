use std::collections::BTreeMap;

use crate::ast::Block;
use crate::error::{CompileError, Result};
use crate::types::{UnionType, Value};

/// A host class whose instances may be captured by bodies.
#[derive(Clone, Debug)]
pub struct ClassDef {
    pub name: String,
    pub fields: Vec<(String, UnionType)>,
    /// Instance methods; `self` is implicit and not listed in the block's params.
    pub methods: BTreeMap<String, Block>,
}

impl ClassDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
            methods: BTreeMap::new(),
        }
    }

    pub fn field(mut self, name: &str, ty: UnionType) -> Self {
        self.fields.push((name.to_string(), ty));
        self
    }

    pub fn method(mut self, selector: &str, body: Block) -> Self {
        self.methods.insert(selector.to_string(), body);
        self
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(field, _)| field == name)
    }

    pub fn c_type(&self) -> String {
        format!("cls_{}_t", self.name)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClassRegistry {
    classes: BTreeMap<String, ClassDef>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: ClassDef) -> Result<()> {
        if self.classes.contains_key(&class.name) {
            return Err(CompileError::construction(format!(
                "class {} is already registered",
                class.name
            )));
        }
        for (field, ty) in &class.fields {
            ty.c_type().map_err(|_| {
                CompileError::type_error(format!(
                    "field {}.{} has type {} with no device representation",
                    class.name, field, ty
                ))
            })?;
            if class.methods.contains_key(field) {
                return Err(CompileError::construction(format!(
                    "{}.{} is both a field and a method",
                    class.name, field
                )));
            }
        }
        if let Some((selector, _)) = class.methods.iter().find(|(_, m)| !m.captures.is_empty()) {
            return Err(CompileError::construction(format!(
                "method {}#{} captures variables; methods may only read self and their parameters",
                class.name, selector
            )));
        }
        self.classes.insert(class.name.clone(), class);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ClassDef> {
        self.classes.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.values()
    }

    /// Check that a captured object matches its class layout.
    pub fn check_instance(&self, value: &Value) -> Result<()> {
        match value {
            Value::Object { class, fields } => {
                let def = self.get(class).ok_or_else(|| {
                    CompileError::type_error(format!("uninitialized constant {}", class))
                })?;
                if fields.len() != def.fields.len() {
                    return Err(CompileError::type_error(format!(
                        "instance of {} has {} fields, class declares {}",
                        class,
                        fields.len(),
                        def.fields.len()
                    )));
                }
                for ((name, value), (declared, ty)) in fields.iter().zip(&def.fields) {
                    if name != declared || !value.union_type().is_subset(ty) {
                        return Err(CompileError::type_error(format!(
                            "field {}.{} holds {} but is declared {} {}",
                            class,
                            name,
                            value,
                            declared,
                            ty
                        )));
                    }
                    self.check_instance(value)?;
                }
                Ok(())
            }
            Value::Array(items) | Value::Struct(items) => {
                items.iter().try_for_each(|item| self.check_instance(item))
            }
            _ => Ok(()),
        }
    }
}
