use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ConcreteType, UnionType, UNION_C_SIZE};

/// A host-side runtime value: literals, captured variables, array elements.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i32),
    Float(f32),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    Object {
        class: String,
        fields: Vec<(String, Value)>,
    },
}

impl Value {
    pub fn concrete_type(&self) -> ConcreteType {
        match self {
            Value::Nil => ConcreteType::Void,
            Value::Bool(_) => ConcreteType::Bool,
            Value::Int(_) => ConcreteType::Int,
            Value::Float(_) => ConcreteType::Float,
            Value::Array(items) => ConcreteType::Array(Box::new(element_type(items))),
            Value::Struct(fields) => {
                ConcreteType::Struct(fields.iter().map(Value::union_type).collect())
            }
            Value::Object { class, .. } => ConcreteType::Class(class.clone()),
        }
    }

    pub fn union_type(&self) -> UnionType {
        UnionType::of(self.concrete_type())
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// Ruby truthiness: only `nil` and `false` are false.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Int(v) => Some(*v as f32),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// C literal for primitive values; aggregates have none.
    pub fn c_literal(&self) -> Option<String> {
        match self {
            Value::Nil => Some("0".to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) => Some(float_literal(*v)),
            _ => None,
        }
    }

    /// Device size in bytes of this value stored by value.
    pub fn c_size(&self) -> usize {
        match self {
            Value::Nil => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 4,
            Value::Array(_) => 8,
            Value::Struct(fields) => fields.iter().map(Value::c_size).sum(),
            Value::Object { fields, .. } => fields.iter().map(|(_, v)| v.c_size()).sum(),
        }
    }

    /// Element size for an array of values of the given element type.
    pub fn element_size(items: &[Value], elem: &UnionType) -> usize {
        if elem.is_union_repr() {
            UNION_C_SIZE
        } else {
            items.first().map_or(0, Value::c_size)
        }
    }

    /// Coerce into the given element type, widening int to float where needed.
    pub fn coerce_to(&self, ty: &UnionType) -> Value {
        match self {
            Value::Int(v)
                if !ty.contains(&ConcreteType::Int) && ty.contains(&ConcreteType::Float) =>
            {
                Value::Float(*v as f32)
            }
            other => other.clone(),
        }
    }
}

/// Union of the element types of `items`.
pub fn element_type(items: &[Value]) -> UnionType {
    items.iter().map(Value::concrete_type).collect()
}

fn float_literal(v: f32) -> String {
    if v.is_nan() {
        "NAN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 {
            "INFINITY".to_string()
        } else {
            "(-INFINITY)".to_string()
        }
    } else {
        format!("{:?}f", v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Array(items) | Value::Struct(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Object { class, fields } => {
                write!(f, "#<{}", class)?;
                for (name, value) in fields {
                    write!(f, " {}={}", name, value)?;
                }
                write!(f, ">")
            }
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
