//! Element types: concrete kinds, union types, and their C representation.

mod value;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};

pub use value::{element_type, Value};

/// C type used for every union of primitive kinds.
pub const UNION_C_TYPE: &str = "union_t";

/// Size in bytes of the tagged `union_t` representation.
pub const UNION_C_SIZE: usize = 8;

/// One concrete element kind.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConcreteType {
    /// The kind of `nil`.
    Void,
    Bool,
    Int,
    Float,
    /// An instance of a registered class.
    Class(String),
    /// A device array whose elements have the given type.
    Array(Box<UnionType>),
    /// A positional struct, as produced by `zip`.
    Struct(Vec<UnionType>),
}

impl ConcreteType {
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            ConcreteType::Void | ConcreteType::Bool | ConcreteType::Int | ConcreteType::Float
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ConcreteType::Int | ConcreteType::Float)
    }

    /// Tag stored in `union_t::class_id` for primitive kinds.
    pub fn class_id(&self) -> Option<u32> {
        match self {
            ConcreteType::Void => Some(0),
            ConcreteType::Int => Some(1),
            ConcreteType::Float => Some(2),
            ConcreteType::Bool => Some(3),
            _ => None,
        }
    }

    /// Name of the `union_t` member holding this kind.
    pub fn union_member(&self) -> Option<&'static str> {
        match self {
            ConcreteType::Int | ConcreteType::Void => Some("int_"),
            ConcreteType::Float => Some("float_"),
            ConcreteType::Bool => Some("bool_"),
            _ => None,
        }
    }

    pub fn c_type(&self) -> Result<String> {
        match self {
            ConcreteType::Void => Ok("void".to_string()),
            ConcreteType::Bool => Ok("bool".to_string()),
            ConcreteType::Int => Ok("int".to_string()),
            ConcreteType::Float => Ok("float".to_string()),
            ConcreteType::Class(name) => Ok(format!("cls_{}_t", name)),
            ConcreteType::Array(inner) => {
                let elem = inner.c_type()?;
                if elem.ends_with('*') {
                    return Err(CompileError::type_error(format!(
                        "nested array type {} has no device representation",
                        self
                    )));
                }
                Ok(format!("{} *", elem))
            }
            ConcreteType::Struct(fields) => struct_c_type(fields),
        }
    }

    /// Size in bytes of one value of this kind on the device.
    pub fn c_size(&self) -> usize {
        match self {
            ConcreteType::Void => 0,
            ConcreteType::Bool => 1,
            ConcreteType::Int | ConcreteType::Float => 4,
            ConcreteType::Array(_) => 8,
            ConcreteType::Class(_) => 8,
            ConcreteType::Struct(fields) => fields.iter().map(UnionType::c_size).sum(),
        }
    }

    /// Zero value of this kind as a C expression.
    pub fn c_zero(&self) -> Result<String> {
        Ok(match self {
            ConcreteType::Void | ConcreteType::Int => "0".to_string(),
            ConcreteType::Float => "0.0f".to_string(),
            ConcreteType::Bool => "false".to_string(),
            ConcreteType::Array(_) => "NULL".to_string(),
            ConcreteType::Class(_) | ConcreteType::Struct(_) => format!("{}{{}}", self.c_type()?),
        })
    }
}

/// Name of the typedef for a positional struct with the given fields.
///
/// `[{int}, {float}]` becomes `indexed_struct_2_lt_int_float_gt_t`.
pub fn struct_c_type(fields: &[UnionType]) -> Result<String> {
    let mut parts = Vec::with_capacity(fields.len());
    for field in fields {
        parts.push(field.c_type()?.replace(" *", "_ptr"));
    }
    Ok(format!(
        "indexed_struct_{}_lt_{}_gt_t",
        fields.len(),
        parts.join("_")
    ))
}

impl fmt::Display for ConcreteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConcreteType::Void => write!(f, "nil"),
            ConcreteType::Bool => write!(f, "bool"),
            ConcreteType::Int => write!(f, "int"),
            ConcreteType::Float => write!(f, "float"),
            ConcreteType::Class(name) => write!(f, "{}", name),
            ConcreteType::Array(inner) => write!(f, "Array<{}>", inner),
            ConcreteType::Struct(fields) => {
                write!(f, "Struct<")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, ">")
            }
        }
    }
}

/// A finite set of concrete kinds an expression may evaluate to.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UnionType(BTreeSet<ConcreteType>);

impl UnionType {
    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    pub fn of(ty: ConcreteType) -> Self {
        Self(BTreeSet::from([ty]))
    }

    pub fn int() -> Self {
        Self::of(ConcreteType::Int)
    }

    pub fn float() -> Self {
        Self::of(ConcreteType::Float)
    }

    pub fn bool() -> Self {
        Self::of(ConcreteType::Bool)
    }

    pub fn void() -> Self {
        Self::of(ConcreteType::Void)
    }

    pub fn array_of(elem: UnionType) -> Self {
        Self::of(ConcreteType::Array(Box::new(elem)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_singleton(&self) -> bool {
        self.0.len() == 1
    }

    /// The only member of a singleton union.
    pub fn singleton(&self) -> Option<&ConcreteType> {
        if self.is_singleton() {
            self.0.iter().next()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConcreteType> {
        self.0.iter()
    }

    pub fn contains(&self, ty: &ConcreteType) -> bool {
        self.0.contains(ty)
    }

    pub fn is_subset(&self, other: &UnionType) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn insert(&mut self, ty: ConcreteType) -> bool {
        self.0.insert(ty)
    }

    /// Add every member of `other`; returns whether anything was new.
    pub fn expand(&mut self, other: &UnionType) -> bool {
        let before = self.0.len();
        self.0.extend(other.0.iter().cloned());
        self.0.len() != before
    }

    pub fn union(&self, other: &UnionType) -> UnionType {
        let mut merged = self.clone();
        merged.expand(other);
        merged
    }

    /// True for multi-member unions stored as `union_t`.
    pub fn is_union_repr(&self) -> bool {
        self.0.len() > 1 && self.0.iter().all(ConcreteType::is_primitive)
    }

    pub fn c_type(&self) -> Result<String> {
        match self.0.len() {
            0 => Ok("void".to_string()),
            1 => self.0.iter().next().map_or_else(|| Ok("void".to_string()), |t| t.c_type()),
            _ if self.is_union_repr() => Ok(UNION_C_TYPE.to_string()),
            _ => Err(CompileError::type_error(format!(
                "union type {} mixes representations that cannot share one device type",
                self
            ))),
        }
    }

    pub fn c_size(&self) -> usize {
        if self.is_union_repr() {
            UNION_C_SIZE
        } else {
            self.0.iter().next().map_or(0, ConcreteType::c_size)
        }
    }

    pub fn c_zero(&self) -> Result<String> {
        if self.is_union_repr() {
            return Ok("union_t_nil()".to_string());
        }
        match self.singleton() {
            Some(ty) => ty.c_zero(),
            None => Ok("0".to_string()),
        }
    }
}

impl From<ConcreteType> for UnionType {
    fn from(ty: ConcreteType) -> Self {
        UnionType::of(ty)
    }
}

impl FromIterator<ConcreteType> for UnionType {
    fn from_iter<I: IntoIterator<Item = ConcreteType>>(iter: I) -> Self {
        UnionType(iter.into_iter().collect())
    }
}

impl fmt::Display for UnionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, ty) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", ty)?;
        }
        write!(f, "}}")
    }
}
