//! Host-side environment: every value a kernel reads that is not a thread
//! input, collected under deterministic, collision-free field names and
//! transferred to the device as one struct.


use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};
use crate::graph::{CommandId, DevicePtr};
use crate::types::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Storage {
    /// Stored by value in the environment struct.
    Scalar,
    /// Copied to device memory; the struct holds the pointer.
    Array,
    /// Device pointer holding a kept command's result across kernels.
    PreviousSlot,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EnvValue {
    Value(Value),
    /// A pointer a backend already produced.
    Pointer(DevicePtr),
    /// A slot the backend must allocate before the first launch.
    Null,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvEntry {
    pub name: String,
    pub value: EnvValue,
    pub storage: Storage,
    /// Value type for scalars, element type for arrays and slots.
    pub c_type: String,
    /// Element count; 1 for scalars.
    pub len: usize,
    pub elem_size: usize,
}

impl EnvEntry {
    /// Type of the struct member holding this entry.
    pub fn field_type(&self) -> String {
        match self.storage {
            Storage::Scalar => self.c_type.clone(),
            Storage::Array => format!("{} *", self.c_type),
            Storage::PreviousSlot => "void *".to_string(),
        }
    }

    pub fn bytes(&self) -> usize {
        self.len * self.elem_size
    }
}

/// One pre-launch transfer, in field declaration order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceCopy {
    CopyArray { field: String, bytes: usize },
    AllocateSlot { field: String, bytes: usize },
}

/// The finished environment handed to a backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentLayout {
    pub entries: Vec<EnvEntry>,
    /// Ordered (field, C type) list of `environment_t`.
    pub fields: Vec<(String, String)>,
    pub copies: Vec<DeviceCopy>,
}

impl EnvironmentLayout {
    pub fn entry(&self, name: &str) -> Option<&EnvEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// `environment_t` definition.
    pub fn struct_source(&self) -> String {
        let mut text = String::from("typedef struct environment_struct {\n");
        for (name, c_type) in &self.fields {
            text.push_str(&format!("    {} {};\n", c_type, name));
        }
        if self.fields.is_empty() {
            text.push_str("    int _unused_;\n");
        }
        text.push_str("} environment_t;\n");
        text
    }
}

pub fn capture_field(id: CommandId, name: &str) -> String {
    format!("l{}_{}", id, name)
}

pub fn base_field(id: CommandId) -> String {
    format!("b{}_base", id)
}

pub fn slot_field(id: CommandId) -> String {
    format!("prev_{}", id)
}

pub fn size_field(array_field: &str) -> String {
    match array_field.strip_suffix("_base") {
        Some(prefix) => format!("{}_size", prefix),
        None => format!("{}_size", array_field),
    }
}

/// What a field holds, independent of the name it was given.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum FieldKey {
    Capture(CommandId, String),
    CaptureSize(CommandId, String),
    Base(CommandId),
    BaseSize(CommandId),
    Soa(String),
    SoaSize(String),
    Slot(CommandId),
}

impl FieldKey {
    fn size_of(&self) -> Option<FieldKey> {
        match self {
            FieldKey::Capture(id, name) => Some(FieldKey::CaptureSize(*id, name.clone())),
            FieldKey::Base(id) => Some(FieldKey::BaseSize(*id)),
            FieldKey::Soa(name) => Some(FieldKey::SoaSize(name.clone())),
            _ => None,
        }
    }
}

/// Collects environment fields. Each field gets its conventional name
/// unless another field already holds it, in which case `_<n>` is appended
/// until the name is free.
#[derive(Debug, Default)]
pub struct EnvironmentBuilder {
    entries: Vec<EnvEntry>,
    index: BTreeMap<String, usize>,
    keys: BTreeMap<FieldKey, usize>,
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&EnvEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    /// Field holding a kept command's slot, once allocated or bound.
    pub fn slot_name(&self, id: CommandId) -> Option<&str> {
        self.keys
            .get(&FieldKey::Slot(id))
            .map(|&i| self.entries[i].name.as_str())
    }

    /// Lexical scalar capture of a command, stored as `l<id>_<name>`.
    pub fn add_scalar(
        &mut self,
        id: CommandId,
        name: &str,
        value: Value,
        c_type: String,
    ) -> Result<String> {
        let elem_size = value.c_size();
        self.insert(
            FieldKey::Capture(id, name.to_string()),
            capture_field(id, name),
            EnvValue::Value(value),
            Storage::Scalar,
            c_type,
            1,
            elem_size,
        )
    }

    /// Lexical array capture: `l<id>_<name>` plus `l<id>_<name>_size`.
    pub fn add_array(
        &mut self,
        id: CommandId,
        name: &str,
        items: Vec<Value>,
        elem_c_type: String,
        elem_size: usize,
    ) -> Result<(String, String)> {
        self.add_array_field(
            FieldKey::Capture(id, name.to_string()),
            capture_field(id, name),
            items,
            elem_c_type,
            elem_size,
        )
    }

    /// Materialized input array of an identity command.
    pub fn add_base_array(
        &mut self,
        id: CommandId,
        items: Vec<Value>,
        elem_c_type: String,
        elem_size: usize,
    ) -> Result<(String, String)> {
        self.add_array_field(FieldKey::Base(id), base_field(id), items, elem_c_type, elem_size)
    }

    /// Structure-of-arrays field, shared by name across commands.
    pub fn add_soa_array(
        &mut self,
        name: &str,
        items: Vec<Value>,
        elem_c_type: String,
        elem_size: usize,
    ) -> Result<(String, String)> {
        self.add_array_field(
            FieldKey::Soa(name.to_string()),
            name.to_string(),
            items,
            elem_c_type,
            elem_size,
        )
    }

    fn add_array_field(
        &mut self,
        key: FieldKey,
        preferred: String,
        items: Vec<Value>,
        elem_c_type: String,
        elem_size: usize,
    ) -> Result<(String, String)> {
        let size_key = key
            .size_of()
            .ok_or_else(|| CompileError::internal(format!("{:?} has no size field", key)))?;
        let len = items.len();
        let field = self.insert(
            key,
            preferred.clone(),
            EnvValue::Value(Value::Array(items)),
            Storage::Array,
            elem_c_type,
            len,
            elem_size,
        )?;
        let size = self.insert(
            size_key,
            size_field(&preferred),
            EnvValue::Value(Value::Int(len as i32)),
            Storage::Scalar,
            "int".to_string(),
            1,
            4,
        )?;
        Ok((field, size))
    }

    /// Reserve `prev_<id>` for a kept command; the backend allocates it.
    pub fn allocate_previous_slot(
        &mut self,
        id: CommandId,
        elem_c_type: String,
        len: usize,
        elem_size: usize,
    ) -> Result<String> {
        if let Some(&i) = self.keys.get(&FieldKey::Slot(id)) {
            let existing = &self.entries[i];
            if matches!(existing.value, EnvValue::Pointer(_)) {
                return Ok(existing.name.clone());
            }
        }
        self.insert(
            FieldKey::Slot(id),
            slot_field(id),
            EnvValue::Null,
            Storage::PreviousSlot,
            elem_c_type,
            len,
            elem_size,
        )
    }

    /// Bind the pointer a backend returned for a kept command.
    ///
    /// The pointer is reused verbatim; binding a different pointer to the
    /// same slot is an internal fault.
    pub fn bind_previous_result(
        &mut self,
        id: CommandId,
        pointer: DevicePtr,
        elem_c_type: String,
        len: usize,
        elem_size: usize,
    ) -> Result<String> {
        if pointer.is_null() {
            return Err(CompileError::internal(format!(
                "cannot bind a null pointer to {}",
                slot_field(id)
            )));
        }
        if let Some(&i) = self.keys.get(&FieldKey::Slot(id)) {
            let entry = &mut self.entries[i];
            return match entry.value {
                EnvValue::Null => {
                    entry.value = EnvValue::Pointer(pointer);
                    Ok(entry.name.clone())
                }
                EnvValue::Pointer(existing) if existing == pointer => Ok(entry.name.clone()),
                _ => Err(CompileError::internal(format!(
                    "{} is already bound to a different value",
                    entry.name
                ))),
            };
        }
        self.insert(
            FieldKey::Slot(id),
            slot_field(id),
            EnvValue::Pointer(pointer),
            Storage::PreviousSlot,
            elem_c_type,
            len,
            elem_size,
        )
    }

    /// Add the field for `key` and return its name. Re-adding identical
    /// contents is a no-op; different contents for the same key are an
    /// internal fault.
    #[allow(clippy::too_many_arguments)]
    fn insert(
        &mut self,
        key: FieldKey,
        preferred: String,
        value: EnvValue,
        storage: Storage,
        c_type: String,
        len: usize,
        elem_size: usize,
    ) -> Result<String> {
        if let Some(&i) = self.keys.get(&key) {
            let existing = &self.entries[i];
            if existing.value == value
                && existing.storage == storage
                && existing.c_type == c_type
                && existing.len == len
                && existing.elem_size == elem_size
            {
                return Ok(existing.name.clone());
            }
            return Err(CompileError::internal(format!(
                "environment field {} added twice with different contents",
                existing.name
            )));
        }
        let mut name = preferred.clone();
        let mut suffix = 1;
        while self.index.contains_key(&name) {
            name = format!("{}_{}", preferred, suffix);
            suffix += 1;
        }
        if name != preferred {
            tracing::debug!(%preferred, field = %name, "renamed colliding environment field");
        }
        tracing::debug!(field = %name, storage = ?storage, c_type = %c_type, "environment field");
        let i = self.entries.len();
        self.index.insert(name.clone(), i);
        self.keys.insert(key, i);
        self.entries.push(EnvEntry {
            name: name.clone(),
            value,
            storage,
            c_type,
            len,
            elem_size,
        });
        Ok(name)
    }

    /// Ordered field/type list of `environment_t`.
    pub fn build_struct_layout(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|entry| (entry.name.clone(), entry.field_type()))
            .collect()
    }

    /// Transfers the backend performs before the first launch.
    pub fn build_device_copy_sequence(&self) -> Vec<DeviceCopy> {
        self.entries
            .iter()
            .filter_map(|entry| match (&entry.storage, &entry.value) {
                (Storage::Array, _) => Some(DeviceCopy::CopyArray {
                    field: entry.name.clone(),
                    bytes: entry.bytes(),
                }),
                (Storage::PreviousSlot, EnvValue::Null) => Some(DeviceCopy::AllocateSlot {
                    field: entry.name.clone(),
                    bytes: entry.bytes(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn build(self) -> EnvironmentLayout {
        EnvironmentLayout {
            fields: self.build_struct_layout(),
            copies: self.build_device_copy_sequence(),
            entries: self.entries,
        }
    }
}
