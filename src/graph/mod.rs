//! The command graph: lazily-built array operations wired by typed input edges.
//!
//! Commands are immutable once added. The only state filled in later is the
//! memoized inference result and, for `keep` commands, the device pointer a
//! backend hands back after execution.

pub mod cycle;
mod spec;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::ast::Block;
use crate::error::{CompileError, Result};
use crate::typeck::CommandTypes;
use crate::types::{UnionType, Value};

pub use spec::{offsets_1d, CommandSpec};

/// Default threads per block.
pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// Process-unique command identifier; strictly increasing, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host call site that created a command from inside a parallel section.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GeneratorSite(pub u64);

/// Shared monotonic id counter. Clones hand out ids from the same sequence,
/// so graphs built concurrently from one source never collide.
#[derive(Clone, Debug)]
pub struct IdSource(Arc<AtomicU64>);

impl IdSource {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    pub fn next_id(&self) -> CommandId {
        CommandId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdSource {
    fn default() -> Self {
        Self::new()
    }
}

/// How a consumer reads its producer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessPattern {
    /// One element per thread, at the thread's own index. Always fused.
    ByThreadId,
    /// The whole producer array. Always starts a new kernel.
    Entire,
}

/// How a stencil passes gathered neighbors into its body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StencilStrategy {
    /// The body takes one array parameter holding every neighbor.
    #[default]
    ParameterArray,
    /// The body takes one scalar parameter per offset.
    SeparateScalars,
}

impl StencilStrategy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "parameter_array" | "array" => Some(StencilStrategy::ParameterArray),
            "separate_scalars" | "scalars" => Some(StencilStrategy::SeparateScalars),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StencilStrategy::ParameterArray => "parameter_array",
            StencilStrategy::SeparateScalars => "separate_scalars",
        }
    }
}

/// Neighborhood description carried by a stencil's input edge.
#[derive(Clone, Debug, PartialEq)]
pub struct StencilAccess {
    /// One index vector per neighbor, each with one entry per dimension.
    pub offsets: Vec<Vec<i64>>,
    /// Substituted for every neighbor that falls outside the array.
    pub fallback: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Input {
    pub producer: CommandId,
    pub pattern: AccessPattern,
    pub stencil: Option<StencilAccess>,
}

impl Input {
    pub fn by_thread_id(producer: CommandId) -> Self {
        Self {
            producer,
            pattern: AccessPattern::ByThreadId,
            stencil: None,
        }
    }

    pub fn entire(producer: CommandId) -> Self {
        Self {
            producer,
            pattern: AccessPattern::Entire,
            stencil: None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum CommandKind {
    /// Root generating thread ids.
    Index,
    /// Root wrapping an already materialized array, frozen on construction.
    Identity { array: Arc<[Value]> },
    Combine { body: Block, with_index: bool },
    Zip,
    Reduce {
        body: Block,
        /// Operator the body was desugared from, if any.
        operator: Option<String>,
    },
    Stencil {
        body: Block,
        strategy: StencilStrategy,
        with_index: bool,
    },
}

/// Discriminant of `CommandKind`, used to look up lowerings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Variant {
    Index,
    Identity,
    Combine,
    Zip,
    Reduce,
    Stencil,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Variant::Index => "Index",
            Variant::Identity => "Identity",
            Variant::Combine => "Combine",
            Variant::Zip => "Zip",
            Variant::Reduce => "Reduce",
            Variant::Stencil => "Stencil",
        };
        write!(f, "{}", name)
    }
}

/// Opaque device address returned by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// A materialized result living on the device.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceResult {
    pub pointer: DevicePtr,
    pub result_type: UnionType,
}

#[derive(Debug)]
pub struct Command {
    pub id: CommandId,
    pub dimensions: Vec<usize>,
    pub block_size: usize,
    pub keep: bool,
    pub inputs: Vec<Input>,
    pub kind: CommandKind,
    pub generator: Option<GeneratorSite>,
    inferred: OnceLock<Arc<CommandTypes>>,
    device_result: OnceLock<DeviceResult>,
}

impl Command {
    pub fn variant(&self) -> Variant {
        match self.kind {
            CommandKind::Index => Variant::Index,
            CommandKind::Identity { .. } => Variant::Identity,
            CommandKind::Combine { .. } => Variant::Combine,
            CommandKind::Zip => Variant::Zip,
            CommandKind::Reduce { .. } => Variant::Reduce,
            CommandKind::Stencil { .. } => Variant::Stencil,
        }
    }

    /// Number of elements, the product of the dimensions.
    pub fn size(&self) -> usize {
        self.dimensions.iter().product()
    }

    pub fn body(&self) -> Option<&Block> {
        match &self.kind {
            CommandKind::Combine { body, .. }
            | CommandKind::Reduce { body, .. }
            | CommandKind::Stencil { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Memoized inference result, if this command was inferred before.
    pub fn inferred(&self) -> Option<&Arc<CommandTypes>> {
        self.inferred.get()
    }

    pub fn result_type(&self) -> Option<&UnionType> {
        self.device_result
            .get()
            .map(|d| &d.result_type)
            .or_else(|| self.inferred.get().map(|t| &t.result))
    }

    pub(crate) fn memoize(&self, types: Arc<CommandTypes>) -> Arc<CommandTypes> {
        self.inferred.get_or_init(|| types).clone()
    }

    pub fn device_result(&self) -> Option<&DeviceResult> {
        self.device_result.get()
    }

    pub fn stencil_access(&self) -> Option<&StencilAccess> {
        self.inputs.first().and_then(|input| input.stencil.as_ref())
    }

    fn reset_caches(&mut self) {
        self.inferred = OnceLock::new();
    }
}

/// Owner of all commands built from one id source.
#[derive(Debug)]
pub struct CommandGraph {
    ids: IdSource,
    commands: BTreeMap<CommandId, Command>,
    block_size: usize,
    stencil_strategy: StencilStrategy,
}

impl Default for CommandGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandGraph {
    pub fn new() -> Self {
        Self::with_ids(IdSource::new())
    }

    /// A graph drawing ids from a shared source.
    pub fn with_ids(ids: IdSource) -> Self {
        Self {
            ids,
            commands: BTreeMap::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            stencil_strategy: StencilStrategy::default(),
        }
    }

    /// Defaults applied to specs that leave block size or strategy unset.
    pub fn with_defaults(mut self, block_size: usize, stencil_strategy: StencilStrategy) -> Self {
        self.block_size = block_size;
        self.stencil_strategy = stencil_strategy;
        self
    }

    pub fn ids(&self) -> &IdSource {
        &self.ids
    }

    pub fn default_block_size(&self) -> usize {
        self.block_size
    }

    pub fn default_stencil_strategy(&self) -> StencilStrategy {
        self.stencil_strategy
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn command(&self, id: CommandId) -> Option<&Command> {
        self.commands.get(&id)
    }

    /// Like `command`, but a missing id is an internal fault.
    pub fn get(&self, id: CommandId) -> Result<&Command> {
        self.commands
            .get(&id)
            .ok_or_else(|| CompileError::internal(format!("unknown command {}", id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    /// Point input `index` of `consumer` at a different producer.
    ///
    /// The producer must have the same shape as the one it replaces, so the
    /// consumer's dimensions stay valid. This is the only way to form a
    /// genuine cycle, which inference then reports. All memoized types are
    /// dropped.
    pub fn rewire_input(
        &mut self,
        consumer: CommandId,
        index: usize,
        producer: CommandId,
    ) -> Result<()> {
        let new_dims = self
            .command(producer)
            .map(|c| c.dimensions.clone())
            .ok_or_else(|| {
                CompileError::construction(format!("unknown producer {}", producer))
                    .in_command(consumer)
            })?;
        let old_producer = self
            .command(consumer)
            .and_then(|c| c.inputs.get(index))
            .map(|input| input.producer)
            .ok_or_else(|| {
                CompileError::construction(format!("no input {} to rewire", index))
                    .in_command(consumer)
            })?;
        let old_dims = &self.get(old_producer)?.dimensions;
        if *old_dims != new_dims {
            return Err(CompileError::construction(format!(
                "cannot rewire input {} from shape {:?} to shape {:?}",
                index, old_dims, new_dims
            ))
            .in_command(consumer));
        }
        if let Some(input) = self
            .commands
            .get_mut(&consumer)
            .and_then(|c| c.inputs.get_mut(index))
        {
            input.producer = producer;
        }
        for command in self.commands.values_mut() {
            command.reset_caches();
        }
        tracing::debug!(%consumer, index, %producer, "rewired input");
        Ok(())
    }

    /// Record the device pointer a backend produced for a `keep` command.
    ///
    /// Once set, the pointer is final: binding the same pointer again is a
    /// no-op, binding a different one is rejected.
    pub fn bind_device_result(&self, id: CommandId, result: DeviceResult) -> Result<()> {
        let command = self
            .command(id)
            .ok_or_else(|| CompileError::construction(format!("unknown command {}", id)))?;
        if !command.keep {
            return Err(CompileError::construction(
                "only commands marked keep can hold a device result",
            )
            .in_command(id));
        }
        if result.pointer.is_null() {
            return Err(CompileError::internal(format!(
                "backend returned a null pointer for kept command {}",
                id
            )));
        }
        let stored = command.device_result.get_or_init(|| result.clone());
        if stored.pointer != result.pointer {
            return Err(CompileError::internal(format!(
                "kept command {} already bound to {:#x}, refusing {:#x}",
                id, stored.pointer.0, result.pointer.0
            )));
        }
        Ok(())
    }

    fn insert(&mut self, command: Command) -> CommandId {
        let id = command.id;
        tracing::debug!(command = %id, variant = %command.variant(), "added command");
        self.commands.insert(id, command);
        id
    }
}
