use std::collections::BTreeMap;

use crate::graph::{Command, CommandId};
use crate::program::{BufferId, LaunchArg};
use crate::types::UnionType;

use super::reduce::ReductionPlan;

/// Where a whole-array operand lives once its producer kernel is sealed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperandSource {
    /// Output buffer of an earlier kernel.
    Kernel(BufferId),
    /// A kept command's environment slot.
    Slot(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArrayOperand {
    pub producer: CommandId,
    pub source: OperandSource,
    pub len: usize,
    pub elem_type: UnionType,
    pub c_type: String,
}

impl ArrayOperand {
    pub fn launch_arg(&self) -> LaunchArg {
        match &self.source {
            OperandSource::Kernel(buffer) => LaunchArg::Buffer(*buffer),
            OperandSource::Slot(field) => LaunchArg::Slot(field.clone()),
        }
    }
}

/// Extra kernel parameter after the fixed ones.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct KernelParam {
    pub decl: String,
    pub arg: LaunchArg,
}

/// A reduction hosted by a kernel scope.
#[derive(Clone, Debug)]
pub(super) struct ReductionSite {
    pub command: CommandId,
    pub plan: ReductionPlan,
    pub input: ArrayOperand,
    pub block_fn: String,
    pub block_size: usize,
    /// Element type.
    pub c_type: String,
}

/// A kernel under construction.
#[derive(Debug)]
pub(super) struct KernelScope {
    pub serial: usize,
    pub root: CommandId,
    pub num_threads: usize,
    pub block_size: usize,
    pub write_back: bool,
    pub params: Vec<KernelParam>,
    /// Values already computed in this kernel, by command.
    pub values: BTreeMap<CommandId, String>,
    pub reduction: Option<ReductionSite>,
    /// Commands lowered here, producers first.
    pub commands: Vec<CommandId>,
}

impl KernelScope {
    pub fn new(serial: usize, root: &Command, write_back: bool) -> Self {
        Self {
            serial,
            root: root.id,
            num_threads: root.size(),
            block_size: root.block_size,
            write_back,
            params: Vec::new(),
            values: BTreeMap::new(),
            reduction: None,
            commands: Vec::new(),
        }
    }

    pub fn add_param(&mut self, decl: String, arg: LaunchArg) {
        if !self.params.iter().any(|p| p.decl == decl) {
            self.params.push(KernelParam { decl, arg });
        }
    }

    /// Record a command lowered in this kernel.
    pub fn remember(&mut self, id: CommandId, expr: &str) {
        if self.values.insert(id, expr.to_string()).is_none() {
            self.commands.push(id);
        }
    }

    /// Reuse a value this kernel reads but does not compute.
    pub fn cache(&mut self, id: CommandId, expr: &str) {
        self.values.insert(id, expr.to_string());
    }
}
