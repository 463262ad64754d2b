//! A compiled program: kernel source, launch plan, buffers and environment.
//!
//! Everything here is plain data a backend consumes. Launches run in order,
//! synchronously; each sees the writes of every launch before it.


use serde::{Deserialize, Serialize};

use crate::diagnostic::Diagnostic;
use crate::env::EnvironmentLayout;
use crate::error::Result;
use crate::graph::{CommandId, DevicePtr};
use crate::translate::reduce::ReductionPlan;
use crate::types::{UnionType, Value};

/// Device buffer allocated by the backend for kernel outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufferId(pub u32);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub buffer: BufferId,
    pub len: usize,
    pub c_type: String,
    pub elem_size: usize,
}

impl Allocation {
    pub fn bytes(&self) -> usize {
        self.len * self.elem_size
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    pub index: usize,
    pub name: String,
    /// Command whose value the kernel writes per thread.
    pub root: CommandId,
    pub num_threads: usize,
    pub block_size: usize,
    pub result_c_type: String,
    pub output: BufferId,
    pub write_back: bool,
    pub reduction: Option<ReductionPlan>,
    /// Commands fused into this kernel, producers first.
    pub commands: Vec<CommandId>,
}

/// One positional kernel argument.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaunchArg {
    /// Device copy of `environment_t`.
    Environment,
    /// The launch's thread count.
    NumThreads,
    Buffer(BufferId),
    /// Pointer stored in an environment slot.
    Slot(String),
    Flag(bool),
    Null,
}

/// Whether a launch's output buffer is allocated fresh or already exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputBinding {
    Fresh(BufferId),
    Reuse(BufferId),
}

impl OutputBinding {
    pub fn buffer(&self) -> BufferId {
        match self {
            OutputBinding::Fresh(buffer) | OutputBinding::Reuse(buffer) => *buffer,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Launch {
    /// Index into `Program::kernels`.
    pub kernel: usize,
    pub num_threads: usize,
    pub block_size: usize,
    pub num_blocks: usize,
    pub args: Vec<LaunchArg>,
    pub output: OutputBinding,
    pub write_back: bool,
    /// Reduction this launch is a pass of.
    pub reduction: Option<CommandId>,
}

/// A kept command's device slot, bound after execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeptSlot {
    pub command: CommandId,
    pub field: String,
    pub len: usize,
    pub result_type: UnionType,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgramResult {
    pub buffer: BufferId,
    pub len: usize,
    pub result_type: UnionType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Program {
    pub source: String,
    pub kernels: Vec<Kernel>,
    pub launches: Vec<Launch>,
    pub allocations: Vec<Allocation>,
    pub environment: EnvironmentLayout,
    pub kept: Vec<KeptSlot>,
    pub result: ProgramResult,
    #[serde(skip)]
    pub warnings: Vec<Diagnostic>,
    /// Hex blake3 hash of the source and launch plan.
    pub fingerprint: String,
}

impl Program {
    pub fn kernel_count(&self) -> usize {
        self.kernels.len()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.len()
    }

    /// Launches that are passes of the given reduction.
    pub fn reduction_launches(&self, reduce: CommandId) -> Vec<&Launch> {
        self.launches
            .iter()
            .filter(|launch| launch.reduction == Some(reduce))
            .collect()
    }

    pub fn kernel_for(&self, root: CommandId) -> Option<&Kernel> {
        self.kernels.iter().find(|kernel| kernel.root == root)
    }

    pub fn allocation(&self, buffer: BufferId) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.buffer == buffer)
    }

    /// Buffers launches allocate fresh, in launch order.
    pub fn fresh_buffers(&self) -> Vec<BufferId> {
        self.launches
            .iter()
            .filter_map(|launch| match launch.output {
                OutputBinding::Fresh(buffer) => Some(buffer),
                OutputBinding::Reuse(_) => None,
            })
            .collect()
    }
}

pub fn fingerprint(source: &str, launches: &[Launch]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_bytes());
    hasher.update(format!("{:?}", launches).as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// What a backend hands back after running a program.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendOutput {
    /// Elements of the root command's result.
    pub result: Vec<Value>,
    /// Device pointers of every kept slot the program populated.
    pub kept: Vec<(CommandId, DevicePtr)>,
}

/// Executes compiled programs on a device.
pub trait Backend {
    fn name(&self) -> &str;

    fn execute(&mut self, program: &Program) -> Result<BackendOutput>;
}
