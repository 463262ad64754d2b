//! Public entry points: configure a `Compiler`, build graphs from it, and
//! compile, interpret or run them.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::error::{CompileError, Result};
use crate::graph::{CommandGraph, CommandId, DeviceResult, IdSource, StencilStrategy, DEFAULT_BLOCK_SIZE};
use crate::interp::Interpreter;
use crate::program::{Backend, Program};
use crate::translate::CommandTranslator;
use crate::typeck::classes::{ClassDef, ClassRegistry};
use crate::typeck::dispatch::DispatchTable;
use crate::typeck::{TypeInferenceEngine, TypeTable};
use crate::types::{element_type, UnionType, Value};

/// Options controlling compilation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileOptions {
    /// Threads per block for commands that do not set their own.
    pub block_size: usize,
    /// Stencil strategy for commands that do not set their own.
    pub stencil_strategy: StencilStrategy,
    /// Mark each command's code with a `// command N` comment.
    pub debug_comments: bool,
    /// Profile name (e.g. "debug", "release").
    pub profile: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            stencil_strategy: StencilStrategy::default(),
            debug_comments: false,
            profile: "release".to_string(),
        }
    }
}

impl CompileOptions {
    /// Options for a named profile; "debug" turns on source comments.
    pub fn for_profile(profile: &str) -> Self {
        Self {
            debug_comments: profile == "debug",
            profile: profile.to_string(),
            ..Self::default()
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_stencil_strategy(mut self, strategy: StencilStrategy) -> Self {
        self.stencil_strategy = strategy;
        self
    }
}

/// Compiles command graphs against a fixed set of classes and
/// structure-of-arrays fields.
///
/// Graphs created by one compiler share its id source, so commands from
/// different graphs never collide.
pub struct Compiler {
    options: CompileOptions,
    classes: ClassRegistry,
    dispatch: DispatchTable,
    soa_arrays: BTreeMap<String, Vec<Value>>,
    globals: BTreeMap<String, UnionType>,
    ids: IdSource,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompileOptions::default())
    }
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Self {
        Self {
            options,
            classes: ClassRegistry::new(),
            dispatch: DispatchTable::with_builtins(),
            soa_arrays: BTreeMap::new(),
            globals: BTreeMap::new(),
            ids: IdSource::new(),
        }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    /// Register a class whose instances bodies may capture and call.
    pub fn with_class(mut self, class: ClassDef) -> Result<Self> {
        let name = class.name.clone();
        self.classes.register(class)?;
        if let Some(class) = self.classes.get(&name) {
            self.dispatch.register_class(class);
        }
        Ok(self)
    }

    /// Register a structure-of-arrays field every body can read by name.
    pub fn with_soa_array(mut self, name: &str, items: Vec<Value>) -> Result<Self> {
        let element = element_type(&items);
        if element.len() > 1 && !element.is_union_repr() {
            return Err(CompileError::construction(format!(
                "structure-of-arrays field '{}' mixes {} elements",
                name, element
            )));
        }
        self.globals
            .insert(name.to_string(), UnionType::array_of(element));
        self.soa_arrays.insert(name.to_string(), items);
        Ok(self)
    }

    /// An empty graph using this compiler's ids and defaults.
    pub fn new_graph(&self) -> CommandGraph {
        CommandGraph::with_ids(self.ids.clone())
            .with_defaults(self.options.block_size, self.options.stencil_strategy)
    }

    pub fn infer(&self, graph: &CommandGraph, root: CommandId) -> Result<TypeTable> {
        TypeInferenceEngine::new(graph, &self.classes, &self.dispatch, &self.globals).infer(root)
    }

    /// Compile everything `root` depends on into one program.
    #[tracing::instrument(skip(self, graph), fields(root = %root))]
    pub fn compile(&self, graph: &CommandGraph, root: CommandId) -> Result<Program> {
        tracing::info!(commands = graph.len(), profile = %self.options.profile, "compiling");
        let types = self.infer(graph, root)?;
        let program = CommandTranslator::new(
            graph,
            &types,
            &self.classes,
            &self.soa_arrays,
            self.options.debug_comments,
        )
        .translate_program(root)?;
        for warning in &program.warnings {
            tracing::warn!(command = ?warning.command, "{}", warning.message);
        }
        tracing::info!(
            kernels = program.kernel_count(),
            launches = program.launch_count(),
            "compiled"
        );
        Ok(program)
    }

    /// Compile independent graphs in parallel. Results keep the job order.
    pub fn compile_batch(&self, jobs: &[(&CommandGraph, CommandId)]) -> Vec<Result<Program>> {
        jobs.par_iter()
            .map(|(graph, root)| self.compile(graph, *root))
            .collect()
    }

    /// Evaluate `root` on the host.
    pub fn interpret(&self, graph: &CommandGraph, root: CommandId) -> Result<Vec<Value>> {
        let types = self.infer(graph, root)?;
        Interpreter::new(graph, &types, &self.classes, &self.dispatch, &self.soa_arrays)
            .evaluate(root)
    }

    /// Compile and execute `root`, then bind every kept command's device
    /// pointer into the graph so later compilations read it back.
    pub fn run(
        &self,
        graph: &CommandGraph,
        root: CommandId,
        backend: &mut dyn Backend,
    ) -> Result<Vec<Value>> {
        let program = self.compile(graph, root)?;
        tracing::info!(backend = backend.name(), fingerprint = %program.fingerprint, "executing");
        let output = backend.execute(&program)?;
        for (id, pointer) in output.kept {
            let slot = program
                .kept
                .iter()
                .find(|slot| slot.command == id)
                .ok_or_else(|| {
                    CompileError::internal(format!(
                        "backend returned a pointer for command {}, which the program does not keep",
                        id
                    ))
                })?;
            graph.bind_device_result(
                id,
                DeviceResult {
                    pointer,
                    result_type: slot.result_type.clone(),
                },
            )?;
        }
        Ok(output.result)
    }
}
