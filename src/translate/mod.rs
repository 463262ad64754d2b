//! Lowering of a typed command graph into fused kernels.
//!
//! Element-wise (`ByThreadId`) edges are fused: the producer's value is
//! computed inline in the consumer's kernel. Whole-array (`Entire`) edges
//! seal the producer into its own kernel whose output buffer the consumer
//! reads. Commands with more than one element-wise consumer in a kernel are
//! computed once into a temporary; kept commands are computed once and
//! written to an environment slot later kernels read back.

mod lowering;
pub mod reduce;
mod scope;
mod stencil;
#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};

use crate::diagnostic::Diagnostic;
use crate::env::EnvironmentBuilder;
use crate::error::{CompileError, Result};
use crate::graph::{AccessPattern, Command, CommandGraph, CommandId};
use crate::program::{
    fingerprint, Allocation, BufferId, Kernel, KeptSlot, Launch, LaunchArg, OutputBinding,
    Program, ProgramResult,
};
use crate::typeck::classes::ClassRegistry;
use crate::typeck::TypeTable;
use crate::types::{UnionType, Value};
use crate::codegen::CodegenContext;

pub use lowering::{lowering_for, LowerFn};
pub use reduce::{plan_reduction, ReductionPlan, ReductionStep};
pub use scope::{ArrayOperand, OperandSource};
pub use stencil::{neighbor_index, row_major_multipliers};

use scope::{KernelScope, ReductionSite};

/// Statements computing a command and the expression holding its value.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandTranslation {
    pub execution: Vec<String>,
    pub result: String,
    pub result_type: UnionType,
}

impl CommandTranslation {
    pub fn value(result: String, result_type: UnionType) -> Self {
        Self {
            execution: Vec::new(),
            result,
            result_type,
        }
    }
}

pub struct CommandTranslator<'a> {
    graph: &'a CommandGraph,
    types: &'a TypeTable,
    soa_arrays: &'a BTreeMap<String, Vec<Value>>,
    codegen: CodegenContext<'a>,
    env: EnvironmentBuilder,
    scopes: Vec<KernelScope>,
    next_serial: usize,
    /// Element-wise consumer count per producer.
    fan_in: BTreeMap<CommandId, usize>,
    /// Producers read whole by at least one consumer.
    entire_consumed: BTreeSet<CommandId>,
    sealed_outputs: BTreeMap<CommandId, ArrayOperand>,
    /// Scope that writes each kept command's slot.
    kept_home: BTreeMap<CommandId, usize>,
    sealed_scopes: BTreeSet<usize>,
    kernels: Vec<Kernel>,
    kernel_sources: Vec<String>,
    launches: Vec<Launch>,
    allocations: Vec<Allocation>,
    kept: Vec<KeptSlot>,
    warnings: Vec<Diagnostic>,
}

impl<'a> CommandTranslator<'a> {
    pub fn new(
        graph: &'a CommandGraph,
        types: &'a TypeTable,
        classes: &'a ClassRegistry,
        soa_arrays: &'a BTreeMap<String, Vec<Value>>,
        debug_comments: bool,
    ) -> Self {
        let mut fan_in = BTreeMap::new();
        let mut entire_consumed = BTreeSet::new();
        for id in &types.order {
            if let Some(command) = graph.command(*id) {
                for input in &command.inputs {
                    if input.pattern == AccessPattern::ByThreadId {
                        *fan_in.entry(input.producer).or_insert(0) += 1;
                    } else {
                        entire_consumed.insert(input.producer);
                    }
                }
            }
        }
        Self {
            graph,
            types,
            soa_arrays,
            codegen: CodegenContext::new(classes, debug_comments),
            env: EnvironmentBuilder::new(),
            scopes: Vec::new(),
            next_serial: 0,
            fan_in,
            entire_consumed,
            sealed_outputs: BTreeMap::new(),
            kept_home: BTreeMap::new(),
            sealed_scopes: BTreeSet::new(),
            kernels: Vec::new(),
            kernel_sources: Vec::new(),
            launches: Vec::new(),
            allocations: Vec::new(),
            kept: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Translate everything reachable from `root` into a program.
    ///
    /// The root's kernel is the last one and the only one whose output is
    /// written back to the host.
    pub fn translate_program(mut self, root: CommandId) -> Result<Program> {
        let graph = self.graph;
        let table = self.types;
        self.codegen.emit_methods(&table.methods)?;
        let command = graph.get(root)?;
        self.push_scope(command, true);
        let translation = self.translate(root)?;
        let (_, buffer) = self.seal(translation)?;

        let result_type = table.result(root)?.clone();
        let mut source = self.codegen.preamble();
        let environment = self.env.build();
        if !source.is_empty() {
            source.push('\n');
        }
        source.push_str(&environment.struct_source());
        let functions = self.codegen.functions();
        if !functions.is_empty() {
            source.push('\n');
            source.push_str(&functions);
        }
        for kernel in &self.kernel_sources {
            source.push('\n');
            source.push_str(kernel);
        }
        let fingerprint = fingerprint(&source, &self.launches);
        tracing::info!(
            kernels = self.kernels.len(),
            launches = self.launches.len(),
            fields = environment.fields.len(),
            %fingerprint,
            "translated program"
        );
        Ok(Program {
            source,
            kernels: self.kernels,
            launches: self.launches,
            allocations: self.allocations,
            environment,
            kept: self.kept,
            result: ProgramResult {
                buffer,
                len: command.size(),
                result_type,
            },
            warnings: self.warnings,
            fingerprint,
        })
    }

    /// Translate one command into the innermost open kernel.
    pub fn translate(&mut self, id: CommandId) -> Result<CommandTranslation> {
        let graph = self.graph;
        let table = self.types;
        let command = graph.get(id)?;
        let result_type = table.result(id)?.clone();
        if let Some(expr) = self.scope()?.values.get(&id) {
            return Ok(CommandTranslation::value(expr.clone(), result_type));
        }
        if self.needs_own_kernel(command)? {
            // A whole-array consumer needs the kept value as a buffer, so it
            // is computed once in its own kernel and read back from the slot.
            self.translate_entire(id)?;
        }
        if let Some(expr) = self.read_slot(command, &result_type)? {
            self.scope_mut()?.cache(id, &expr);
            return Ok(CommandTranslation::value(expr, result_type));
        }
        tracing::debug!(command = %id, variant = %command.variant(), "translating");

        let lower = lowering_for(command.variant())?;
        let mut translation = lower(self, command)?;
        let c_type = self.codegen.c_type(&result_type)?;
        let shared = self.fan_in.get(&id).copied().unwrap_or(0) > 1;
        let first_keep = command.keep && !self.kept_home.contains_key(&id);
        if self.codegen.debug_comments() {
            translation
                .execution
                .push(format!("// command {} ({})", id, command.variant()));
        }
        if shared || first_keep {
            let temp = format!("_temp_result_{}", id);
            translation
                .execution
                .push(format!("{} {} = {};", c_type, temp, translation.result));
            translation.result = temp;
        }
        if first_keep {
            self.write_slot(command, &c_type, &result_type, &mut translation)?;
        }
        self.scope_mut()?.remember(id, &translation.result);
        Ok(translation)
    }

    /// Kept commands with a whole-array consumer are sealed into their own
    /// kernel before anything reads them.
    fn needs_own_kernel(&self, command: &Command) -> Result<bool> {
        Ok(command.keep
            && command.device_result().is_none()
            && self.entire_consumed.contains(&command.id)
            && !self.kept_home.contains_key(&command.id)
            && self.scope()?.root != command.id)
    }

    /// Slot read for commands whose value already lives on the device.
    fn read_slot(&mut self, command: &Command, ty: &UnionType) -> Result<Option<String>> {
        let id = command.id;
        if let Some(device) = command.device_result() {
            let c_type = self.codegen.c_type(ty)?;
            let field = self.env.bind_previous_result(
                id,
                device.pointer,
                c_type.clone(),
                command.size(),
                ty.c_size(),
            )?;
            return Ok(Some(format!("(({} *) _env_->{})[_tid_]", c_type, field)));
        }
        let sealed = self
            .kept_home
            .get(&id)
            .is_some_and(|serial| self.sealed_scopes.contains(serial));
        if command.keep && sealed {
            let c_type = self.codegen.c_type(ty)?;
            let field = self.env.slot_name(id).ok_or_else(|| {
                CompileError::internal(format!("kept command {} has no slot", id))
            })?;
            return Ok(Some(format!("(({} *) _env_->{})[_tid_]", c_type, field)));
        }
        Ok(None)
    }

    fn write_slot(
        &mut self,
        command: &Command,
        c_type: &str,
        ty: &UnionType,
        translation: &mut CommandTranslation,
    ) -> Result<()> {
        let id = command.id;
        let field =
            self.env
                .allocate_previous_slot(id, c_type.to_string(), command.size(), ty.c_size())?;
        translation.execution.push(format!(
            "(({} *) _env_->{})[_tid_] = {};",
            c_type, field, translation.result
        ));
        let serial = self.scope()?.serial;
        self.kept_home.insert(id, serial);
        self.kept.push(KeptSlot {
            command: id,
            field,
            len: command.size(),
            result_type: ty.clone(),
        });
        if command.size() == 0 {
            self.warnings.push(
                Diagnostic::warning(
                    format!("command {} is kept but has no elements", id),
                    None,
                )
                .for_command(id)
                .with_note("its slot is allocated but never written".to_string()),
            );
        }
        Ok(())
    }

    /// Materialize `producer` as a whole array in a kernel of its own.
    pub fn translate_entire(&mut self, producer: CommandId) -> Result<ArrayOperand> {
        if let Some(operand) = self.sealed_outputs.get(&producer) {
            return Ok(operand.clone());
        }
        let graph = self.graph;
        let command = graph.get(producer)?;
        let elem_type = self.types.result(producer)?.clone();
        let c_type = self.codegen.c_type(&elem_type)?;
        let home_sealed = self
            .kept_home
            .get(&producer)
            .is_some_and(|serial| self.sealed_scopes.contains(serial));
        let source = if command.device_result().is_some() || (command.keep && home_sealed) {
            self.read_slot(command, &elem_type)?;
            let field = self.env.slot_name(producer).ok_or_else(|| {
                CompileError::internal(format!("kept command {} has no slot", producer))
            })?;
            OperandSource::Slot(field.to_string())
        } else {
            self.push_scope(command, false);
            let translation = self.translate(producer)?;
            let (_, buffer) = self.seal(translation)?;
            OperandSource::Kernel(buffer)
        };
        let operand = ArrayOperand {
            producer,
            source,
            len: command.size(),
            elem_type,
            c_type,
        };
        self.sealed_outputs.insert(producer, operand.clone());
        Ok(operand)
    }

    /// Pointer expression for `operand` inside the current kernel.
    pub fn bind_operand(&mut self, operand: &ArrayOperand) -> Result<String> {
        match &operand.source {
            OperandSource::Kernel(buffer) => {
                let name = format!("_kernel_result_{}", operand.producer);
                let decl = format!("{} *{}", operand.c_type, name);
                self.scope_mut()?
                    .add_param(decl, LaunchArg::Buffer(*buffer));
                Ok(name)
            }
            OperandSource::Slot(field) => Ok(format!("(({} *) _env_->{})", operand.c_type, field)),
        }
    }

    fn push_scope(&mut self, root: &Command, write_back: bool) {
        let serial = self.next_serial;
        self.next_serial += 1;
        tracing::debug!(root = %root.id, serial, "opened kernel scope");
        self.scopes.push(KernelScope::new(serial, root, write_back));
    }

    fn scope(&self) -> Result<&KernelScope> {
        self.scopes
            .last()
            .ok_or_else(|| CompileError::internal("no open kernel scope"))
    }

    fn scope_mut(&mut self) -> Result<&mut KernelScope> {
        self.scopes
            .last_mut()
            .ok_or_else(|| CompileError::internal("no open kernel scope"))
    }

    fn allocate(&mut self, len: usize, c_type: &str, elem_size: usize) -> BufferId {
        let buffer = BufferId(self.allocations.len() as u32);
        self.allocations.push(Allocation {
            buffer,
            len,
            c_type: c_type.to_string(),
            elem_size,
        });
        buffer
    }

    /// Close the innermost scope into a kernel and plan its launches.
    /// Returns the kernel index and the buffer holding its result.
    fn seal(&mut self, translation: CommandTranslation) -> Result<(usize, BufferId)> {
        let mut scope = self
            .scopes
            .pop()
            .ok_or_else(|| CompileError::internal("kernel scope stack underflow"))?;
        let index = self.kernels.len();
        let name = format!("_kernel_{}_", index);
        let result_type = self.types.result(scope.root)?.clone();
        let result_c_type = self.codegen.c_type(&result_type)?;
        let elem_size = result_type.c_size();
        let params: Vec<String> = scope.params.iter().map(|p| p.decl.clone()).collect();
        let extra_args: Vec<LaunchArg> = scope.params.iter().map(|p| p.arg.clone()).collect();
        let mut body = translation.execution;
        if self.codegen.debug_comments() {
            body.insert(
                0,
                format!("// kernel {} fuses commands {:?}", index, scope.commands),
            );
        }

        let reduction = scope.reduction.take();
        let (source, output) = match &reduction {
            None => {
                let output = self.allocate(scope.num_threads, &result_c_type, elem_size);
                if scope.num_threads > 0 {
                    let mut args = vec![
                        LaunchArg::Environment,
                        LaunchArg::NumThreads,
                        LaunchArg::Buffer(output),
                    ];
                    args.extend(extra_args);
                    self.launches.push(Launch {
                        kernel: index,
                        num_threads: scope.num_threads,
                        block_size: scope.block_size,
                        num_blocks: scope.num_threads.div_ceil(scope.block_size),
                        args,
                        output: OutputBinding::Fresh(output),
                        write_back: scope.write_back,
                        reduction: None,
                    });
                } else {
                    tracing::debug!(kernel = %name, "zero threads, not launched");
                }
                let source = element_kernel_source(
                    &name,
                    &result_c_type,
                    &params,
                    &body,
                    &translation.result,
                );
                (source, output)
            }
            Some(site) => {
                let output = self.plan_passes(
                    index,
                    &scope,
                    site,
                    &result_c_type,
                    elem_size,
                    &extra_args,
                )?;
                let source = reduce::kernel_source(
                    &name,
                    site,
                    &result_c_type,
                    &params,
                    &body,
                    &translation.result,
                );
                (source, output)
            }
        };

        tracing::debug!(
            kernel = %name,
            root = %scope.root,
            threads = scope.num_threads,
            fused = scope.commands.len(),
            "sealed kernel"
        );
        self.sealed_scopes.insert(scope.serial);
        self.kernels.push(Kernel {
            index,
            name,
            root: scope.root,
            num_threads: scope.num_threads,
            block_size: scope.block_size,
            result_c_type,
            output,
            write_back: scope.write_back,
            reduction: reduction.map(|site| site.plan),
            commands: scope.commands,
        });
        self.kernel_sources.push(source);
        Ok((index, output))
    }

    /// One launch per reduction pass. Intermediate passes share one scratch
    /// buffer, written in place; when the reduction is the kernel's own root
    /// the scratch doubles as the result.
    fn plan_passes(
        &mut self,
        kernel: usize,
        scope: &KernelScope,
        site: &ReductionSite,
        result_c_type: &str,
        result_size: usize,
        extra_args: &[LaunchArg],
    ) -> Result<BufferId> {
        let steps = site.plan.steps();
        if steps.is_empty() {
            return Err(CompileError::internal(format!(
                "reduction {} hosted without passes",
                site.command
            )));
        }
        let scratch = if steps.len() > 1 {
            let elem_size = site.input.elem_type.c_size();
            Some(self.allocate(steps[0].output_len, &site.c_type, elem_size))
        } else {
            None
        };
        let (result, final_binding) = match scratch {
            Some(scratch) if scope.root == site.command => (scratch, OutputBinding::Reuse(scratch)),
            _ => {
                let fresh = self.allocate(scope.num_threads, result_c_type, result_size);
                (fresh, OutputBinding::Fresh(fresh))
            }
        };
        for (i, step) in steps.iter().enumerate() {
            let last = i + 1 == steps.len();
            let input = match (i, scratch) {
                (0, _) | (_, None) => site.input.launch_arg(),
                (_, Some(scratch)) => LaunchArg::Buffer(scratch),
            };
            let (output_arg, binding) = match (last, scratch) {
                (true, _) => (LaunchArg::Null, final_binding),
                (false, Some(scratch)) if i == 0 => {
                    (LaunchArg::Buffer(scratch), OutputBinding::Fresh(scratch))
                }
                (false, Some(scratch)) => {
                    (LaunchArg::Buffer(scratch), OutputBinding::Reuse(scratch))
                }
                (false, None) => {
                    return Err(CompileError::internal(
                        "intermediate reduction pass without scratch buffer",
                    ))
                }
            };
            let mut args = vec![
                LaunchArg::Environment,
                LaunchArg::NumThreads,
                input,
                output_arg,
                LaunchArg::Flag(step.odd),
                LaunchArg::Flag(last),
                if last {
                    LaunchArg::Buffer(result)
                } else {
                    LaunchArg::Null
                },
            ];
            args.extend(extra_args.iter().cloned());
            self.launches.push(Launch {
                kernel,
                num_threads: step.threads,
                block_size: site.block_size,
                num_blocks: step.blocks,
                args,
                output: binding,
                write_back: last && scope.write_back,
                reduction: Some(site.command),
            });
        }
        Ok(result)
    }
}

/// Source of an ordinary one-thread-per-element kernel.
fn element_kernel_source(
    name: &str,
    result_c_type: &str,
    params: &[String],
    body: &[String],
    result_expr: &str,
) -> String {
    let mut signature = vec![
        "environment_t *_env_".to_string(),
        "int _num_threads_".to_string(),
        format!("{} *_result_", result_c_type),
    ];
    signature.extend(params.iter().cloned());
    let mut text = format!("__global__ void {}({})\n{{\n", name, signature.join(", "));
    text.push_str("    int _tid_ = blockIdx.x * blockDim.x + threadIdx.x;\n");
    text.push_str("    if (_tid_ < _num_threads_) {\n");
    for line in body {
        text.push_str(&format!("        {}\n", line));
    }
    text.push_str(&format!("        _result_[_tid_] = {};\n", result_expr));
    text.push_str("    }\n");
    text.push_str("}\n");
    text
}
