//! Multi-pass parallel reduction.
//!
//! Each pass launches `ceil(n / 2)` threads; thread `i` folds elements `2i`
//! and `2i + 1` (the last thread of an odd pass keeps its lone element),
//! then every block folds its threads' values in a shared-memory tree and
//! writes one value. Passes repeat while more than one block's worth of
//! values remain; a final single-block pass produces the scalar.

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};
use crate::graph::Command;

use super::{CommandTranslation, CommandTranslator, ReductionSite};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionStep {
    pub input_len: usize,
    pub threads: usize,
    pub blocks: usize,
    /// Input length is odd; the last thread holds an unpaired element.
    pub odd: bool,
    pub output_len: usize,
}

impl ReductionStep {
    fn new(input_len: usize, block_size: usize) -> Self {
        let threads = input_len.div_ceil(2);
        let blocks = threads.div_ceil(block_size).max(1);
        Self {
            input_len,
            threads,
            blocks,
            odd: input_len % 2 == 1,
            output_len: blocks,
        }
    }

    /// Binary combinations this pass performs.
    pub fn combinations(&self) -> usize {
        self.input_len - self.output_len
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReductionPlan {
    /// No elements: the result is the element type's zero, no launch.
    Empty,
    /// One element: the result is that element, no launch.
    Single,
    Passes(Vec<ReductionStep>),
}

impl ReductionPlan {
    pub fn steps(&self) -> &[ReductionStep] {
        match self {
            ReductionPlan::Passes(steps) => steps,
            _ => &[],
        }
    }

    pub fn launches(&self) -> usize {
        self.steps().len()
    }

    pub fn combinations(&self) -> usize {
        self.steps().iter().map(ReductionStep::combinations).sum()
    }
}

pub fn plan_reduction(n: usize, block_size: usize) -> ReductionPlan {
    match n {
        0 => ReductionPlan::Empty,
        1 => ReductionPlan::Single,
        _ => {
            let block_size = block_size.max(1);
            let mut steps = Vec::new();
            let mut remaining = n;
            while remaining > block_size {
                let step = ReductionStep::new(remaining, block_size);
                remaining = step.output_len;
                steps.push(step);
            }
            steps.push(ReductionStep::new(remaining, block_size));
            ReductionPlan::Passes(steps)
        }
    }
}

/// Reduce `values` on the host exactly as the planned launches would,
/// combining in the same order. `None` for an empty input.
pub fn simulate<T: Clone>(
    values: &[T],
    block_size: usize,
    mut combine: impl FnMut(&T, &T) -> Result<T>,
) -> Result<Option<T>> {
    match plan_reduction(values.len(), block_size) {
        ReductionPlan::Empty => Ok(None),
        ReductionPlan::Single => Ok(values.first().cloned()),
        ReductionPlan::Passes(steps) => {
            let mut current = values.to_vec();
            for step in &steps {
                current = run_pass(&current, step, block_size.max(1), &mut combine)?;
            }
            Ok(current.into_iter().next())
        }
    }
}

fn run_pass<T: Clone>(
    input: &[T],
    step: &ReductionStep,
    block_size: usize,
    combine: &mut impl FnMut(&T, &T) -> Result<T>,
) -> Result<Vec<T>> {
    let mut partial = Vec::with_capacity(step.threads);
    for i in 0..step.threads {
        let lone = step.odd && i == step.threads - 1;
        let value = if lone {
            input[2 * i].clone()
        } else {
            combine(&input[2 * i], &input[2 * i + 1])?
        };
        partial.push(value);
    }
    let mut output = Vec::with_capacity(step.blocks);
    for block in partial.chunks_mut(block_size) {
        let active = block.len();
        let mut stride = active.next_power_of_two() / 2;
        while stride > 0 {
            for j in 0..stride {
                if j + stride < active {
                    block[j] = combine(&block[j], &block[j + stride])?;
                }
            }
            stride /= 2;
        }
        output.push(block[0].clone());
    }
    Ok(output)
}

pub(super) fn lower_reduce(
    tr: &mut CommandTranslator<'_>,
    command: &Command,
) -> Result<CommandTranslation> {
    let id = command.id;
    let input = command
        .inputs
        .first()
        .ok_or_else(|| CompileError::internal(format!("reduce {} has no input", id)))?;
    let graph = tr.graph;
    let table = tr.types;
    let element = table.result(id)?.clone();
    let n = graph.get(input.producer)?.size();
    let plan = plan_reduction(n, command.block_size);
    tracing::debug!(command = %id, elements = n, launches = plan.launches(), "planned reduction");

    match plan {
        ReductionPlan::Empty => Ok(CommandTranslation::value(
            tr.codegen.c_zero(&element)?,
            element,
        )),
        ReductionPlan::Single => {
            let operand = tr.translate_entire(input.producer)?;
            let pointer = tr.bind_operand(&operand)?;
            Ok(CommandTranslation::value(format!("{}[0]", pointer), element))
        }
        ReductionPlan::Passes(_) => {
            let scope = tr.scope()?;
            let can_host = scope.reduction.is_none() && scope.num_threads == 1;
            if !can_host {
                // Another reduction owns this kernel; run this one as its own.
                let operand = tr.translate_entire(id)?;
                let pointer = tr.bind_operand(&operand)?;
                return Ok(CommandTranslation::value(
                    format!("{}[_tid_]", pointer),
                    element,
                ));
            }
            let operand = tr.translate_entire(input.producer)?;
            let c_type = tr.codegen.c_type(&element)?;
            let params = tr.body_params(command)?;
            let block_fn = tr.emit_body(command, params, Vec::new(), Default::default(), &element)?;
            let scope = tr.scope_mut()?;
            scope.reduction = Some(ReductionSite {
                command: id,
                plan,
                input: operand,
                block_fn,
                block_size: command.block_size,
                c_type,
            });
            Ok(CommandTranslation::value(
                format!("_reduce_result_{}", id),
                element,
            ))
        }
    }
}

/// Source of the kernel hosting a reduction. Every pass launches it; only
/// the last launch (`_last_`) runs the fused consumers in thread 0.
pub(super) fn kernel_source(
    name: &str,
    site: &ReductionSite,
    result_c_type: &str,
    params: &[String],
    body: &[String],
    result_expr: &str,
) -> String {
    let t = &site.c_type;
    let f = &site.block_fn;
    let mut signature = vec![
        "environment_t *_env_".to_string(),
        "int _num_threads_".to_string(),
        format!("{} *_input_", t),
        format!("{} *_output_", t),
        "int _odd_".to_string(),
        "int _last_".to_string(),
        format!("{} *_result_", result_c_type),
    ];
    signature.extend(params.iter().cloned());
    let mut text = format!("__global__ void {}({})\n{{\n", name, signature.join(", "));
    text.push_str(&format!("    __shared__ {} _sdata_[{}];\n", t, site.block_size));
    text.push_str("    int _tid_ = blockIdx.x * blockDim.x + threadIdx.x;\n");
    text.push_str("    int _lid_ = threadIdx.x;\n");
    text.push_str("    if (_tid_ < _num_threads_) {\n");
    text.push_str(&format!("        {} _value_ = _input_[2 * _tid_];\n", t));
    text.push_str("        if (!(_odd_ && _tid_ == _num_threads_ - 1)) {\n");
    text.push_str(&format!(
        "            _value_ = {}(_env_, _value_, _input_[2 * _tid_ + 1]);\n",
        f
    ));
    text.push_str("        }\n");
    text.push_str("        _sdata_[_lid_] = _value_;\n");
    text.push_str("    }\n");
    text.push_str("    __syncthreads();\n");
    text.push_str(
        "    int _active_ = min((int) blockDim.x, _num_threads_ - (int) (blockIdx.x * blockDim.x));\n",
    );
    text.push_str("    int _stride_ = 1;\n");
    text.push_str("    while (_stride_ < _active_) _stride_ <<= 1;\n");
    text.push_str("    for (_stride_ >>= 1; _stride_ > 0; _stride_ >>= 1) {\n");
    text.push_str("        if (_lid_ < _stride_ && _lid_ + _stride_ < _active_) {\n");
    text.push_str(&format!(
        "            _sdata_[_lid_] = {}(_env_, _sdata_[_lid_], _sdata_[_lid_ + _stride_]);\n",
        f
    ));
    text.push_str("        }\n");
    text.push_str("        __syncthreads();\n");
    text.push_str("    }\n");
    text.push_str("    if (_lid_ == 0) {\n");
    text.push_str("        if (_last_) {\n");
    text.push_str(&format!(
        "            {} _reduce_result_{} = _sdata_[0];\n",
        t,
        site.command
    ));
    for line in body {
        text.push_str(&format!("            {}\n", line));
    }
    text.push_str(&format!("            _result_[0] = {};\n", result_expr));
    text.push_str("        } else {\n");
    text.push_str("            _output_[blockIdx.x] = _sdata_[0];\n");
    text.push_str("        }\n");
    text.push_str("    }\n");
    text.push_str("}\n");
    text
}
