//! Host reference interpreter for command graphs.
//!
//! Produces the values a device run of the compiled program would, command
//! by command: reductions combine in the planned pass order and stencils
//! substitute the fallback per out-of-bounds neighbor. Results are therefore
//! independent of how commands were fused into kernels.

mod eval;
#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{CompileError, Result};
use crate::graph::{Command, CommandGraph, CommandId, CommandKind, StencilStrategy};
use crate::translate::neighbor_index;
use crate::translate::reduce::simulate;
use crate::typeck::classes::ClassRegistry;
use crate::typeck::dispatch::DispatchTable;
use crate::typeck::TypeTable;
use crate::types::{UnionType, Value};

use eval::{BodyEvaluator, EvalContext};

pub struct Interpreter<'a> {
    graph: &'a CommandGraph,
    types: &'a TypeTable,
    ctx: EvalContext<'a>,
    values: BTreeMap<CommandId, Arc<[Value]>>,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        graph: &'a CommandGraph,
        types: &'a TypeTable,
        classes: &'a ClassRegistry,
        dispatch: &'a DispatchTable,
        soa_arrays: &'a BTreeMap<String, Vec<Value>>,
    ) -> Self {
        Self {
            graph,
            types,
            ctx: EvalContext {
                classes,
                dispatch,
                soa_arrays,
            },
            values: BTreeMap::new(),
        }
    }

    /// Every element of `root`, in row-major order.
    #[tracing::instrument(skip(self), fields(root = %root))]
    pub fn evaluate(&mut self, root: CommandId) -> Result<Vec<Value>> {
        let types = self.types;
        for id in &types.order {
            self.values_of(*id)?;
        }
        Ok(self.values_of(root)?.to_vec())
    }

    fn values_of(&mut self, id: CommandId) -> Result<Arc<[Value]>> {
        if let Some(values) = self.values.get(&id) {
            return Ok(values.clone());
        }
        let graph = self.graph;
        let command = graph.get(id)?;
        let values: Arc<[Value]> = self
            .evaluate_command(command)
            .map_err(|e| e.in_command(id))?
            .into();
        tracing::debug!(command = %id, elements = values.len(), "evaluated");
        self.values.insert(id, values.clone());
        Ok(values)
    }

    fn evaluate_command(&mut self, command: &Command) -> Result<Vec<Value>> {
        if command.device_result().is_some() {
            return Err(CompileError::evaluation(
                "the command's values live on the device",
            ));
        }
        let result_type = self.types.result(command.id)?.clone();
        let n = command.size();
        match &command.kind {
            CommandKind::Index => Ok((0..n).map(|i| Value::Int(i as i32)).collect()),
            CommandKind::Identity { array } => {
                Ok(array.iter().map(|v| v.coerce_to(&result_type)).collect())
            }
            CommandKind::Zip => {
                let inputs = self.inputs(command)?;
                Ok((0..n)
                    .map(|tid| Value::Struct(inputs.iter().map(|v| v[tid].clone()).collect()))
                    .collect())
            }
            CommandKind::Combine { body, .. } => {
                let inputs = self.inputs(command)?;
                let mut out = Vec::with_capacity(n);
                for tid in 0..n {
                    let args = inputs.iter().map(|v| v[tid].clone()).collect();
                    let value = BodyEvaluator::new(&self.ctx, body, 0).call(args)?;
                    out.push(value.coerce_to(&result_type));
                }
                Ok(out)
            }
            CommandKind::Reduce { body, .. } => {
                let input = self.input(command, 0)?;
                let ctx = &self.ctx;
                let reduced = simulate(&input, command.block_size, |a, b| {
                    BodyEvaluator::new(ctx, body, 0)
                        .call(vec![a.clone(), b.clone()])
                        .map(|v| v.coerce_to(&result_type))
                })?;
                Ok(reduced.into_iter().collect())
            }
            CommandKind::Stencil {
                body,
                strategy,
                with_index,
            } => self.evaluate_stencil(command, body, *strategy, *with_index, &result_type),
        }
    }

    fn evaluate_stencil(
        &mut self,
        command: &Command,
        body: &crate::ast::Block,
        strategy: StencilStrategy,
        with_index: bool,
        result_type: &UnionType,
    ) -> Result<Vec<Value>> {
        let access = command
            .stencil_access()
            .ok_or_else(|| CompileError::internal("stencil without neighborhood"))?;
        let producer = command.inputs[0].producer;
        let input = self.values_of(producer)?;
        let element = self.types.result(producer)?.clone();
        let dimensions = self.graph.get(producer)?.dimensions.clone();
        let fallback = access.fallback.coerce_to(&element);
        let index = if with_index {
            Some(self.input(command, command.inputs.len() - 1)?)
        } else {
            None
        };
        let mut out = Vec::with_capacity(command.size());
        for tid in 0..command.size() {
            let gathered: Vec<Value> = access
                .offsets
                .iter()
                .map(|offset| match neighbor_index(tid, &dimensions, offset) {
                    Some(i) => input[i].clone(),
                    None => fallback.clone(),
                })
                .collect();
            let mut args = match strategy {
                StencilStrategy::ParameterArray => vec![Value::Array(gathered)],
                StencilStrategy::SeparateScalars => gathered,
            };
            if let Some(index) = &index {
                args.push(index[tid].clone());
            }
            let value = BodyEvaluator::new(&self.ctx, body, 0).call(args)?;
            out.push(value.coerce_to(result_type));
        }
        Ok(out)
    }

    fn input(&mut self, command: &Command, position: usize) -> Result<Arc<[Value]>> {
        let input = command.inputs.get(position).ok_or_else(|| {
            CompileError::internal(format!("command {} has no input {}", command.id, position))
        })?;
        self.values_of(input.producer)
    }

    fn inputs(&mut self, command: &Command) -> Result<Vec<Arc<[Value]>>> {
        (0..command.inputs.len())
            .map(|i| self.input(command, i))
            .collect()
    }
}
