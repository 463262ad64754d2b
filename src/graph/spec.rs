//! Command construction: the `CommandSpec` builder and the combinators.

use std::sync::{Arc, OnceLock};

use crate::ast::Block;
use crate::error::{CompileError, Result};
use crate::types::Value;

use super::{
    cycle, Command, CommandGraph, CommandId, CommandKind, GeneratorSite, Input, StencilAccess,
    StencilStrategy,
};

/// Operators a reduction may name instead of giving a body.
const REDUCE_OPERATORS: &[&str] = &["+", "*", "&", "|", "^", "&&", "||"];

#[derive(Clone, Debug)]
enum SpecKind {
    Index {
        dimensions: Vec<usize>,
    },
    Identity {
        values: Vec<Value>,
        dimensions: Option<Vec<usize>>,
    },
    Combine {
        inputs: Vec<CommandId>,
        body: Block,
    },
    Zip {
        inputs: Vec<CommandId>,
    },
    Reduce {
        target: CommandId,
        body: Option<Block>,
        operator: Option<String>,
    },
    Stencil {
        target: CommandId,
        offsets: Vec<Vec<i64>>,
        fallback: Value,
        body: Block,
    },
}

/// Everything needed to add one command to a graph.
#[derive(Clone, Debug)]
pub struct CommandSpec {
    kind: SpecKind,
    keep: bool,
    block_size: Option<usize>,
    generator: Option<GeneratorSite>,
    with_index: bool,
    strategy: Option<StencilStrategy>,
}

impl CommandSpec {
    fn new(kind: SpecKind) -> Self {
        Self {
            kind,
            keep: false,
            block_size: None,
            generator: None,
            with_index: false,
            strategy: None,
        }
    }

    pub fn index(dimensions: Vec<usize>) -> Self {
        Self::new(SpecKind::Index { dimensions })
    }

    pub fn identity(values: Vec<Value>) -> Self {
        Self::new(SpecKind::Identity {
            values,
            dimensions: None,
        })
    }

    pub fn combine(inputs: Vec<CommandId>, body: Block) -> Self {
        Self::new(SpecKind::Combine { inputs, body })
    }

    pub fn zip(inputs: Vec<CommandId>) -> Self {
        Self::new(SpecKind::Zip { inputs })
    }

    pub fn reduce(target: CommandId, body: Option<Block>, operator: Option<&str>) -> Self {
        Self::new(SpecKind::Reduce {
            target,
            body,
            operator: operator.map(str::to_string),
        })
    }

    pub fn stencil(target: CommandId, offsets: Vec<Vec<i64>>, fallback: Value, body: Block) -> Self {
        Self::new(SpecKind::Stencil {
            target,
            offsets,
            fallback,
            body,
        })
    }

    /// Reshape an identity array; the element count must not change.
    pub fn dimensions(mut self, dims: Vec<usize>) -> Self {
        if let SpecKind::Identity { dimensions, .. } = &mut self.kind {
            *dimensions = Some(dims);
        }
        self
    }

    pub fn keep(mut self) -> Self {
        self.keep = true;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn generator(mut self, site: GeneratorSite) -> Self {
        self.generator = Some(site);
        self
    }

    /// Pass the thread index to the body as an extra trailing parameter.
    pub fn with_index(mut self) -> Self {
        self.with_index = true;
        self
    }

    pub fn strategy(mut self, strategy: StencilStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Flatten 1-D offsets into index vectors.
pub fn offsets_1d(offsets: &[i64]) -> Vec<Vec<i64>> {
    offsets.iter().map(|o| vec![*o]).collect()
}

impl CommandGraph {
    /// Validate a spec and add the command it describes.
    pub fn add(&mut self, spec: CommandSpec) -> Result<CommandId> {
        let id = self.ids.next_id();
        self.build(id, spec).map_err(|e| e.in_command(id))
    }

    fn build(&mut self, id: CommandId, spec: CommandSpec) -> Result<CommandId> {
        let block_size = spec.block_size.unwrap_or(self.block_size);
        if block_size == 0 {
            return Err(CompileError::construction("block size must be at least 1"));
        }
        if spec.with_index
            && !matches!(spec.kind, SpecKind::Combine { .. } | SpecKind::Stencil { .. })
        {
            return Err(CompileError::construction(
                "with_index applies only to combine and stencil",
            ));
        }

        let (dimensions, mut inputs, kind) = match spec.kind {
            SpecKind::Index { dimensions } => {
                if dimensions.is_empty() {
                    return Err(CompileError::construction(
                        "index needs at least one dimension",
                    ));
                }
                (dimensions, Vec::new(), CommandKind::Index)
            }
            SpecKind::Identity { values, dimensions } => {
                if values.is_empty() {
                    return Err(CompileError::construction(
                        "cannot build a command from an empty array",
                    ));
                }
                let dimensions = dimensions.unwrap_or_else(|| vec![values.len()]);
                let count: usize = dimensions.iter().product();
                if dimensions.is_empty() || count != values.len() {
                    return Err(CompileError::construction(format!(
                        "dimensions {:?} do not cover {} elements",
                        dimensions,
                        values.len()
                    )));
                }
                let array: Arc<[Value]> = values.into();
                (dimensions, Vec::new(), CommandKind::Identity { array })
            }
            SpecKind::Combine { inputs, body } => {
                let dimensions = self.element_wise_dimensions(&inputs)?;
                let arity = inputs.len() + usize::from(spec.with_index);
                check_arity(&body, arity)?;
                let inputs = inputs.into_iter().map(Input::by_thread_id).collect::<Vec<_>>();
                let kind = CommandKind::Combine {
                    body,
                    with_index: spec.with_index,
                };
                (dimensions, inputs, kind)
            }
            SpecKind::Zip { inputs } => {
                let dimensions = self.element_wise_dimensions(&inputs)?;
                let inputs = inputs.into_iter().map(Input::by_thread_id).collect::<Vec<_>>();
                (dimensions, inputs, CommandKind::Zip)
            }
            SpecKind::Reduce {
                target,
                body,
                operator,
            } => {
                let size = self.producer(target)?.size();
                let body = match (body, &operator) {
                    (Some(_), Some(_)) => {
                        return Err(CompileError::construction(
                            "reduce takes either a body or an operator, not both",
                        ))
                    }
                    (None, None) => {
                        return Err(CompileError::construction(
                            "reduce needs a body or an operator",
                        ))
                    }
                    (Some(body), None) => body,
                    (None, Some(op)) => {
                        if !REDUCE_OPERATORS.contains(&op.as_str()) {
                            return Err(CompileError::construction(format!(
                                "'{}' is not an associative operator",
                                op
                            )));
                        }
                        Block::binary_op(op)
                    }
                };
                check_arity(&body, 2)?;
                let dimensions = vec![if size == 0 { 0 } else { 1 }];
                (
                    dimensions,
                    vec![Input::entire(target)],
                    CommandKind::Reduce { body, operator },
                )
            }
            SpecKind::Stencil {
                target,
                offsets,
                fallback,
                body,
            } => {
                let dimensions = self.producer(target)?.dimensions.clone();
                if offsets.is_empty() {
                    return Err(CompileError::construction(
                        "stencil needs at least one offset",
                    ));
                }
                if let Some(bad) = offsets.iter().find(|o| o.len() != dimensions.len()) {
                    return Err(CompileError::construction(format!(
                        "offset {:?} has rank {} but the input has {} dimensions",
                        bad,
                        bad.len(),
                        dimensions.len()
                    )));
                }
                if fallback.c_literal().is_none() {
                    return Err(CompileError::construction(format!(
                        "stencil fallback {} is not a primitive value",
                        fallback
                    )));
                }
                let strategy = spec.strategy.unwrap_or(self.stencil_strategy);
                let gathered = match strategy {
                    StencilStrategy::ParameterArray => 1,
                    StencilStrategy::SeparateScalars => offsets.len(),
                };
                check_arity(&body, gathered + usize::from(spec.with_index))?;
                let input = Input {
                    stencil: Some(StencilAccess { offsets, fallback }),
                    ..Input::entire(target)
                };
                let kind = CommandKind::Stencil {
                    body,
                    strategy,
                    with_index: spec.with_index,
                };
                (dimensions, vec![input], kind)
            }
        };

        if spec.with_index {
            let index = self.add(CommandSpec::index(dimensions.clone()).block_size(block_size))?;
            inputs.push(Input::by_thread_id(index));
        }

        if let Some(site) = spec.generator {
            let producers: Vec<CommandId> = inputs.iter().map(|i| i.producer).collect();
            cycle::check_generator(self, &producers, site, id)?;
        }

        Ok(self.insert(Command {
            id,
            dimensions,
            block_size,
            keep: spec.keep,
            inputs,
            kind,
            generator: spec.generator,
            inferred: OnceLock::new(),
            device_result: OnceLock::new(),
        }))
    }

    fn producer(&self, id: CommandId) -> Result<&Command> {
        self.command(id)
            .ok_or_else(|| CompileError::construction(format!("unknown input command {}", id)))
    }

    /// Element-wise inputs must agree on element count; the first one's shape wins.
    fn element_wise_dimensions(&self, inputs: &[CommandId]) -> Result<Vec<usize>> {
        let Some(first) = inputs.first() else {
            return Err(CompileError::construction(
                "element-wise command needs at least one input",
            ));
        };
        let first = self.producer(*first)?;
        for other in &inputs[1..] {
            let other = self.producer(*other)?;
            if other.size() != first.size() {
                return Err(CompileError::construction(format!(
                    "input {} has {} elements but input {} has {}",
                    other.id,
                    other.size(),
                    first.id,
                    first.size()
                )));
            }
        }
        Ok(first.dimensions.clone())
    }

    pub fn index(&mut self, dimensions: Vec<usize>) -> Result<CommandId> {
        self.add(CommandSpec::index(dimensions))
    }

    /// Freeze a host array into a root command.
    pub fn to_command(&mut self, values: Vec<Value>) -> Result<CommandId> {
        self.add(CommandSpec::identity(values))
    }

    pub fn combine(&mut self, target: CommandId, others: &[CommandId], body: Block) -> Result<CommandId> {
        let mut inputs = vec![target];
        inputs.extend_from_slice(others);
        self.add(CommandSpec::combine(inputs, body))
    }

    pub fn zip(&mut self, target: CommandId, others: &[CommandId]) -> Result<CommandId> {
        let mut inputs = vec![target];
        inputs.extend_from_slice(others);
        self.add(CommandSpec::zip(inputs))
    }

    pub fn reduce(
        &mut self,
        target: CommandId,
        body: Option<Block>,
        operator: Option<&str>,
    ) -> Result<CommandId> {
        self.add(CommandSpec::reduce(target, body, operator))
    }

    pub fn stencil(
        &mut self,
        target: CommandId,
        offsets: Vec<Vec<i64>>,
        fallback: Value,
        body: Block,
    ) -> Result<CommandId> {
        self.add(CommandSpec::stencil(target, offsets, fallback, body))
    }
}

fn check_arity(body: &Block, expected: usize) -> Result<()> {
    if body.arity() != expected {
        return Err(CompileError::construction(format!(
            "body takes {} parameters but {} are supplied",
            body.arity(),
            expected
        )));
    }
    Ok(())
}
