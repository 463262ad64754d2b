//! Type inference over a command graph.
//!
//! Every command reachable from a root gets a union type for its elements.
//! Bodies are interpreted symbolically with closed-world dispatch; instance
//! methods discovered along the way are inferred once per argument types
//! and collected for code generation.

mod body;
pub mod builtins;
pub mod classes;
pub mod dispatch;
#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{CompileError, Result};
use crate::graph::{cycle, Command, CommandGraph, CommandId, CommandKind, StencilStrategy};
use crate::types::{element_type, ConcreteType, UnionType};

pub use body::{BodyTypes, CallSite, CallTarget, VarKind};
use classes::ClassRegistry;
use dispatch::DispatchTable;

/// One instance method specialized for argument types.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodKey {
    pub class: String,
    pub selector: String,
    pub args: Vec<UnionType>,
}

/// Inference result of one command, memoized on the command.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandTypes {
    pub result: UnionType,
    /// Types of the body's formal parameters, in order.
    pub params: Vec<UnionType>,
    pub body: Option<Arc<BodyTypes>>,
    /// Every instance method the body reaches, transitively.
    pub methods: BTreeMap<MethodKey, Arc<BodyTypes>>,
}

impl CommandTypes {
    fn root(result: UnionType) -> Self {
        Self {
            result,
            params: Vec::new(),
            body: None,
            methods: BTreeMap::new(),
        }
    }
}

/// Types of every command reachable from one root.
#[derive(Clone, Debug, Default)]
pub struct TypeTable {
    commands: BTreeMap<CommandId, Arc<CommandTypes>>,
    /// Deduplicated set of instance methods to translate.
    pub methods: BTreeMap<MethodKey, Arc<BodyTypes>>,
    /// Producers before consumers.
    pub order: Vec<CommandId>,
}

impl TypeTable {
    pub fn command(&self, id: CommandId) -> Result<&Arc<CommandTypes>> {
        self.commands
            .get(&id)
            .ok_or_else(|| CompileError::internal(format!("command {} was never inferred", id)))
    }

    pub fn result(&self, id: CommandId) -> Result<&UnionType> {
        self.command(id).map(|types| &types.result)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Read-only lookup tables shared by every body.
pub(crate) struct InferContext<'a> {
    pub classes: &'a ClassRegistry,
    pub dispatch: &'a DispatchTable,
    /// Structure-of-arrays fields, readable by name from any body.
    pub globals: &'a BTreeMap<String, UnionType>,
}

/// Method bodies inferred so far, plus return types of methods still being
/// inferred (recursion sees the partial result).
#[derive(Default)]
pub(crate) struct MethodTable {
    pub bodies: BTreeMap<MethodKey, Arc<BodyTypes>>,
    pub partial: BTreeMap<MethodKey, UnionType>,
}

pub struct TypeInferenceEngine<'a> {
    graph: &'a CommandGraph,
    ctx: InferContext<'a>,
}

impl<'a> TypeInferenceEngine<'a> {
    pub fn new(
        graph: &'a CommandGraph,
        classes: &'a ClassRegistry,
        dispatch: &'a DispatchTable,
        globals: &'a BTreeMap<String, UnionType>,
    ) -> Self {
        Self {
            graph,
            ctx: InferContext {
                classes,
                dispatch,
                globals,
            },
        }
    }

    /// Infer every command reachable from `root`, producers first.
    ///
    /// Commands inferred by an earlier call are looked up, not re-inferred.
    /// Commands holding a device result take its type and are never
    /// interpreted again.
    #[tracing::instrument(skip(self), fields(root = %root))]
    pub fn infer(&self, root: CommandId) -> Result<TypeTable> {
        let order = cycle::dependency_order(self.graph, root)?;
        let mut table = TypeTable::default();
        let mut methods = MethodTable::default();
        for &id in &order {
            let command = self.graph.get(id)?;
            let types = if let Some(device) = command.device_result() {
                Arc::new(CommandTypes::root(device.result_type.clone()))
            } else if let Some(cached) = command.inferred() {
                cached.clone()
            } else {
                let types = self
                    .infer_command(command, &table, &mut methods)
                    .map_err(|e| e.in_command(id))?;
                tracing::debug!(command = %id, variant = %command.variant(), result = %types.result, "inferred");
                command.memoize(Arc::new(types))
            };
            for (key, body) in &types.methods {
                table.methods.entry(key.clone()).or_insert_with(|| body.clone());
                methods.bodies.entry(key.clone()).or_insert_with(|| body.clone());
            }
            table.commands.insert(id, types);
        }
        table.order = order;
        Ok(table)
    }

    fn infer_command(
        &self,
        command: &Command,
        table: &TypeTable,
        methods: &mut MethodTable,
    ) -> Result<CommandTypes> {
        let inputs = command
            .inputs
            .iter()
            .map(|input| table.result(input.producer).cloned())
            .collect::<Result<Vec<_>>>()?;
        match &command.kind {
            CommandKind::Index => Ok(CommandTypes::root(UnionType::int())),
            CommandKind::Identity { array } => {
                for value in array.iter() {
                    self.ctx.classes.check_instance(value)?;
                }
                let ty = element_type(array);
                ty.c_type()?;
                Ok(CommandTypes::root(ty))
            }
            CommandKind::Zip => {
                let ty = UnionType::of(ConcreteType::Struct(inputs));
                ty.c_type()?;
                Ok(CommandTypes::root(ty))
            }
            CommandKind::Combine { body, .. } => self.infer_with_body(body, inputs, methods),
            CommandKind::Reduce { body, .. } => {
                let element = first_input(&inputs)?;
                let types =
                    self.infer_with_body(body, vec![element.clone(), element.clone()], methods)?;
                if !types.result.is_subset(&element) {
                    return Err(CompileError::type_error(format!(
                        "reduction body returns {} but the reduced elements are {}",
                        types.result, element
                    )));
                }
                Ok(CommandTypes {
                    result: element,
                    ..types
                })
            }
            CommandKind::Stencil {
                body,
                strategy,
                with_index,
            } => {
                let element = first_input(&inputs)?;
                let access = command
                    .stencil_access()
                    .ok_or_else(|| CompileError::internal("stencil without neighborhood"))?;
                let fallback = access.fallback.concrete_type();
                let widened = fallback == ConcreteType::Int && element == UnionType::float();
                if !element.contains(&fallback) && !widened {
                    return Err(CompileError::type_error(format!(
                        "fallback {} does not fit elements of type {}",
                        access.fallback, element
                    )));
                }
                let mut params = match strategy {
                    StencilStrategy::ParameterArray => vec![UnionType::array_of(element)],
                    StencilStrategy::SeparateScalars => vec![element; access.offsets.len()],
                };
                if *with_index {
                    params.push(UnionType::int());
                }
                self.infer_with_body(body, params, methods)
            }
        }
    }

    fn infer_with_body(
        &self,
        block: &crate::ast::Block,
        params: Vec<UnionType>,
        methods: &mut MethodTable,
    ) -> Result<CommandTypes> {
        if params.len() != block.arity() {
            return Err(CompileError::internal(format!(
                "body takes {} parameters, {} types supplied",
                block.arity(),
                params.len()
            )));
        }
        let named = block.params.iter().cloned().zip(params.iter().cloned()).collect();
        let body = body::infer_body(&self.ctx, methods, block, named)?;
        let result = body.result.clone();
        if result.is_empty() || result == UnionType::void() {
            return Err(CompileError::type_error("body produces no value"));
        }
        let closure = method_closure(&body, methods)?;
        Ok(CommandTypes {
            result,
            params,
            body: Some(Arc::new(body)),
            methods: closure,
        })
    }
}

fn first_input(inputs: &[UnionType]) -> Result<UnionType> {
    inputs
        .first()
        .cloned()
        .ok_or_else(|| CompileError::internal("command has no input"))
}

/// Methods reachable from a body through calls, including calls made by
/// the methods themselves.
fn method_closure(
    body: &BodyTypes,
    methods: &MethodTable,
) -> Result<BTreeMap<MethodKey, Arc<BodyTypes>>> {
    let mut closure = BTreeMap::new();
    let mut pending: Vec<&MethodKey> = body.methods_called.iter().collect();
    let mut seen = BTreeSet::new();
    while let Some(key) = pending.pop() {
        if !seen.insert(key) {
            continue;
        }
        let method = methods.bodies.get(key).ok_or_else(|| {
            CompileError::internal(format!("method {}#{} was not inferred", key.class, key.selector))
        })?;
        pending.extend(method.methods_called.iter());
        closure.insert(key.clone(), method.clone());
    }
    Ok(closure)
}
