//! Symbolic interpretation of one body.
//!
//! Inference is flow-insensitive: every variable has one union type for the
//! whole body. The body is re-walked until no variable type grows, so reads
//! that textually precede their write (loops) still see every assignment.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::ast::{Block, Node, NodeId};
use crate::error::{CompileError, Result};
use crate::types::{ConcreteType, UnionType, Value};

use super::dispatch::{Resolution, TypeTag};
use super::{InferContext, MethodKey, MethodTable};

/// Upper bound on walks over one body before giving up.
const MAX_PASSES: usize = 64;

/// Where a variable read resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarKind {
    /// Parameter or local of the generated function.
    Local,
    /// Lexical capture, stored in the environment per command.
    Capture,
    /// Structure-of-arrays field registered with the compiler.
    Global,
}

/// One possible implementation a call can dispatch to.
#[derive(Clone, Debug, PartialEq)]
pub struct CallTarget {
    /// Receiver kind selecting this target; `None` for free functions.
    pub receiver: Option<ConcreteType>,
    pub resolution: Resolution,
    pub method: Option<MethodKey>,
    pub result: UnionType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CallSite {
    pub receiver: Option<UnionType>,
    pub args: Vec<UnionType>,
    pub targets: Vec<CallTarget>,
    pub result: UnionType,
}

/// Inference result for one body.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BodyTypes {
    pub params: Vec<(String, UnionType)>,
    /// Locals assigned in the body, excluding parameters.
    pub locals: BTreeMap<String, UnionType>,
    /// Captures the body actually reads.
    pub captures: BTreeMap<String, UnionType>,
    pub globals: BTreeMap<String, UnionType>,
    pub node_types: BTreeMap<NodeId, UnionType>,
    pub calls: BTreeMap<NodeId, CallSite>,
    pub result: UnionType,
    pub methods_called: BTreeSet<MethodKey>,
}

impl BodyTypes {
    pub fn node_type(&self, id: NodeId) -> UnionType {
        self.node_types.get(&id).cloned().unwrap_or_default()
    }

    pub fn var_kind(&self, name: &str) -> Option<VarKind> {
        if self.params.iter().any(|(p, _)| p == name) || self.locals.contains_key(name) {
            Some(VarKind::Local)
        } else if self.captures.contains_key(name) {
            Some(VarKind::Capture)
        } else if self.globals.contains_key(name) {
            Some(VarKind::Global)
        } else {
            None
        }
    }

    pub fn var_type(&self, name: &str) -> Option<&UnionType> {
        self.params
            .iter()
            .find(|(p, _)| p == name)
            .map(|(_, ty)| ty)
            .or_else(|| self.locals.get(name))
            .or_else(|| self.captures.get(name))
            .or_else(|| self.globals.get(name))
    }

    /// Every union type mentioned by this body.
    pub fn all_types(&self) -> impl Iterator<Item = &UnionType> {
        self.params
            .iter()
            .map(|(_, ty)| ty)
            .chain(self.locals.values())
            .chain(self.captures.values())
            .chain(self.node_types.values())
            .chain(std::iter::once(&self.result))
    }
}

pub(super) fn infer_body(
    ctx: &InferContext<'_>,
    methods: &mut MethodTable,
    block: &Block,
    params: Vec<(String, UnionType)>,
) -> Result<BodyTypes> {
    let captures = block
        .captures
        .iter()
        .map(|(name, value)| {
            ctx.classes.check_instance(value)?;
            Ok((name.clone(), value.union_type()))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;
    let inferencer = BodyInferencer {
        ctx,
        methods,
        block,
        vars: params.iter().cloned().collect(),
        param_names: params.iter().map(|(p, _)| p.clone()).collect(),
        params,
        declared_captures: captures,
        types: BodyTypes::default(),
        returns: UnionType::empty(),
        changed: false,
        undefined: BTreeSet::new(),
    };
    inferencer.run()
}

struct BodyInferencer<'a, 'm> {
    ctx: &'a InferContext<'a>,
    methods: &'m mut MethodTable,
    block: &'a Block,
    vars: BTreeMap<String, UnionType>,
    param_names: BTreeSet<String>,
    params: Vec<(String, UnionType)>,
    declared_captures: BTreeMap<String, UnionType>,
    types: BodyTypes,
    returns: UnionType,
    changed: bool,
    undefined: BTreeSet<String>,
}

impl BodyInferencer<'_, '_> {
    fn run(mut self) -> Result<BodyTypes> {
        let root = self
            .block
            .ast
            .root()
            .ok_or_else(|| CompileError::type_error("body is empty"))?;
        let mut result = None;
        for _ in 0..MAX_PASSES {
            self.changed = false;
            self.undefined.clear();
            let ty = self.visit(root)?;
            if !self.changed {
                result = Some(ty);
                break;
            }
        }
        let Some(root_type) = result else {
            return Err(CompileError::internal(format!(
                "body inference did not converge after {} passes",
                MAX_PASSES
            )));
        };
        if let Some(name) = self.undefined.iter().next() {
            return Err(CompileError::type_error(format!(
                "undefined local variable or method '{}'",
                name
            )));
        }

        let mut types = self.types;
        types.result = root_type.union(&self.returns);
        types.params = self.params;
        types.locals = self
            .vars
            .into_iter()
            .filter(|(name, _)| !self.param_names.contains(name))
            .collect();
        check_representable(&types)?;
        Ok(types)
    }

    fn visit(&mut self, id: NodeId) -> Result<UnionType> {
        let node = self
            .block
            .ast
            .node(id)
            .ok_or_else(|| CompileError::internal(format!("dangling node {}", id.0)))?
            .clone();
        let ty = self
            .visit_node(id, &node)
            .map_err(|e| e.at_node(id, self.block.ast.span(id)))?;
        self.types.node_types.insert(id, ty.clone());
        Ok(ty)
    }

    fn visit_node(&mut self, id: NodeId, node: &Node) -> Result<UnionType> {
        match node {
            Node::Literal(value) => {
                if value.c_literal().is_none() {
                    return Err(CompileError::type_error(format!(
                        "literal {} is not a primitive value",
                        value
                    )));
                }
                Ok(value.union_type())
            }
            Node::Read(name) => Ok(self.read(name)),
            Node::Write { name, value } => {
                let ty = self.visit(*value)?;
                self.write(name, &ty)?;
                Ok(ty)
            }
            Node::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.visit(*cond)?;
                let then_ty = self.visit(*then_branch)?;
                let else_ty = match else_branch {
                    Some(else_branch) => self.visit(*else_branch)?,
                    None => UnionType::void(),
                };
                Ok(then_ty.union(&else_ty))
            }
            Node::While { cond, body } => {
                self.visit(*cond)?;
                self.visit(*body)?;
                Ok(UnionType::void())
            }
            Node::Return(value) => {
                let ty = match value {
                    Some(value) => self.visit(*value)?,
                    None => UnionType::void(),
                };
                if self.returns.expand(&ty) {
                    self.changed = true;
                }
                Ok(UnionType::empty())
            }
            Node::Seq(items) => {
                let mut last = UnionType::void();
                for item in items {
                    last = self.visit(*item)?;
                }
                Ok(last)
            }
            Node::Call {
                receiver,
                selector,
                args,
            } => self.visit_call(id, *receiver, selector, args),
        }
    }

    fn read(&mut self, name: &str) -> UnionType {
        if let Some(ty) = self.vars.get(name) {
            return ty.clone();
        }
        if let Some(ty) = self.declared_captures.get(name) {
            self.types.captures.insert(name.to_string(), ty.clone());
            return ty.clone();
        }
        if let Some(ty) = self.ctx.globals.get(name) {
            self.types.globals.insert(name.to_string(), ty.clone());
            return ty.clone();
        }
        self.undefined.insert(name.to_string());
        UnionType::empty()
    }

    fn write(&mut self, name: &str, ty: &UnionType) -> Result<()> {
        if self.param_names.contains(name) {
            let declared = self.vars.get(name).cloned().unwrap_or_default();
            if !ty.is_subset(&declared) {
                return Err(CompileError::type_error(format!(
                    "assigning {} to parameter '{}' of type {}",
                    ty, name, declared
                )));
            }
            return Ok(());
        }
        if self.declared_captures.contains_key(name) || self.ctx.globals.contains_key(name) {
            return Err(CompileError::type_error(format!(
                "cannot assign to captured variable '{}'",
                name
            )));
        }
        if self.vars.entry(name.to_string()).or_default().expand(ty) {
            self.changed = true;
        }
        Ok(())
    }

    fn visit_call(
        &mut self,
        id: NodeId,
        receiver: Option<NodeId>,
        selector: &str,
        args: &[NodeId],
    ) -> Result<UnionType> {
        let receiver_ty = match receiver {
            Some(r) => Some(self.visit(r)?),
            None => None,
        };
        let mut arg_types = Vec::with_capacity(args.len());
        for arg in args {
            arg_types.push(self.visit(*arg)?);
        }
        let literal_index = match args.first().and_then(|a| self.block.ast.node(*a)) {
            Some(Node::Literal(Value::Int(k))) if args.len() == 1 => Some(i64::from(*k)),
            _ => None,
        };

        // Operand types still growing; a later pass revisits this call.
        if receiver_ty.as_ref().is_some_and(UnionType::is_empty)
            || arg_types.iter().any(UnionType::is_empty)
        {
            return Ok(UnionType::empty());
        }

        let mut targets = Vec::new();
        match &receiver_ty {
            None => {
                let builtin = self.ctx.dispatch.resolve_function(selector).ok_or_else(|| {
                    CompileError::type_error(format!("undefined method '{}' for main", selector))
                })?;
                let operands = singleton_args(selector, &arg_types)?;
                let result = builtin.result_type(&operands, literal_index)?;
                targets.push(CallTarget {
                    receiver: None,
                    resolution: Resolution::Builtin(builtin),
                    method: None,
                    result,
                });
            }
            Some(receiver_ty) => {
                if receiver_ty.len() > 1 && !receiver_ty.is_union_repr() {
                    return Err(CompileError::type_error(format!(
                        "cannot call '{}' on {}: its members share no representation",
                        selector, receiver_ty
                    )));
                }
                for kind in receiver_ty.iter() {
                    let target = self.resolve_target(kind, selector, &arg_types, literal_index)?;
                    targets.push(target);
                }
            }
        }

        let mut result = UnionType::empty();
        for target in &targets {
            result.expand(&target.result);
        }
        self.types.calls.insert(
            id,
            CallSite {
                receiver: receiver_ty,
                args: arg_types,
                targets,
                result: result.clone(),
            },
        );
        Ok(result)
    }

    fn resolve_target(
        &mut self,
        kind: &ConcreteType,
        selector: &str,
        arg_types: &[UnionType],
        literal_index: Option<i64>,
    ) -> Result<CallTarget> {
        let resolution = self
            .ctx
            .dispatch
            .resolve(&TypeTag::of(kind), selector)
            .cloned()
            .ok_or_else(|| {
                CompileError::type_error(format!("undefined method '{}' for {}", selector, kind))
            })?;
        let (result, method) = match &resolution {
            Resolution::Builtin(builtin) => {
                let mut operands = vec![kind.clone()];
                operands.extend(singleton_args(selector, arg_types)?);
                (builtin.result_type(&operands, literal_index)?, None)
            }
            Resolution::Field { class, index } => {
                if !arg_types.is_empty() {
                    return Err(CompileError::type_error(format!(
                        "wrong number of arguments ({} for 0) to {}#{}",
                        arg_types.len(),
                        class,
                        selector
                    )));
                }
                let ty = self
                    .ctx
                    .classes
                    .get(class)
                    .and_then(|c| c.fields.get(*index))
                    .map(|(_, ty)| ty.clone())
                    .ok_or_else(|| {
                        CompileError::internal(format!("field {}#{} vanished", class, selector))
                    })?;
                (ty, None)
            }
            Resolution::Method { class, selector } => {
                let key = MethodKey {
                    class: class.clone(),
                    selector: selector.clone(),
                    args: arg_types.to_vec(),
                };
                let result = self.method_result(&key)?;
                self.types.methods_called.insert(key.clone());
                (result, Some(key))
            }
        };
        Ok(CallTarget {
            receiver: Some(kind.clone()),
            resolution,
            method,
            result,
        })
    }

    /// Return type of an instance method for the given argument types.
    ///
    /// Recursive calls see the partial result computed so far; the method is
    /// re-inferred until that partial result stops growing.
    fn method_result(&mut self, key: &MethodKey) -> Result<UnionType> {
        if let Some(body) = self.methods.bodies.get(key) {
            return Ok(body.result.clone());
        }
        if let Some(partial) = self.methods.partial.get(key) {
            return Ok(partial.clone());
        }
        let block = self
            .ctx
            .classes
            .get(&key.class)
            .and_then(|c| c.methods.get(&key.selector))
            .ok_or_else(|| {
                CompileError::internal(format!("method {}#{} vanished", key.class, key.selector))
            })?;
        if block.arity() != key.args.len() {
            return Err(CompileError::type_error(format!(
                "wrong number of arguments ({} for {}) to {}#{}",
                key.args.len(),
                block.arity(),
                key.class,
                key.selector
            )));
        }
        let mut params = vec![(
            "self".to_string(),
            UnionType::of(ConcreteType::Class(key.class.clone())),
        )];
        params.extend(block.params.iter().cloned().zip(key.args.iter().cloned()));

        self.methods.partial.insert(key.clone(), UnionType::empty());
        let mut body = None;
        for _ in 0..MAX_PASSES {
            let inferred = infer_body(self.ctx, self.methods, block, params.clone())?;
            let partial = self.methods.partial.get(key).cloned().unwrap_or_default();
            if inferred.result.is_subset(&partial) {
                body = Some(inferred);
                break;
            }
            self.methods
                .partial
                .insert(key.clone(), partial.union(&inferred.result));
        }
        self.methods.partial.remove(key);
        let body = body.ok_or_else(|| {
            CompileError::internal(format!(
                "return type of {}#{} did not converge",
                key.class, key.selector
            ))
        })?;
        if body.result.is_empty() || body.result == UnionType::void() {
            return Err(CompileError::type_error(format!(
                "method {}#{} returns no value",
                key.class, key.selector
            )));
        }
        let result = body.result.clone();
        self.methods.bodies.insert(key.clone(), Arc::new(body));
        Ok(result)
    }
}

/// Builtins take exactly one kind per argument.
fn singleton_args(selector: &str, args: &[UnionType]) -> Result<Vec<ConcreteType>> {
    args.iter()
        .enumerate()
        .map(|(i, ty)| {
            ty.singleton().cloned().ok_or_else(|| {
                CompileError::type_error(format!(
                    "argument {} of '{}' has type {}; builtins take a single type",
                    i + 1,
                    selector,
                    ty
                ))
            })
        })
        .collect()
}

fn check_representable(types: &BodyTypes) -> Result<()> {
    for (name, ty) in types
        .params
        .iter()
        .map(|(n, t)| (n, t))
        .chain(types.locals.iter())
    {
        ty.c_type().map_err(|_| {
            CompileError::type_error(format!(
                "variable '{}' has type {} with no device representation",
                name, ty
            ))
        })?;
    }
    for (id, ty) in &types.node_types {
        if ty.len() > 1 {
            ty.c_type().map_err(|e| e.at_node(*id, None))?;
        }
    }
    types.result.c_type()?;
    Ok(())
}
