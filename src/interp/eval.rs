use std::collections::BTreeMap;
use std::ops::ControlFlow;

use crate::ast::{Block, Node, NodeId};
use crate::error::{CompileError, Result};
use crate::typeck::classes::ClassRegistry;
use crate::typeck::dispatch::{DispatchTable, Resolution, TypeTag};
use crate::types::Value;

/// Nested method calls deeper than this abort evaluation.
const MAX_CALL_DEPTH: usize = 256;

/// Lookup tables shared by every body evaluation.
pub(super) struct EvalContext<'a> {
    pub classes: &'a ClassRegistry,
    pub dispatch: &'a DispatchTable,
    pub soa_arrays: &'a BTreeMap<String, Vec<Value>>,
}

/// `Break` carries the value of an explicit `return`.
type Flow = ControlFlow<Value, Value>;

macro_rules! flow {
    ($e:expr) => {
        match $e? {
            ControlFlow::Continue(value) => value,
            ControlFlow::Break(value) => return Ok(ControlFlow::Break(value)),
        }
    };
}

pub(super) struct BodyEvaluator<'c, 'a> {
    ctx: &'c EvalContext<'a>,
    block: &'c Block,
    vars: BTreeMap<String, Value>,
    depth: usize,
}

impl<'c, 'a> BodyEvaluator<'c, 'a> {
    pub fn new(ctx: &'c EvalContext<'a>, block: &'c Block, depth: usize) -> Self {
        Self {
            ctx,
            block,
            vars: BTreeMap::new(),
            depth,
        }
    }

    /// Evaluate the block with its parameters bound to `args`.
    pub fn call(mut self, args: Vec<Value>) -> Result<Value> {
        if args.len() != self.block.params.len() {
            return Err(CompileError::evaluation(format!(
                "body takes {} arguments, got {}",
                self.block.params.len(),
                args.len()
            )));
        }
        for (name, value) in self.block.params.iter().zip(args) {
            self.vars.insert(name.clone(), value);
        }
        self.run()
    }

    fn run(&mut self) -> Result<Value> {
        let Some(root) = self.block.ast.root() else {
            return Ok(Value::Nil);
        };
        match self.eval(root)? {
            ControlFlow::Continue(value) | ControlFlow::Break(value) => Ok(value),
        }
    }

    fn eval(&mut self, id: NodeId) -> Result<Flow> {
        let block = self.block;
        let node = block
            .ast
            .node(id)
            .ok_or_else(|| CompileError::internal(format!("dangling node {:?}", id)))?;
        let value = match node {
            Node::Literal(value) => value.clone(),
            Node::Read(name) => self.read(name)?,
            Node::Write { name, value } => {
                let value = flow!(self.eval(*value));
                self.vars.insert(name.clone(), value.clone());
                value
            }
            Node::If {
                cond,
                then_branch,
                else_branch,
            } => {
                if flow!(self.eval(*cond)).truthy() {
                    flow!(self.eval(*then_branch))
                } else if let Some(other) = else_branch {
                    flow!(self.eval(*other))
                } else {
                    Value::Nil
                }
            }
            Node::While { cond, body } => {
                while flow!(self.eval(*cond)).truthy() {
                    flow!(self.eval(*body));
                }
                Value::Nil
            }
            Node::Call {
                receiver,
                selector,
                args,
            } => {
                let receiver = match receiver {
                    Some(r) => Some(flow!(self.eval(*r))),
                    None => None,
                };
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(flow!(self.eval(*arg)));
                }
                self.call_method(receiver, selector, values)
                    .map_err(|e| e.at_node(id, block.ast.span(id)))?
            }
            Node::Return(value) => {
                let value = match value {
                    Some(v) => flow!(self.eval(*v)),
                    None => Value::Nil,
                };
                return Ok(ControlFlow::Break(value));
            }
            Node::Seq(items) => {
                let mut last = Value::Nil;
                for item in items {
                    last = flow!(self.eval(*item));
                }
                last
            }
        };
        Ok(ControlFlow::Continue(value))
    }

    fn read(&self, name: &str) -> Result<Value> {
        if let Some(value) = self.vars.get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.block.captured(name) {
            return Ok(value.clone());
        }
        if let Some(items) = self.ctx.soa_arrays.get(name) {
            return Ok(Value::Array(items.clone()));
        }
        Err(CompileError::evaluation(format!(
            "undefined local variable or method '{}'",
            name
        )))
    }

    fn call_method(
        &self,
        receiver: Option<Value>,
        selector: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let Some(receiver) = receiver else {
            let builtin = self.ctx.dispatch.resolve_function(selector).ok_or_else(|| {
                CompileError::evaluation(format!("undefined function '{}'", selector))
            })?;
            return builtin.eval(&args);
        };
        let tag = TypeTag::of(&receiver.concrete_type());
        let resolution = self.ctx.dispatch.resolve(&tag, selector).ok_or_else(|| {
            CompileError::evaluation(format!(
                "undefined method '{}' for {}",
                selector,
                receiver.concrete_type()
            ))
        })?;
        match resolution {
            Resolution::Builtin(builtin) => {
                let mut operands = Vec::with_capacity(args.len() + 1);
                operands.push(receiver);
                operands.extend(args);
                builtin.eval(&operands)
            }
            Resolution::Field { class, index } => {
                let field = self
                    .ctx
                    .classes
                    .get(class)
                    .and_then(|def| def.fields.get(*index))
                    .map(|(name, _)| name.as_str())
                    .ok_or_else(|| CompileError::internal(format!("class {} lost field {}", class, index)))?;
                match &receiver {
                    Value::Object { fields, .. } => fields
                        .iter()
                        .find(|(name, _)| name == field)
                        .map(|(_, value)| value.clone())
                        .ok_or_else(|| {
                            CompileError::evaluation(format!("object has no field '{}'", field))
                        }),
                    other => Err(CompileError::evaluation(format!("{} has no fields", other))),
                }
            }
            Resolution::Method { class, selector } => {
                if self.depth >= MAX_CALL_DEPTH {
                    return Err(CompileError::evaluation(format!(
                        "method calls nested deeper than {}",
                        MAX_CALL_DEPTH
                    )));
                }
                let body = self
                    .ctx
                    .classes
                    .get(class)
                    .and_then(|def| def.methods.get(selector))
                    .ok_or_else(|| {
                        CompileError::internal(format!("class {} lost method {}", class, selector))
                    })?;
                let mut method = BodyEvaluator::new(self.ctx, body, self.depth + 1);
                method.vars.insert("self".to_string(), receiver);
                method.call(args)
            }
        }
    }
}
