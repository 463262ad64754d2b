//! Statement-level emission of one body.
//!
//! Expressions that contain control flow are hoisted into temporaries, so
//! every emitted C expression is side-effect ordered the way the body reads.

use crate::ast::{Node, NodeId};
use crate::error::{CompileError, Result};
use crate::typeck::builtins::Builtin;
use crate::typeck::dispatch::Resolution;
use crate::typeck::{CallSite, CallTarget, VarKind};
use crate::types::{ConcreteType, UnionType, Value};

use super::{BlockFunction, CodegenContext};

/// Where the value of a statement goes.
enum Sink {
    Discard,
    Assign(String, UnionType),
    Return,
}

pub(super) struct BlockEmitter<'c, 'a, 'f, 'b> {
    ctx: &'c mut CodegenContext<'a>,
    function: &'f BlockFunction<'b>,
    lines: Vec<String>,
    indent: usize,
    temps: usize,
}

impl<'c, 'a, 'f, 'b> BlockEmitter<'c, 'a, 'f, 'b> {
    pub(super) fn new(ctx: &'c mut CodegenContext<'a>, function: &'f BlockFunction<'b>) -> Self {
        Self {
            ctx,
            function,
            lines: Vec::new(),
            indent: 1,
            temps: 0,
        }
    }

    pub(super) fn emit(mut self, root: NodeId) -> Result<Vec<String>> {
        self.stmt(root, &Sink::Return)?;
        Ok(self.lines)
    }

    fn line(&mut self, text: impl AsRef<str>) {
        self.lines
            .push(format!("{}{}", "    ".repeat(self.indent), text.as_ref()));
    }

    fn temp(&mut self) -> String {
        let name = format!("_t_{}", self.temps);
        self.temps += 1;
        name
    }

    fn node(&self, id: NodeId) -> Result<Node> {
        self.function
            .block
            .ast
            .node(id)
            .cloned()
            .ok_or_else(|| CompileError::internal(format!("dangling node {}", id.0)))
    }

    fn node_type(&self, id: NodeId) -> UnionType {
        self.function.types.node_type(id)
    }

    fn var(&self, name: &str) -> Result<String> {
        if let Some(binding) = self.function.bindings.get(name) {
            return Ok(binding.expr.clone());
        }
        match self.function.types.var_kind(name) {
            Some(VarKind::Local) => Ok(format!("v_{}", name)),
            Some(kind) => Err(CompileError::internal(format!(
                "{:?} variable '{}' has no binding",
                kind, name
            ))),
            None => Err(CompileError::internal(format!(
                "variable '{}' was never typed",
                name
            ))),
        }
    }

    fn var_type(&self, name: &str) -> UnionType {
        self.function
            .types
            .var_type(name)
            .cloned()
            .unwrap_or_default()
    }

    fn stmt(&mut self, id: NodeId, sink: &Sink) -> Result<()> {
        match self.node(id)? {
            Node::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let test = self.condition(cond)?;
                self.line(format!("if ({}) {{", test));
                self.indent += 1;
                self.stmt(then_branch, sink)?;
                self.indent -= 1;
                self.line("} else {");
                self.indent += 1;
                match else_branch {
                    Some(else_branch) => self.stmt(else_branch, sink)?,
                    None => self.sink_value("0", &UnionType::void(), sink, false)?,
                }
                self.indent -= 1;
                self.line("}");
                Ok(())
            }
            Node::While { cond, body } => {
                self.line("while (true) {");
                self.indent += 1;
                let test = self.condition(cond)?;
                self.line(format!("if (!({})) break;", test));
                self.stmt(body, &Sink::Discard)?;
                self.indent -= 1;
                self.line("}");
                self.sink_value("0", &UnionType::void(), sink, false)
            }
            Node::Seq(items) => match items.split_last() {
                Some((last, rest)) => {
                    for item in rest {
                        self.stmt(*item, &Sink::Discard)?;
                    }
                    self.stmt(*last, sink)
                }
                None => self.sink_value("0", &UnionType::void(), sink, false),
            },
            Node::Return(value) => {
                let (expr, ty) = match value {
                    Some(value) => (self.expr(value)?, self.node_type(value)),
                    None => ("0".to_string(), UnionType::void()),
                };
                let result = self.function.result.clone();
                let expr = self.ctx.coerce(&expr, &ty, &result)?;
                self.line(format!("return {};", expr));
                Ok(())
            }
            node => {
                let is_call = matches!(node, Node::Call { .. });
                let expr = self.expr(id)?;
                let ty = self.node_type(id);
                self.sink_value(&expr, &ty, sink, is_call)
            }
        }
    }

    fn sink_value(&mut self, expr: &str, ty: &UnionType, sink: &Sink, keep: bool) -> Result<()> {
        match sink {
            Sink::Discard => {
                if keep {
                    self.line(format!("{};", expr));
                }
            }
            Sink::Assign(var, target) => {
                let value = self.ctx.coerce(expr, ty, target)?;
                self.line(format!("{} = {};", var, value));
            }
            Sink::Return => {
                let result = self.function.result.clone();
                let value = self.ctx.coerce(expr, ty, &result)?;
                self.line(format!("return {};", value));
            }
        }
        Ok(())
    }

    fn condition(&mut self, cond: NodeId) -> Result<String> {
        let expr = self.expr(cond)?;
        let ty = self.node_type(cond);
        Ok(self.ctx.truthy(&expr, &ty))
    }

    fn expr(&mut self, id: NodeId) -> Result<String> {
        match self.node(id)? {
            Node::Literal(value) => value.c_literal().ok_or_else(|| {
                CompileError::internal(format!("literal {} has no C form", value))
            }),
            Node::Read(name) => self.var(&name),
            Node::Write { name, value } => {
                let expr = self.expr(value)?;
                let target = self.var(&name)?;
                let from = self.node_type(value);
                let to = self.var_type(&name);
                let expr = self.ctx.coerce(&expr, &from, &to)?;
                self.line(format!("{} = {};", target, expr));
                Ok(target)
            }
            Node::Call {
                receiver,
                selector,
                args,
            } => self.call(id, receiver, &selector, &args),
            Node::If { .. } | Node::While { .. } | Node::Seq(_) | Node::Return(_) => {
                let ty = self.node_type(id);
                if ty.is_empty() || ty == UnionType::void() {
                    self.stmt(id, &Sink::Discard)?;
                    return Ok("0".to_string());
                }
                let temp = self.temp();
                let c_type = self.ctx.c_type(&ty)?;
                let zero = self.ctx.c_zero(&ty)?;
                self.line(format!("{} {} = {};", c_type, temp, zero));
                self.stmt(id, &Sink::Assign(temp.clone(), ty))?;
                Ok(temp)
            }
        }
    }

    fn call(
        &mut self,
        id: NodeId,
        receiver: Option<NodeId>,
        selector: &str,
        args: &[NodeId],
    ) -> Result<String> {
        let site = self
            .function
            .types
            .calls
            .get(&id)
            .cloned()
            .ok_or_else(|| CompileError::internal(format!("call '{}' was never typed", selector)))?;
        let receiver_expr = match receiver {
            Some(r) => Some(self.expr(r)?),
            None => None,
        };
        let mut arg_exprs = Vec::with_capacity(args.len());
        for arg in args {
            arg_exprs.push(self.expr(*arg)?);
        }

        if let [target] = site.targets.as_slice() {
            return self.call_target(target, &site, receiver, receiver_expr, arg_exprs, args);
        }
        let (Some(receiver_ty), Some(receiver_expr)) = (&site.receiver, receiver_expr) else {
            return Err(CompileError::internal(format!(
                "'{}' has several targets but no receiver",
                selector
            )));
        };
        let helper = self.ctx.dispatch_helper(
            selector,
            receiver_ty,
            &site.args,
            &site.targets,
            &site.result,
        )?;
        let mut operands = vec!["_env_".to_string(), receiver_expr];
        operands.extend(arg_exprs);
        Ok(format!("{}({})", helper, operands.join(", ")))
    }

    fn call_target(
        &mut self,
        target: &CallTarget,
        site: &CallSite,
        receiver: Option<NodeId>,
        receiver_expr: Option<String>,
        arg_exprs: Vec<String>,
        args: &[NodeId],
    ) -> Result<String> {
        match &target.resolution {
            Resolution::Builtin(Builtin::ArraySize) => {
                let name = match receiver.map(|r| self.node(r)).transpose()? {
                    Some(Node::Read(name)) => name,
                    _ => {
                        return Err(CompileError::type_error(
                            "size is only known for arrays read from a variable",
                        ))
                    }
                };
                self.function
                    .bindings
                    .get(&name)
                    .and_then(|binding| binding.size.clone())
                    .ok_or_else(|| {
                        CompileError::type_error(format!(
                            "size of array '{}' is not known on the device",
                            name
                        ))
                    })
            }
            Resolution::Builtin(Builtin::StructIndex) if !is_int_literal(self, args.first()) => {
                let receiver_expr = receiver_expr
                    .ok_or_else(|| CompileError::internal("struct index without receiver"))?;
                let struct_type = site.receiver.clone().unwrap_or_default();
                let c_type = self.ctx.c_type(&struct_type)?;
                let elem = self.ctx.c_type(&target.result)?;
                let temp = self.temp();
                self.line(format!("{} {} = {};", c_type, temp, receiver_expr));
                let index = arg_exprs.first().cloned().unwrap_or_else(|| "0".to_string());
                Ok(format!("(({} *) &{}.field_0)[{}]", elem, temp, index))
            }
            Resolution::Builtin(builtin) => {
                let mut operands = Vec::with_capacity(arg_exprs.len() + 1);
                let mut kinds = Vec::with_capacity(arg_exprs.len() + 1);
                if let Some(expr) = receiver_expr {
                    operands.push(expr);
                    kinds.push(target.receiver.clone().unwrap_or(ConcreteType::Void));
                }
                operands.extend(arg_exprs);
                for arg in &site.args {
                    kinds.push(arg.singleton().cloned().unwrap_or(ConcreteType::Void));
                }
                if let (Builtin::StructIndex, Some(Node::Literal(Value::Int(k)))) =
                    (builtin, args.first().map(|a| self.node(*a)).transpose()?)
                {
                    let fields = match &target.receiver {
                        Some(ConcreteType::Struct(fields)) => fields.len(),
                        _ => 0,
                    };
                    let index = if k < 0 { fields as i64 + i64::from(k) } else { i64::from(k) };
                    return Ok(format!("({}).field_{}", operands[0], index));
                }
                Ok(builtin.emit(&operands, &kinds))
            }
            Resolution::Field { class, index } => {
                let receiver_expr = receiver_expr
                    .ok_or_else(|| CompileError::internal("field read without receiver"))?;
                let field = self
                    .ctx
                    .classes
                    .get(class)
                    .and_then(|c| c.fields.get(*index))
                    .map(|(name, _)| name.clone())
                    .ok_or_else(|| CompileError::internal(format!("field of {} vanished", class)))?;
                Ok(format!("({}).f_{}", receiver_expr, field))
            }
            Resolution::Method { .. } => {
                let key = target
                    .method
                    .as_ref()
                    .ok_or_else(|| CompileError::internal("method call without key"))?;
                let name = self.ctx.method_name(key)?.to_string();
                let mut operands = vec!["_env_".to_string()];
                operands.extend(receiver_expr);
                operands.extend(arg_exprs);
                Ok(format!("{}({})", name, operands.join(", ")))
            }
        }
    }
}

fn is_int_literal(emitter: &BlockEmitter<'_, '_, '_, '_>, arg: Option<&NodeId>) -> bool {
    matches!(
        arg.and_then(|a| emitter.function.block.ast.node(*a)),
        Some(Node::Literal(Value::Int(_)))
    )
}
