//! Device source emission for per-element bodies.
//!
//! `CodegenContext` collects everything a program shares across kernels:
//! type definitions, the `union_t` header, dispatch helpers for polymorphic
//! receivers, instance methods, and one function per command body. Kernel
//! templates live in the translator; this module only produces functions.

mod block;
#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::ast::Block;
use crate::error::{CompileError, Result};
use crate::typeck::classes::ClassRegistry;
use crate::typeck::dispatch::Resolution;
use crate::typeck::{BodyTypes, CallTarget, MethodKey};
use crate::types::{ConcreteType, UnionType};

use block::BlockEmitter;

/// First parameter of every device function.
pub const ENV_PARAM: &str = "environment_t *_env_";

/// How a non-local name is read inside a function body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VarBinding {
    pub expr: String,
    /// Element count expression, for array bindings.
    pub size: Option<String>,
}

impl VarBinding {
    pub fn scalar(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            size: None,
        }
    }

    pub fn array(expr: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            size: Some(size.into()),
        }
    }
}

/// A device function to emit from a body.
pub struct BlockFunction<'b> {
    pub name: String,
    pub block: &'b Block,
    pub types: &'b BodyTypes,
    /// Parameter declarations after the environment pointer.
    pub params: Vec<String>,
    /// Statements placed before the body.
    pub prelude: Vec<String>,
    /// Names resolved outside the function's own locals.
    pub bindings: BTreeMap<String, VarBinding>,
    /// Declared return type; the body result is converted to it.
    pub result: UnionType,
    pub comment: Option<String>,
}

type HelperKey = (String, UnionType, Vec<UnionType>);

pub struct CodegenContext<'a> {
    classes: &'a ClassRegistry,
    debug_comments: bool,
    uses_union: bool,
    typedefs: Vec<String>,
    typedef_names: BTreeSet<String>,
    helpers: Vec<String>,
    helper_names: BTreeMap<HelperKey, String>,
    method_names: BTreeMap<MethodKey, String>,
    method_prototypes: Vec<String>,
    method_defs: Vec<String>,
    blocks: Vec<String>,
    block_names: BTreeSet<String>,
}

impl<'a> CodegenContext<'a> {
    pub fn new(classes: &'a ClassRegistry, debug_comments: bool) -> Self {
        Self {
            classes,
            debug_comments,
            uses_union: false,
            typedefs: Vec::new(),
            typedef_names: BTreeSet::new(),
            helpers: Vec::new(),
            helper_names: BTreeMap::new(),
            method_names: BTreeMap::new(),
            method_prototypes: Vec::new(),
            method_defs: Vec::new(),
            blocks: Vec::new(),
            block_names: BTreeSet::new(),
        }
    }

    pub fn debug_comments(&self) -> bool {
        self.debug_comments
    }

    /// C type used to store values of `ty`, registering any typedefs it needs.
    ///
    /// `nil` has no storage of its own and is kept as an `int` zero.
    pub fn c_type(&mut self, ty: &UnionType) -> Result<String> {
        self.register(ty)?;
        if ty.is_empty() || *ty == UnionType::void() {
            return Ok("int".to_string());
        }
        ty.c_type()
    }

    pub fn c_zero(&mut self, ty: &UnionType) -> Result<String> {
        self.register(ty)?;
        if ty.is_union_repr() {
            self.uses_union = true;
        }
        ty.c_zero()
    }

    fn register(&mut self, ty: &UnionType) -> Result<()> {
        if ty.is_union_repr() {
            self.uses_union = true;
        }
        ty.c_type()?;
        for kind in ty.iter() {
            self.register_kind(kind)?;
        }
        Ok(())
    }

    fn register_kind(&mut self, kind: &ConcreteType) -> Result<()> {
        match kind {
            ConcreteType::Array(elem) => self.register(elem),
            ConcreteType::Struct(fields) => {
                let name = kind.c_type()?;
                if self.typedef_names.contains(&name) {
                    return Ok(());
                }
                let mut members = Vec::with_capacity(fields.len());
                for (i, field) in fields.iter().enumerate() {
                    members.push(format!("    {} field_{};", self.c_type(field)?, i));
                }
                self.push_typedef(name, members);
                Ok(())
            }
            ConcreteType::Class(class) => {
                let name = kind.c_type()?;
                if self.typedef_names.contains(&name) {
                    return Ok(());
                }
                let def = self.classes.get(class).ok_or_else(|| {
                    CompileError::type_error(format!("uninitialized constant {}", class))
                })?;
                // Reserve the name first so self-referencing classes terminate.
                self.typedef_names.insert(name.clone());
                let mut members = Vec::with_capacity(def.fields.len());
                for (field, ty) in &def.fields {
                    members.push(format!("    {} f_{};", self.c_type(ty)?, field));
                }
                self.typedef_names.remove(&name);
                self.push_typedef(name, members);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn push_typedef(&mut self, name: String, members: Vec<String>) {
        let mut text = String::from("typedef struct {\n");
        for member in members {
            text.push_str(&member);
            text.push('\n');
        }
        text.push_str(&format!("}} {};\n", name));
        self.typedefs.push(text);
        self.typedef_names.insert(name);
    }

    /// Convert an expression of type `from` into storage of type `to`.
    pub fn coerce(&mut self, expr: &str, from: &UnionType, to: &UnionType) -> Result<String> {
        if from == to || from.is_empty() {
            return Ok(expr.to_string());
        }
        if to.is_union_repr() {
            self.uses_union = true;
            if from.is_union_repr() {
                return Ok(expr.to_string());
            }
            return match from.singleton() {
                Some(ConcreteType::Void) => Ok("union_t_nil()".to_string()),
                Some(ConcreteType::Int) => Ok(format!("union_t_from_int({})", expr)),
                Some(ConcreteType::Float) => Ok(format!("union_t_from_float({})", expr)),
                Some(ConcreteType::Bool) => Ok(format!("union_t_from_bool({})", expr)),
                _ => Err(CompileError::internal(format!(
                    "cannot box {} into union_t",
                    from
                ))),
            };
        }
        if *to == UnionType::float() && *from == UnionType::int() {
            return Ok(format!("((float) {})", expr));
        }
        if *to == UnionType::void() {
            return Ok("0".to_string());
        }
        Err(CompileError::internal(format!(
            "no conversion from {} to {}",
            from, to
        )))
    }

    /// Ruby truthiness of an expression: only `nil` and `false` are false.
    pub fn truthy(&mut self, expr: &str, ty: &UnionType) -> String {
        if *ty == UnionType::bool() {
            expr.to_string()
        } else if ty.is_union_repr() {
            self.uses_union = true;
            format!("union_t_truthy({})", expr)
        } else if *ty == UnionType::void() {
            "false".to_string()
        } else {
            format!("((void) ({}), true)", expr)
        }
    }

    /// Name and emit every instance method. Names are assigned before any
    /// body is emitted so methods may call each other.
    pub fn emit_methods(&mut self, methods: &BTreeMap<MethodKey, Arc<BodyTypes>>) -> Result<()> {
        for key in methods.keys() {
            if self.method_names.contains_key(key) {
                continue;
            }
            let name = format!(
                "_method_{}_{}",
                self.method_names.len(),
                sanitize_selector(&key.selector)
            );
            self.method_names.insert(key.clone(), name);
        }
        let classes = self.classes;
        for (key, body) in methods {
            let block = classes
                .get(&key.class)
                .and_then(|class| class.methods.get(&key.selector))
                .ok_or_else(|| {
                    CompileError::internal(format!(
                        "method {}#{} vanished",
                        key.class, key.selector
                    ))
                })?;
            let name = self.method_name(key)?.to_string();
            let receiver = UnionType::of(ConcreteType::Class(key.class.clone()));
            let mut params = vec![format!("{} v_self", self.c_type(&receiver)?)];
            for (param, ty) in block.params.iter().zip(&key.args) {
                params.push(format!("{} v_{}", self.c_type(ty)?, param));
            }
            let function = BlockFunction {
                name,
                block,
                types: body,
                params,
                prelude: Vec::new(),
                bindings: BTreeMap::new(),
                result: body.result.clone(),
                comment: Some(format!("{}#{}", key.class, key.selector)),
            };
            let (prototype, source) = self.render_function(&function)?;
            self.method_prototypes.push(prototype);
            self.method_defs.push(source);
        }
        Ok(())
    }

    pub fn method_name(&self, key: &MethodKey) -> Result<&str> {
        self.method_names.get(key).map(String::as_str).ok_or_else(|| {
            CompileError::internal(format!(
                "method {}#{} was not emitted",
                key.class, key.selector
            ))
        })
    }

    /// Emit a body function. Emitting the same name twice is a no-op.
    pub fn emit_block(&mut self, function: &BlockFunction<'_>) -> Result<()> {
        if self.block_names.contains(&function.name) {
            return Ok(());
        }
        let (_, source) = self.render_function(function)?;
        tracing::debug!(function = %function.name, "emitted block function");
        self.block_names.insert(function.name.clone());
        self.blocks.push(source);
        Ok(())
    }

    pub fn has_block(&self, name: &str) -> bool {
        self.block_names.contains(name)
    }

    fn render_function(&mut self, function: &BlockFunction<'_>) -> Result<(String, String)> {
        let result = self.c_type(&function.result)?;
        let mut params = vec![ENV_PARAM.to_string()];
        params.extend(function.params.iter().cloned());
        let signature = format!(
            "__device__ {} {}({})",
            result,
            function.name,
            params.join(", ")
        );
        let root = function
            .block
            .ast
            .root()
            .ok_or_else(|| CompileError::internal("cannot emit an empty body"))?;

        let mut text = String::new();
        if self.debug_comments {
            if let Some(comment) = &function.comment {
                text.push_str(&format!("// {}\n", comment));
            }
        }
        text.push_str(&signature);
        text.push_str("\n{\n");
        for line in &function.prelude {
            text.push_str(&format!("    {}\n", line));
        }
        for (name, ty) in &function.types.locals {
            if function.bindings.contains_key(name) {
                continue;
            }
            let c_type = self.c_type(ty)?;
            let zero = self.storage_zero(ty)?;
            text.push_str(&format!("    {} v_{} = {};\n", c_type, name, zero));
        }
        let lines = BlockEmitter::new(self, function).emit(root)?;
        for line in lines {
            text.push_str(&line);
            text.push('\n');
        }
        text.push_str("}\n");
        Ok((format!("{};", signature), text))
    }

    fn storage_zero(&mut self, ty: &UnionType) -> Result<String> {
        if ty.is_empty() || *ty == UnionType::void() {
            return Ok("0".to_string());
        }
        self.c_zero(ty)
    }

    /// Helper switching on the class id of a `union_t` receiver.
    ///
    /// One helper exists per (selector, receiver union, argument types).
    pub(crate) fn dispatch_helper(
        &mut self,
        selector: &str,
        receiver: &UnionType,
        args: &[UnionType],
        targets: &[CallTarget],
        result: &UnionType,
    ) -> Result<String> {
        let key = (selector.to_string(), receiver.clone(), args.to_vec());
        if let Some(name) = self.helper_names.get(&key) {
            return Ok(name.clone());
        }
        self.uses_union = true;
        let name = format!("_dispatch_{}_", self.helper_names.len());
        let result_type = self.c_type(result)?;
        let mut params = vec![ENV_PARAM.to_string(), "union_t _self_".to_string()];
        let mut arg_names = Vec::with_capacity(args.len());
        let mut arg_kinds = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            params.push(format!("{} _arg_{}", self.c_type(arg)?, i));
            arg_names.push(format!("_arg_{}", i));
            arg_kinds.push(arg.singleton().cloned().ok_or_else(|| {
                CompileError::internal(format!("polymorphic argument {} reached dispatch", arg))
            })?);
        }

        let mut text = format!(
            "__device__ {} {}({})\n{{\n    switch (_self_.class_id) {{\n",
            result_type,
            name,
            params.join(", ")
        );
        for target in targets {
            let (Some(kind), Resolution::Builtin(builtin)) = (&target.receiver, &target.resolution)
            else {
                return Err(CompileError::internal(format!(
                    "'{}' on {} does not resolve to a builtin",
                    selector, receiver
                )));
            };
            let (Some(class_id), Some(member)) = (kind.class_id(), kind.union_member()) else {
                return Err(CompileError::internal(format!("{} is not a union member", kind)));
            };
            let mut operands = vec![format!("_self_.value.{}", member)];
            operands.extend(arg_names.iter().cloned());
            let mut kinds = vec![kind.clone()];
            kinds.extend(arg_kinds.iter().cloned());
            let value = builtin.emit(&operands, &kinds);
            let value = self.coerce(&value, &target.result, result)?;
            text.push_str(&format!("        case {}: return {};\n", class_id, value));
        }
        let zero = self.storage_zero(result)?;
        text.push_str(&format!("    }}\n    return {};\n}}\n", zero));
        self.helpers.push(text);
        self.helper_names.insert(key, name.clone());
        Ok(name)
    }

    /// `union_t` header followed by every registered typedef.
    pub fn preamble(&self) -> String {
        let mut text = String::new();
        if self.uses_union {
            text.push_str(&union_header());
            text.push('\n');
        }
        for typedef in &self.typedefs {
            text.push_str(typedef);
            text.push('\n');
        }
        text
    }

    /// Method prototypes, dispatch helpers, methods, then body functions.
    pub fn functions(&self) -> String {
        let mut text = String::new();
        for prototype in &self.method_prototypes {
            text.push_str(prototype);
            text.push('\n');
        }
        if !self.method_prototypes.is_empty() {
            text.push('\n');
        }
        for part in self
            .helpers
            .iter()
            .chain(&self.method_defs)
            .chain(&self.blocks)
        {
            text.push_str(part);
            text.push('\n');
        }
        text
    }

    pub fn uses_union(&self) -> bool {
        self.uses_union
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

fn union_header() -> String {
    let mut text = String::from(
        "typedef struct union_t {\n    int class_id;\n    union {\n        int int_;\n        float float_;\n        bool bool_;\n    } value;\n} union_t;\n\n",
    );
    let constructors = [
        ("nil", None, ConcreteType::Void),
        ("from_int", Some("int"), ConcreteType::Int),
        ("from_float", Some("float"), ConcreteType::Float),
        ("from_bool", Some("bool"), ConcreteType::Bool),
    ];
    for (suffix, param, kind) in constructors {
        let class_id = kind.class_id().unwrap_or_default();
        let member = kind.union_member().unwrap_or("int_");
        let (decl, value) = match param {
            Some(c_type) => (format!("{} v", c_type), "v"),
            None => (String::new(), "0"),
        };
        text.push_str(&format!(
            "__device__ inline union_t union_t_{}({}) {{ union_t u; u.class_id = {}; u.value.{} = {}; return u; }}\n",
            suffix, decl, class_id, member, value
        ));
    }
    text.push_str(&format!(
        "__device__ inline bool union_t_truthy(union_t u) {{ return !(u.class_id == {} || (u.class_id == {} && !u.value.bool_)); }}\n",
        ConcreteType::Void.class_id().unwrap_or_default(),
        ConcreteType::Bool.class_id().unwrap_or_default()
    ));
    text
}

/// Selectors may be operators; map them onto identifier characters.
fn sanitize_selector(selector: &str) -> String {
    selector
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => c.to_string(),
            '+' => "plus".to_string(),
            '-' => "minus".to_string(),
            '*' => "times".to_string(),
            '/' => "div".to_string(),
            '%' => "mod".to_string(),
            '<' => "lt".to_string(),
            '>' => "gt".to_string(),
            '=' => "eq".to_string(),
            '!' => "not".to_string(),
            '?' => "p".to_string(),
            '[' | ']' => "idx".to_string(),
            other => format!("x{:x}", other as u32),
        })
        .collect()
}
