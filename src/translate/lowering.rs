//! Per-variant lowering of commands to device expressions.
//!
//! Lowerings are looked up by command variant in a registry built once per
//! process, so adding a variant means adding one function and one entry.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::codegen::{BlockFunction, VarBinding};
use crate::error::{CompileError, Result};
use crate::graph::{Command, CommandKind, Variant};
use crate::types::{ConcreteType, UnionType, Value};

use super::{reduce, stencil, CommandTranslation, CommandTranslator};

/// Lowers one command into the translator's current kernel.
pub type LowerFn = fn(&mut CommandTranslator<'_>, &Command) -> Result<CommandTranslation>;

static LOWERINGS: OnceLock<BTreeMap<Variant, LowerFn>> = OnceLock::new();

fn registry() -> &'static BTreeMap<Variant, LowerFn> {
    LOWERINGS.get_or_init(|| {
        let mut table: BTreeMap<Variant, LowerFn> = BTreeMap::new();
        table.insert(Variant::Index, lower_index);
        table.insert(Variant::Identity, lower_identity);
        table.insert(Variant::Combine, lower_combine);
        table.insert(Variant::Zip, lower_zip);
        table.insert(Variant::Reduce, reduce::lower_reduce);
        table.insert(Variant::Stencil, stencil::lower_stencil);
        table
    })
}

pub fn lowering_for(variant: Variant) -> Result<LowerFn> {
    registry()
        .get(&variant)
        .copied()
        .ok_or_else(|| CompileError::internal(format!("no lowering for {}", variant)))
}

fn lower_index(tr: &mut CommandTranslator<'_>, command: &Command) -> Result<CommandTranslation> {
    Ok(CommandTranslation::value(
        "_tid_".to_string(),
        command_type(tr, command)?,
    ))
}

fn lower_identity(tr: &mut CommandTranslator<'_>, command: &Command) -> Result<CommandTranslation> {
    let CommandKind::Identity { array } = &command.kind else {
        return Err(CompileError::internal("identity lowering on another variant"));
    };
    let element = command_type(tr, command)?;
    let c_type = tr.codegen.c_type(&element)?;
    let items: Vec<Value> = array.iter().map(|v| v.coerce_to(&element)).collect();
    let elem_size = Value::element_size(&items, &element);
    let (field, _) = tr.env.add_base_array(command.id, items, c_type, elem_size)?;
    Ok(CommandTranslation::value(
        format!("_env_->{}[_tid_]", field),
        element,
    ))
}

fn lower_combine(tr: &mut CommandTranslator<'_>, command: &Command) -> Result<CommandTranslation> {
    let (execution, mut args) = tr.translate_inputs(command)?;
    let result = command_type(tr, command)?;
    let params = tr.body_params(command)?;
    let name = tr.emit_body(command, params, Vec::new(), BTreeMap::new(), &result)?;
    args.insert(0, "_env_".to_string());
    Ok(CommandTranslation {
        execution,
        result: format!("{}({})", name, args.join(", ")),
        result_type: result,
    })
}

fn lower_zip(tr: &mut CommandTranslator<'_>, command: &Command) -> Result<CommandTranslation> {
    let (execution, args) = tr.translate_inputs(command)?;
    let result = command_type(tr, command)?;
    let c_type = tr.codegen.c_type(&result)?;
    if !matches!(result.singleton(), Some(ConcreteType::Struct(_))) {
        return Err(CompileError::internal(format!(
            "zip {} was not typed as a struct",
            command.id
        )));
    }
    Ok(CommandTranslation {
        execution,
        result: format!("(({}) {{{}}})", c_type, args.join(", ")),
        result_type: result,
    })
}

fn command_type(tr: &CommandTranslator<'_>, command: &Command) -> Result<UnionType> {
    tr.types.result(command.id).cloned()
}

impl CommandTranslator<'_> {
    /// Translate every element-wise input, producers' statements first.
    pub(super) fn translate_inputs(&mut self, command: &Command) -> Result<(Vec<String>, Vec<String>)> {
        let mut execution = Vec::new();
        let mut values = Vec::new();
        for input in &command.inputs {
            let translation = self.translate(input.producer)?;
            execution.extend(translation.execution);
            values.push(translation.result);
        }
        Ok((execution, values))
    }

    /// `T v_<param>` declarations for the body's formal parameters.
    pub(super) fn body_params(&mut self, command: &Command) -> Result<Vec<String>> {
        let table = self.types;
        let types = table.command(command.id)?;
        let block = command
            .body()
            .ok_or_else(|| CompileError::internal(format!("command {} has no body", command.id)))?;
        let mut params = Vec::with_capacity(block.params.len());
        for (name, ty) in block.params.iter().zip(&types.params) {
            params.push(format!("{} v_{}", self.codegen.c_type(ty)?, name));
        }
        Ok(params)
    }

    /// Emit the device function for a command's body, binding every capture
    /// and structure-of-arrays field it reads to its environment field.
    pub(super) fn emit_body(
        &mut self,
        command: &Command,
        params: Vec<String>,
        prelude: Vec<String>,
        mut bindings: BTreeMap<String, VarBinding>,
        result: &UnionType,
    ) -> Result<String> {
        let name = format!("_block_k_{}_", command.id);
        if self.codegen.has_block(&name) {
            return Ok(name);
        }
        let table = self.types;
        let block = command
            .body()
            .ok_or_else(|| CompileError::internal(format!("command {} has no body", command.id)))?;
        let body = table
            .command(command.id)?
            .body
            .as_ref()
            .ok_or_else(|| CompileError::internal(format!("command {} body was never typed", command.id)))?;

        for (capture, ty) in &body.captures {
            let value = block.captured(capture).ok_or_else(|| {
                CompileError::internal(format!("capture '{}' has no value", capture))
            })?;
            let binding = match value {
                Value::Array(items) => {
                    let element = array_element(ty)?;
                    let c_type = self.codegen.c_type(&element)?;
                    let elem_size = Value::element_size(items, &element);
                    let items = items.iter().map(|v| v.coerce_to(&element)).collect();
                    let (field, size) =
                        self.env
                            .add_array(command.id, capture, items, c_type, elem_size)?;
                    VarBinding::array(format!("_env_->{}", field), format!("_env_->{}", size))
                }
                other => {
                    let c_type = self.codegen.c_type(ty)?;
                    let field = self.env.add_scalar(command.id, capture, other.clone(), c_type)?;
                    VarBinding::scalar(format!("_env_->{}", field))
                }
            };
            bindings.insert(capture.clone(), binding);
        }

        let soa_arrays = self.soa_arrays;
        for (global, ty) in &body.globals {
            let items = soa_arrays.get(global).ok_or_else(|| {
                CompileError::internal(format!("structure-of-arrays field '{}' is not registered", global))
            })?;
            let element = array_element(ty)?;
            let c_type = self.codegen.c_type(&element)?;
            let elem_size = Value::element_size(items, &element);
            let items = items.iter().map(|v| v.coerce_to(&element)).collect();
            let (field, size) = self.env.add_soa_array(global, items, c_type, elem_size)?;
            bindings.insert(
                global.clone(),
                VarBinding::array(format!("_env_->{}", field), format!("_env_->{}", size)),
            );
        }

        let function = BlockFunction {
            name: name.clone(),
            block,
            types: body,
            params,
            prelude,
            bindings,
            result: result.clone(),
            comment: Some(format!("command {} ({})", command.id, command.variant())),
        };
        self.codegen.emit_block(&function)?;
        Ok(name)
    }
}

fn array_element(ty: &UnionType) -> Result<UnionType> {
    match ty.singleton() {
        Some(ConcreteType::Array(element)) => Ok((**element).clone()),
        _ => Err(CompileError::internal(format!("{} is not an array type", ty))),
    }
}
