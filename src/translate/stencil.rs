//! Neighborhood gathers for stencil commands.
//!
//! The input is read whole from its producer's buffer. Each thread gathers
//! one value per offset, substituting the fallback when the neighbor lies
//! outside the input's shape in any dimension.

use std::collections::BTreeMap;

use crate::codegen::VarBinding;
use crate::error::{CompileError, Result};
use crate::graph::{Command, CommandKind, StencilStrategy};

use super::{CommandTranslation, CommandTranslator};

/// Row-major stride of each dimension; the last dimension varies fastest.
pub fn row_major_multipliers(dimensions: &[usize]) -> Vec<i64> {
    let mut multipliers = vec![1i64; dimensions.len()];
    for d in (0..dimensions.len().saturating_sub(1)).rev() {
        multipliers[d] = multipliers[d + 1] * dimensions[d + 1] as i64;
    }
    multipliers
}

fn linear_delta(offset: &[i64], multipliers: &[i64]) -> i64 {
    offset.iter().zip(multipliers).map(|(o, m)| o * m).sum()
}

/// Flat index of the neighbor of element `tid` at `offset`, if in bounds.
pub fn neighbor_index(tid: usize, dimensions: &[usize], offset: &[i64]) -> Option<usize> {
    let multipliers = row_major_multipliers(dimensions);
    let mut flat = 0i64;
    for ((&dim, &m), &o) in dimensions.iter().zip(&multipliers).zip(offset) {
        let coord = (tid as i64 / m) % dim as i64 + o;
        if coord < 0 || coord >= dim as i64 {
            return None;
        }
        flat += coord * m;
    }
    Some(flat as usize)
}

/// Device condition that the neighbor at `offset` is inside the input.
fn bounds_check(dimensions: &[usize], offset: &[i64], multipliers: &[i64]) -> String {
    let mut terms = Vec::new();
    for ((&dim, &m), &o) in dimensions.iter().zip(multipliers).zip(offset) {
        if o == 0 {
            continue;
        }
        let coord = if dimensions.len() == 1 {
            "_tid_".to_string()
        } else {
            format!("((_tid_ / {}) % {})", m, dim)
        };
        terms.push(format!(
            "{c} + ({o}) >= 0 && {c} + ({o}) < {dim}",
            c = coord,
            o = o,
            dim = dim
        ));
    }
    if terms.is_empty() {
        "true".to_string()
    } else {
        format!("({})", terms.join(" && "))
    }
}

pub(super) fn lower_stencil(
    tr: &mut CommandTranslator<'_>,
    command: &Command,
) -> Result<CommandTranslation> {
    let id = command.id;
    let CommandKind::Stencil {
        body: block,
        strategy,
        with_index,
    } = &command.kind
    else {
        return Err(CompileError::internal("stencil lowering on another variant"));
    };
    let access = command
        .stencil_access()
        .ok_or_else(|| CompileError::internal(format!("stencil {} has no neighborhood", id)))?;
    let input = &command.inputs[0];
    let graph = tr.graph;
    let table = tr.types;
    let producer = graph.get(input.producer)?;
    let element = table.result(input.producer)?.clone();
    let c_type = tr.codegen.c_type(&element)?;

    let operand = tr.translate_entire(input.producer)?;
    let pointer = tr.bind_operand(&operand)?;
    let fallback = access.fallback.coerce_to(&element);
    let literal = fallback.c_literal().ok_or_else(|| {
        CompileError::internal(format!("stencil fallback {} has no literal", fallback))
    })?;
    let fallback_expr = tr.codegen.coerce(&literal, &fallback.union_type(), &element)?;

    let multipliers = row_major_multipliers(&producer.dimensions);
    let mut execution = Vec::new();
    let mut args = vec!["_env_".to_string()];
    for (k, offset) in access.offsets.iter().enumerate() {
        let gathered = format!("_gather_{}_{}", id, k);
        execution.push(format!(
            "{} {} = {} ? {}[_tid_ + ({})] : {};",
            c_type,
            gathered,
            bounds_check(&producer.dimensions, offset, &multipliers),
            pointer,
            linear_delta(offset, &multipliers),
            fallback_expr
        ));
        args.push(gathered);
    }
    if *with_index {
        let index = command
            .inputs
            .last()
            .ok_or_else(|| CompileError::internal(format!("stencil {} lost its index", id)))?;
        let translation = tr.translate(index.producer)?;
        execution.extend(translation.execution);
        args.push(translation.result);
    }

    let count = access.offsets.len();
    let mut bindings = BTreeMap::new();
    let (params, prelude) = match strategy {
        StencilStrategy::ParameterArray => {
            let name = &block.params[0];
            let mut params: Vec<String> =
                (0..count).map(|k| format!("{} _p_{}", c_type, k)).collect();
            let values: Vec<String> = (0..count).map(|k| format!("_p_{}", k)).collect();
            let prelude = vec![format!(
                "{} v_{}[{}] = {{{}}};",
                c_type,
                name,
                count,
                values.join(", ")
            )];
            bindings.insert(
                name.clone(),
                VarBinding::array(format!("v_{}", name), count.to_string()),
            );
            if *with_index {
                if let Some(index) = block.params.last() {
                    params.push(format!("int v_{}", index));
                }
            }
            (params, prelude)
        }
        StencilStrategy::SeparateScalars => (tr.body_params(command)?, Vec::new()),
    };
    let result = table.result(id)?.clone();
    let name = tr.emit_body(command, params, prelude, bindings, &result)?;
    Ok(CommandTranslation {
        execution,
        result: format!("{}({})", name, args.join(", ")),
        result_type: result,
    })
}
