use std::collections::BTreeMap;

use super::*;
use crate::ast::{Ast, Block};
use crate::graph::{offsets_1d, CommandSpec, DevicePtr, DeviceResult, StencilStrategy};
use crate::program::OutputBinding;
use crate::typeck::dispatch::DispatchTable;
use crate::typeck::TypeInferenceEngine;

fn compile(graph: &CommandGraph, root: CommandId) -> Program {
    let classes = ClassRegistry::new();
    let dispatch = DispatchTable::with_builtins();
    let globals = BTreeMap::new();
    let table = TypeInferenceEngine::new(graph, &classes, &dispatch, &globals)
        .infer(root)
        .unwrap();
    let soa = BTreeMap::new();
    CommandTranslator::new(graph, &table, &classes, &soa, false)
        .translate_program(root)
        .unwrap()
}

/// `|x| x <op> k`
fn scale(op: &str, k: i32) -> Block {
    let mut ast = Ast::new();
    let x = ast.read("x");
    let k = ast.lit(k);
    ast.binary(x, op, k);
    Block::new(&["x"], ast)
}

fn sum_of(params: &[&str]) -> Block {
    let mut ast = Ast::new();
    let mut acc = ast.read(params[0]);
    for p in &params[1..] {
        let next = ast.read(p);
        acc = ast.binary(acc, "+", next);
    }
    Block::new(params, ast)
}

/// `|p| p[0] + ... + p[n - 1]` over a gathered neighborhood.
fn gather_sum(n: i32) -> Block {
    let mut ast = Ast::new();
    let mut acc = None;
    for k in 0..n {
        let p = ast.read("p");
        let idx = ast.lit(k);
        let item = ast.call(Some(p), "[]", vec![idx]);
        acc = Some(match acc {
            None => item,
            Some(prev) => ast.binary(prev, "+", item),
        });
    }
    Block::new(&["p"], ast)
}

fn occurrences(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}

#[test]
fn test_element_wise_chain_fuses_into_one_kernel() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![1000]).unwrap();
    let b = graph.combine(a, &[], scale("*", 2)).unwrap();
    let c = graph.combine(b, &[], scale("+", 1)).unwrap();
    let program = compile(&graph, c);
    assert_eq!(program.kernel_count(), 1);
    assert_eq!(program.launch_count(), 1);
    let launch = &program.launches[0];
    assert_eq!(launch.num_threads, 1000);
    assert_eq!(launch.num_blocks, 4);
    assert!(launch.write_back);
    assert_eq!(program.kernels[0].commands, vec![a, b, c]);
    assert!(program.source.contains(&format!(
        "_result_[_tid_] = _block_k_{}_(_env_, _block_k_{}_(_env_, _tid_));",
        c, b
    )));
}

#[test]
fn test_shared_producer_computed_once_per_kernel() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![16]).unwrap();
    let b = graph.combine(a, &[], scale("*", 3)).unwrap();
    let c = graph.combine(b, &[b], sum_of(&["x", "y"])).unwrap();
    let program = compile(&graph, c);
    assert_eq!(program.kernel_count(), 1);
    let temp = format!("int _temp_result_{} = _block_k_{}_(_env_, _tid_);", b, b);
    assert_eq!(occurrences(&program.source, &temp), 1);
    assert!(program.source.contains(&format!(
        "_block_k_{}_(_env_, _temp_result_{}, _temp_result_{})",
        c, b, b
    )));
}

#[test]
fn test_identity_reads_base_array() {
    let mut graph = CommandGraph::new();
    let a = graph
        .to_command(vec![Value::Int(4), Value::Int(5), Value::Int(6)])
        .unwrap();
    let b = graph.combine(a, &[], scale("-", 1)).unwrap();
    let program = compile(&graph, b);
    let base = format!("b{}_base", a);
    assert!(program.source.contains(&format!("int * {};", base)));
    assert!(program.source.contains(&format!("_env_->{}[_tid_]", base)));
    assert!(program.environment.entry(&format!("b{}_size", a)).is_some());
}

#[test]
fn test_plan_for_a_million_elements() {
    let plan = plan_reduction(1_000_000, 256);
    let steps = plan.steps();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[0].threads, 500_000);
    assert_eq!(steps[0].blocks, 1954);
    assert_eq!(steps[1].input_len, 1954);
    assert_eq!(steps[1].blocks, 4);
    assert_eq!(steps[2].input_len, 4);
    assert_eq!(steps[2].blocks, 1);
    assert_eq!(plan.combinations(), 999_999);
}

#[test]
fn test_plan_edge_sizes() {
    assert_eq!(plan_reduction(0, 256), ReductionPlan::Empty);
    assert_eq!(plan_reduction(1, 256), ReductionPlan::Single);
    let two = plan_reduction(2, 256);
    assert_eq!(two.launches(), 1);
    assert_eq!(two.combinations(), 1);
    let odd = plan_reduction(7, 2);
    assert!(odd.steps()[0].odd);
    assert_eq!(odd.combinations(), 6);
}

#[test]
fn test_simulation_combines_exactly_n_minus_one_times() {
    for n in [2usize, 3, 7, 64, 257, 1000, 4099] {
        let values: Vec<i64> = (1..=n as i64).collect();
        let mut count = 0;
        let total = reduce::simulate(&values, 32, |a, b| {
            count += 1;
            Ok(a + b)
        })
        .unwrap();
        assert_eq!(total, Some(values.iter().sum()));
        assert_eq!(count, n - 1, "n = {}", n);
    }
}

#[test]
fn test_simulation_follows_device_combination_order() {
    // pairs first, then a strided tree per block
    let values: Vec<String> = (0..9).map(|i| i.to_string()).collect();
    let joined = reduce::simulate(&values, 4, |a, b| Ok(format!("{}{}", a, b)))
        .unwrap()
        .unwrap();
    assert_eq!(joined, "014523678");
}

#[test]
fn test_reduction_launches_reuse_scratch_buffer() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![1_000_000]).unwrap();
    let r = graph.reduce(a, None, Some("+")).unwrap();
    let program = compile(&graph, r);
    assert_eq!(program.kernel_count(), 2);
    let passes = program.reduction_launches(r);
    assert_eq!(passes.len(), 3);
    assert_eq!(passes[0].num_threads, 500_000);
    assert_eq!(passes[0].args[2], LaunchArg::Buffer(program.kernels[0].output));
    let scratch = passes[0].output.buffer();
    assert_eq!(passes[0].output, OutputBinding::Fresh(scratch));
    assert_eq!(passes[1].output, OutputBinding::Reuse(scratch));
    assert_eq!(passes[2].output, OutputBinding::Reuse(scratch));
    assert_eq!(passes[1].args[2], LaunchArg::Buffer(scratch));
    assert_eq!(passes[2].args[5], LaunchArg::Flag(true));
    assert_eq!(passes[2].args[6], LaunchArg::Buffer(scratch));
    assert!(passes[2].write_back);
    assert!(!passes[1].write_back);
    assert_eq!(program.result.buffer, scratch);
    // index output plus one scratch buffer
    assert_eq!(program.allocations.len(), 2);
    assert!(program.source.contains("__shared__ int _sdata_[256];"));
}

#[test]
fn test_reduction_consumer_fuses_into_last_pass() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![1000]).unwrap();
    let r = graph.reduce(a, None, Some("+")).unwrap();
    let c = graph.combine(r, &[], scale("*", 2)).unwrap();
    let program = compile(&graph, c);
    assert_eq!(program.kernel_count(), 2);
    let passes = program.reduction_launches(r);
    assert_eq!(passes.len(), 2);
    let last = passes[1];
    let result = last.output.buffer();
    assert_eq!(last.output, OutputBinding::Fresh(result));
    assert_ne!(result, passes[0].output.buffer());
    assert!(program.source.contains(&format!(
        "_result_[0] = _block_k_{}_(_env_, _reduce_result_{});",
        c, r
    )));
}

#[test]
fn test_empty_reduction_launches_nothing() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![0]).unwrap();
    let r = graph.reduce(a, None, Some("+")).unwrap();
    let program = compile(&graph, r);
    assert_eq!(program.kernel_count(), 1);
    assert_eq!(program.launch_count(), 0);
    assert_eq!(program.result.len, 0);
}

#[test]
fn test_single_element_reduction_reads_the_element() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![1]).unwrap();
    let r = graph.reduce(a, None, Some("+")).unwrap();
    let program = compile(&graph, r);
    assert!(program.reduction_launches(r).is_empty());
    assert_eq!(program.launch_count(), 2);
    assert!(program
        .source
        .contains(&format!("_result_[_tid_] = _kernel_result_{}[0];", a)));
}

#[test]
fn test_stencil_gathers_with_fallback() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![8]).unwrap();
    let mut ast = Ast::new();
    let p = ast.read("p");
    let zero = ast.lit(0);
    let two = ast.lit(2);
    let left = ast.call(Some(p), "[]", vec![zero]);
    let p2 = ast.read("p");
    let right = ast.call(Some(p2), "[]", vec![two]);
    ast.binary(left, "+", right);
    let s = graph
        .stencil(a, offsets_1d(&[-1, 0, 1]), Value::Int(0), Block::new(&["p"], ast))
        .unwrap();
    let program = compile(&graph, s);
    assert_eq!(program.kernel_count(), 2);
    assert!(program.source.contains(&format!(
        "int _gather_{}_0 = (_tid_ + (-1) >= 0 && _tid_ + (-1) < 8) ? _kernel_result_{}[_tid_ + (-1)] : 0;",
        s, a
    )));
    assert!(program.source.contains(&format!(
        "int _gather_{}_1 = true ? _kernel_result_{}[_tid_ + (0)] : 0;",
        s, a
    )));
    assert!(program.source.contains("int v_p[3] = {_p_0, _p_1, _p_2};"));
}

#[test]
fn test_stencil_separate_scalars_strategy() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![8]).unwrap();
    let spec = CommandSpec::stencil(
        a,
        offsets_1d(&[-1, 1]),
        Value::Int(0),
        sum_of(&["l", "r"]),
    )
    .strategy(StencilStrategy::SeparateScalars);
    let s = graph.add(spec).unwrap();
    let program = compile(&graph, s);
    assert!(program.source.contains(&format!(
        "__device__ int _block_k_{}_(environment_t *_env_, int v_l, int v_r)",
        s
    )));
}

#[test]
fn test_two_dimensional_bounds_check() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![3, 4]).unwrap();
    let s = graph
        .stencil(a, vec![vec![1, 0], vec![0, -1]], Value::Int(0), gather_sum(2))
        .unwrap();
    let program = compile(&graph, s);
    assert!(program.source.contains(
        "(((_tid_ / 4) % 3) + (1) >= 0 && ((_tid_ / 4) % 3) + (1) < 3)"
    ));
    assert!(program.source.contains("[_tid_ + (4)]"));
    assert!(program.source.contains("[_tid_ + (-1)]"));
}

#[test]
fn test_neighbor_index_matches_row_major_layout() {
    assert_eq!(row_major_multipliers(&[3, 4, 5]), vec![20, 5, 1]);
    assert_eq!(neighbor_index(5, &[3, 4], &[1, 0]), Some(9));
    assert_eq!(neighbor_index(4, &[3, 4], &[0, -1]), None);
    assert_eq!(neighbor_index(11, &[3, 4], &[1, 0]), None);
    assert_eq!(neighbor_index(0, &[8], &[-1]), None);
}

#[test]
fn test_kept_command_written_once_and_read_back() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![8]).unwrap();
    let k = graph
        .add(CommandSpec::combine(vec![a], scale("*", 5)).keep())
        .unwrap();
    let s = graph
        .stencil(k, offsets_1d(&[1]), Value::Int(0), gather_sum(1))
        .unwrap();
    let root = graph.zip(s, &[k]).unwrap();
    let program = compile(&graph, root);
    let slot = format!("prev_{}", k);
    assert_eq!(
        occurrences(&program.source, &format!("((int *) _env_->{})[_tid_] = ", slot)),
        1
    );
    assert!(program
        .source
        .contains(&format!("((int *) _env_->{})[_tid_]}}", slot)));
    assert_eq!(
        occurrences(&program.source, &format!("__device__ int _block_k_{}_(", k)),
        1
    );
    assert_eq!(program.kept.len(), 1);
    assert_eq!(program.kept[0].field, slot);
    assert_eq!(program.kernel_count(), 2);
}

#[test]
fn test_device_result_is_read_not_recomputed() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let k = graph
        .add(CommandSpec::combine(vec![a], scale("*", 5)).keep())
        .unwrap();
    let c = graph.combine(k, &[], scale("+", 1)).unwrap();
    graph
        .bind_device_result(
            k,
            DeviceResult {
                pointer: DevicePtr(0xbeef),
                result_type: crate::types::UnionType::int(),
            },
        )
        .unwrap();
    let program = compile(&graph, c);
    assert!(!program.source.contains(&format!("_block_k_{}_", k)));
    assert_eq!(program.kernels[0].commands, vec![c]);
    assert!(program
        .source
        .contains(&format!("((int *) _env_->prev_{})[_tid_]", k)));
    let entry = program.environment.entry(&format!("prev_{}", k)).unwrap();
    assert_eq!(entry.value, crate::env::EnvValue::Pointer(DevicePtr(0xbeef)));
    assert!(program.environment.copies.is_empty());
}

#[test]
fn test_captures_get_distinct_fields_per_command() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let mut first = Ast::new();
    let x = first.read("x");
    let k = first.read("k");
    first.binary(x, "+", k);
    let b = graph
        .combine(a, &[], Block::new(&["x"], first).capture("k", Value::Int(1)))
        .unwrap();
    let mut second = Ast::new();
    let x = second.read("x");
    let k = second.read("k");
    second.binary(x, "*", k);
    let c = graph
        .combine(b, &[], Block::new(&["x"], second).capture("k", Value::Int(2)))
        .unwrap();
    let program = compile(&graph, c);
    let first_field = format!("l{}_k", b);
    let second_field = format!("l{}_k", c);
    assert!(program.environment.entry(&first_field).is_some());
    assert!(program.environment.entry(&second_field).is_some());
    assert!(program.source.contains(&format!("(v_x + _env_->{})", first_field)));
}

#[test]
fn test_keep_on_empty_command_warns() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![0]).unwrap();
    let k = graph
        .add(CommandSpec::combine(vec![a], scale("+", 1)).keep())
        .unwrap();
    let program = compile(&graph, k);
    assert_eq!(program.warnings.len(), 1);
    assert_eq!(program.warnings[0].command, Some(k));
    assert_eq!(program.launch_count(), 0);
}

#[test]
fn test_lowering_registry_covers_every_variant() {
    use crate::graph::Variant;
    for variant in [
        Variant::Index,
        Variant::Identity,
        Variant::Combine,
        Variant::Zip,
        Variant::Reduce,
        Variant::Stencil,
    ] {
        assert!(lowering_for(variant).is_ok(), "{}", variant);
    }
}
