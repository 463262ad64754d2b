use super::*;
use crate::ast::{Ast, Block};
use crate::graph::{CommandSpec, DevicePtr};
use crate::program::BackendOutput;

fn double() -> Block {
    let mut ast = Ast::new();
    let x = ast.read("x");
    let two = ast.lit(2);
    ast.binary(x, "*", two);
    Block::new(&["x"], ast)
}

/// Hands back fixed results and a pointer per kept slot.
struct MockBackend {
    runs: usize,
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn execute(&mut self, program: &Program) -> Result<BackendOutput> {
        self.runs += 1;
        Ok(BackendOutput {
            result: vec![Value::Int(0); program.result.len],
            kept: program
                .kept
                .iter()
                .enumerate()
                .map(|(i, slot)| (slot.command, DevicePtr(0x1000 + i as u64)))
                .collect(),
        })
    }
}

#[test]
fn test_default_options() {
    let options = CompileOptions::default();
    assert_eq!(options.block_size, 256);
    assert_eq!(options.stencil_strategy, StencilStrategy::ParameterArray);
    assert!(!options.debug_comments);
    assert!(CompileOptions::for_profile("debug").debug_comments);
    assert!(!CompileOptions::for_profile("release").debug_comments);
}

#[test]
fn test_new_graph_uses_compiler_defaults() {
    let compiler = Compiler::new(CompileOptions::default().with_block_size(64));
    let mut graph = compiler.new_graph();
    let a = graph.index(vec![100]).unwrap();
    assert_eq!(graph.get(a).unwrap().block_size, 64);
    let program = compiler.compile(&graph, a).unwrap();
    assert_eq!(program.launches[0].num_blocks, 2);
}

#[test]
fn test_graphs_from_one_compiler_never_share_ids() {
    let compiler = Compiler::default();
    let mut first = compiler.new_graph();
    let mut second = compiler.new_graph();
    let a = first.index(vec![4]).unwrap();
    let b = second.index(vec![4]).unwrap();
    assert_ne!(a, b);
}

#[test]
fn test_debug_profile_emits_command_comments() {
    let compiler = Compiler::new(CompileOptions::for_profile("debug"));
    let mut graph = compiler.new_graph();
    let a = graph.index(vec![4]).unwrap();
    let b = graph.combine(a, &[], double()).unwrap();
    let program = compiler.compile(&graph, b).unwrap();
    assert!(program.source.contains(&format!("// command {} (Combine)", b)));
}

#[test]
fn test_duplicate_class_rejected() {
    let compiler = Compiler::default()
        .with_class(ClassDef::new("Cell").field("alive", UnionType::bool()))
        .unwrap();
    assert!(compiler
        .with_class(ClassDef::new("Cell").field("alive", UnionType::bool()))
        .is_err());
}

#[test]
fn test_soa_array_with_mixed_aggregates_rejected() {
    let items = vec![Value::Int(1), Value::Array(vec![Value::Int(2)])];
    assert!(Compiler::default().with_soa_array("bad", items).is_err());
}

#[test]
fn test_compile_and_interpret_agree_on_shape() {
    let compiler = Compiler::default();
    let mut graph = compiler.new_graph();
    let a = graph.index(vec![6]).unwrap();
    let b = graph.combine(a, &[], double()).unwrap();
    let program = compiler.compile(&graph, b).unwrap();
    let values = compiler.interpret(&graph, b).unwrap();
    assert_eq!(values.len(), program.result.len);
    assert_eq!(values[5], Value::Int(10));
}

#[test]
fn test_run_binds_kept_pointers_for_later_compiles() {
    let compiler = Compiler::default();
    let mut graph = compiler.new_graph();
    let a = graph.index(vec![8]).unwrap();
    let k = graph
        .add(CommandSpec::combine(vec![a], double()).keep())
        .unwrap();
    let mut backend = MockBackend { runs: 0 };
    compiler.run(&graph, k, &mut backend).unwrap();
    assert_eq!(backend.runs, 1);
    let bound = graph.get(k).unwrap().device_result().unwrap();
    assert_eq!(bound.pointer, DevicePtr(0x1000));

    let c = graph.combine(k, &[], double()).unwrap();
    let program = compiler.compile(&graph, c).unwrap();
    assert!(program.kept.is_empty());
    assert!(!program.source.contains(&format!("_block_k_{}_", k)));
    assert!(program
        .source
        .contains(&format!("((int *) _env_->prev_{})[_tid_]", k)));
}

#[test]
fn test_compile_batch_keeps_job_order() {
    let compiler = Compiler::default();
    let graphs: Vec<(CommandGraph, CommandId)> = (1..=4)
        .map(|n| {
            let mut graph = compiler.new_graph();
            let a = graph.index(vec![n * 10]).unwrap();
            let b = graph.combine(a, &[], double()).unwrap();
            (graph, b)
        })
        .collect();
    let jobs: Vec<(&CommandGraph, CommandId)> = graphs.iter().map(|(g, r)| (g, *r)).collect();
    let programs = compiler.compile_batch(&jobs);
    assert_eq!(programs.len(), 4);
    for (i, program) in programs.into_iter().enumerate() {
        assert_eq!(program.unwrap().result.len, (i + 1) * 10);
    }
}
