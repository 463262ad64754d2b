use std::collections::BTreeMap;

use super::*;
use crate::ast::{Ast, Block, NodeId};
use crate::graph::{offsets_1d, CommandSpec};
use crate::typeck::classes::ClassDef;
use crate::typeck::TypeInferenceEngine;

struct Fixture {
    classes: ClassRegistry,
    dispatch: DispatchTable,
    soa: BTreeMap<String, Vec<Value>>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            classes: ClassRegistry::new(),
            dispatch: DispatchTable::with_builtins(),
            soa: BTreeMap::new(),
        }
    }

    fn with_class(mut self, class: ClassDef) -> Self {
        self.classes.register(class).unwrap();
        let mut dispatch = DispatchTable::with_builtins();
        for class in self.classes.iter() {
            dispatch.register_class(class);
        }
        self.dispatch = dispatch;
        self
    }

    fn run(&self, graph: &CommandGraph, root: CommandId) -> Result<Vec<Value>> {
        let globals = self
            .soa
            .iter()
            .map(|(name, items)| {
                (
                    name.clone(),
                    UnionType::array_of(crate::types::element_type(items)),
                )
            })
            .collect();
        let types = TypeInferenceEngine::new(graph, &self.classes, &self.dispatch, &globals)
            .infer(root)?;
        Interpreter::new(graph, &types, &self.classes, &self.dispatch, &self.soa).evaluate(root)
    }
}

fn ints(values: &[i32]) -> Vec<Value> {
    values.iter().copied().map(Value::Int).collect()
}

fn unary(param: &str, build: impl FnOnce(&mut Ast, NodeId)) -> Block {
    let mut ast = Ast::new();
    let x = ast.read(param);
    build(&mut ast, x);
    Block::new(&[param], ast)
}

#[test]
fn test_index_and_combine() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![5]).unwrap();
    let b = graph
        .combine(
            a,
            &[],
            unary("x", |ast, x| {
                let k = ast.lit(3);
                ast.binary(x, "*", k);
            }),
        )
        .unwrap();
    let values = Fixture::new().run(&graph, b).unwrap();
    assert_eq!(values, ints(&[0, 3, 6, 9, 12]));
}

#[test]
fn test_reduction_matches_sequential_sum() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![100_000]).unwrap();
    let r = graph.reduce(a, None, Some("+")).unwrap();
    let values = Fixture::new().run(&graph, r).unwrap();
    assert_eq!(values, ints(&[704_982_704]));
}

#[test]
fn test_empty_and_single_reductions() {
    let mut graph = CommandGraph::new();
    let empty = graph.index(vec![0]).unwrap();
    let r0 = graph.reduce(empty, None, Some("+")).unwrap();
    assert!(Fixture::new().run(&graph, r0).unwrap().is_empty());
    let one = graph.to_command(ints(&[42])).unwrap();
    let r1 = graph.reduce(one, None, Some("*")).unwrap();
    assert_eq!(Fixture::new().run(&graph, r1).unwrap(), ints(&[42]));
}

#[test]
fn test_stencil_uses_fallback_per_neighbor() {
    let mut graph = CommandGraph::new();
    let a = graph.to_command(ints(&[1, 2, 3, 4])).unwrap();
    let mut ast = Ast::new();
    let l = ast.read("l");
    let c = ast.read("c");
    let r = ast.read("r");
    let lc = ast.binary(l, "+", c);
    ast.binary(lc, "+", r);
    let spec = CommandSpec::stencil(
        a,
        offsets_1d(&[-1, 0, 1]),
        Value::Int(100),
        Block::new(&["l", "c", "r"], ast),
    )
    .strategy(StencilStrategy::SeparateScalars);
    let s = graph.add(spec).unwrap();
    let values = Fixture::new().run(&graph, s).unwrap();
    assert_eq!(values, ints(&[103, 6, 9, 107]));
}

#[test]
fn test_int_fallback_widens_for_float_input() {
    let mut graph = CommandGraph::new();
    let a = graph
        .to_command(vec![Value::Float(0.5), Value::Float(1.5)])
        .unwrap();
    let mut ast = Ast::new();
    let p = ast.read("p");
    let one = ast.lit(1);
    ast.call(Some(p), "[]", vec![one]);
    let s = graph
        .stencil(a, offsets_1d(&[0, 1]), Value::Int(7), Block::new(&["p"], ast))
        .unwrap();
    let values = Fixture::new().run(&graph, s).unwrap();
    assert_eq!(values, vec![Value::Float(1.5), Value::Float(7.0)]);
}

#[test]
fn test_early_return_and_loops() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    // acc = 0; while acc < x { acc = acc + 1 }; if acc > 2 { return 9 }; acc
    let mut ast = Ast::new();
    let zero = ast.lit(0);
    let init = ast.write("acc", zero);
    let acc = ast.read("acc");
    let x = ast.read("x");
    let cond = ast.binary(acc, "<", x);
    let acc2 = ast.read("acc");
    let one = ast.lit(1);
    let step = ast.binary(acc2, "+", one);
    let update = ast.write("acc", step);
    let lp = ast.while_loop(cond, update);
    let acc3 = ast.read("acc");
    let two = ast.lit(2);
    let big = ast.binary(acc3, ">", two);
    let nine = ast.lit(9);
    let early = ast.ret(Some(nine));
    let check = ast.if_else(big, early, None);
    let out = ast.read("acc");
    ast.seq(vec![init, lp, check, out]);
    let b = graph.combine(a, &[], Block::new(&["x"], ast)).unwrap();
    let values = Fixture::new().run(&graph, b).unwrap();
    assert_eq!(values, ints(&[0, 1, 2, 9]));
}

#[test]
fn test_instance_method_and_field_reads() {
    let mut scaled = Ast::new();
    let this = scaled.read("self");
    let x = scaled.call(Some(this), "x", vec![]);
    let factor = scaled.read("factor");
    scaled.binary(x, "*", factor);
    let fixture = Fixture::new().with_class(
        ClassDef::new("Point")
            .field("x", UnionType::float())
            .method("scaled", Block::new(&["factor"], scaled)),
    );

    let mut graph = CommandGraph::new();
    let a = graph.index(vec![3]).unwrap();
    let mut ast = Ast::new();
    let p = ast.read("p");
    let i = ast.read("i");
    ast.call(Some(p), "scaled", vec![i]);
    let body = Block::new(&["i"], ast).capture(
        "p",
        Value::Object {
            class: "Point".to_string(),
            fields: vec![("x".to_string(), Value::Float(0.5))],
        },
    );
    let b = graph.combine(a, &[], body).unwrap();
    let values = fixture.run(&graph, b).unwrap();
    assert_eq!(
        values,
        vec![Value::Float(0.0), Value::Float(0.5), Value::Float(1.0)]
    );
}

#[test]
fn test_soa_field_read() {
    let mut fixture = Fixture::new();
    fixture.soa.insert("mass".to_string(), ints(&[10, 20, 30]));
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![3]).unwrap();
    let b = graph
        .combine(
            a,
            &[],
            unary("i", |ast, i| {
                let mass = ast.read("mass");
                ast.call(Some(mass), "[]", vec![i]);
            }),
        )
        .unwrap();
    assert_eq!(fixture.run(&graph, b).unwrap(), ints(&[10, 20, 30]));
}

#[test]
fn test_division_by_zero_is_evaluation_error() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![2]).unwrap();
    let b = graph
        .combine(
            a,
            &[],
            unary("x", |ast, x| {
                let ten = ast.lit(10);
                ast.binary(ten, "/", x);
            }),
        )
        .unwrap();
    let err = Fixture::new().run(&graph, b).unwrap_err();
    assert!(matches!(err, CompileError::Evaluation { .. }));
    assert_eq!(err.command(), Some(b));
}
