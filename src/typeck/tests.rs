use std::collections::BTreeMap;

use super::classes::{ClassDef, ClassRegistry};
use super::dispatch::DispatchTable;
use super::*;
use crate::ast::{Ast, Block, NodeId};
use crate::graph::{offsets_1d, CommandGraph, CommandSpec, StencilStrategy};
use crate::types::Value;

struct Fixture {
    classes: ClassRegistry,
    dispatch: DispatchTable,
    globals: BTreeMap<String, UnionType>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            classes: ClassRegistry::new(),
            dispatch: DispatchTable::with_builtins(),
            globals: BTreeMap::new(),
        }
    }

    fn with_class(mut self, class: ClassDef) -> Self {
        self.dispatch.register_class(&class);
        self.classes.register(class).unwrap();
        self
    }

    fn infer(&self, graph: &CommandGraph, root: CommandId) -> Result<TypeTable> {
        TypeInferenceEngine::new(graph, &self.classes, &self.dispatch, &self.globals).infer(root)
    }
}

fn unary(param: &str, build: impl FnOnce(&mut Ast, NodeId)) -> Block {
    let mut ast = Ast::new();
    let x = ast.read(param);
    build(&mut ast, x);
    Block::new(&[param], ast)
}

#[test]
fn test_index_is_int() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let table = Fixture::new().infer(&graph, a).unwrap();
    assert_eq!(table.result(a).unwrap(), &UnionType::int());
}

#[test]
fn test_int_plus_float_is_float() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let body = unary("x", |ast, x| {
        let half = ast.lit(0.5f32);
        ast.binary(x, "+", half);
    });
    let c = graph.combine(a, &[], body).unwrap();
    let table = Fixture::new().infer(&graph, c).unwrap();
    assert_eq!(table.result(c).unwrap(), &UnionType::float());
    assert_eq!(table.command(c).unwrap().params, vec![UnionType::int()]);
}

#[test]
fn test_branches_union_into_polymorphic_result() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let body = unary("x", |ast, x| {
        let two = ast.lit(2);
        let cond = ast.binary(x, ">", two);
        let then_branch = ast.lit(1.5f32);
        let else_branch = ast.lit(7);
        ast.if_else(cond, then_branch, Some(else_branch));
    });
    let c = graph.combine(a, &[], body).unwrap();
    let table = Fixture::new().infer(&graph, c).unwrap();
    let result = table.result(c).unwrap();
    assert_eq!(result.len(), 2);
    assert!(result.is_union_repr());
    assert_eq!(result.c_type().unwrap(), "union_t");
}

#[test]
fn test_call_on_union_receiver_unions_results() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let body = unary("x", |ast, x| {
        let zero = ast.lit(0);
        let cond = ast.binary(x, "==", zero);
        let f = ast.lit(2.5f32);
        let i = ast.lit(3);
        let branch = ast.if_else(cond, f, Some(i));
        let v = ast.write("v", branch);
        let read = ast.read("v");
        let neg = ast.call(Some(read), "-@", vec![]);
        ast.seq(vec![v, neg]);
    });
    let c = graph.combine(a, &[], body).unwrap();
    let table = Fixture::new().infer(&graph, c).unwrap();
    let types = table.command(c).unwrap();
    let body = types.body.as_ref().unwrap();
    assert_eq!(body.locals["v"].len(), 2);
    let site = body
        .calls
        .values()
        .find(|site| site.receiver.as_ref().is_some_and(|r| r.len() == 2))
        .unwrap();
    assert_eq!(site.targets.len(), 2);
    assert_eq!(site.result.len(), 2);
    assert_eq!(types.result.len(), 2);
}

#[test]
fn test_undefined_selector_is_type_error_with_node() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let body = unary("x", |ast, x| {
        ast.call(Some(x), "frobnicate", vec![]);
    });
    let c = graph.combine(a, &[], body).unwrap();
    let err = Fixture::new().infer(&graph, c).unwrap_err();
    match err {
        CompileError::Type {
            command,
            node,
            message,
            ..
        } => {
            assert_eq!(command, Some(c));
            assert!(node.is_some());
            assert!(message.contains("undefined method 'frobnicate' for int"));
        }
        other => panic!("expected type error, got {:?}", other),
    }
}

#[test]
fn test_undefined_variable_reported() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let mut ast = Ast::new();
    let x = ast.read("x");
    let y = ast.read("missing");
    ast.binary(x, "+", y);
    let c = graph.combine(a, &[], Block::new(&["x"], ast)).unwrap();
    let err = Fixture::new().infer(&graph, c).unwrap_err();
    assert!(err.to_string().contains("missing"));
}

#[test]
fn test_loop_local_reaches_fixed_point() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let mut ast = Ast::new();
    let zero = ast.lit(0);
    let init = ast.write("acc", zero);
    let acc = ast.read("acc");
    let x = ast.read("x");
    let cond = ast.binary(acc, "<", x);
    let acc2 = ast.read("acc");
    let half = ast.lit(0.5f32);
    let step = ast.binary(acc2, "+", half);
    let update = ast.write("acc", step);
    let lp = ast.while_loop(cond, update);
    let out = ast.read("acc");
    ast.seq(vec![init, lp, out]);
    let c = graph.combine(a, &[], Block::new(&["x"], ast)).unwrap();
    let table = Fixture::new().infer(&graph, c).unwrap();
    let body = table.command(c).unwrap().body.clone().unwrap();
    assert_eq!(body.locals["acc"].len(), 2);
}

#[test]
fn test_zip_result_is_struct() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![3]).unwrap();
    let b = graph
        .to_command(vec![Value::Float(1.0), Value::Float(2.0), Value::Float(3.0)])
        .unwrap();
    let z = graph.zip(a, &[b]).unwrap();
    let table = Fixture::new().infer(&graph, z).unwrap();
    let result = table.result(z).unwrap();
    assert_eq!(
        result.singleton(),
        Some(&ConcreteType::Struct(vec![UnionType::int(), UnionType::float()]))
    );
}

#[test]
fn test_struct_literal_index_picks_field() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![3]).unwrap();
    let b = graph
        .to_command(vec![Value::Float(1.0), Value::Float(2.0), Value::Float(3.0)])
        .unwrap();
    let z = graph.zip(a, &[b]).unwrap();
    let body = unary("s", |ast, s| {
        let one = ast.lit(1);
        ast.call(Some(s), "[]", vec![one]);
    });
    let c = graph.combine(z, &[], body).unwrap();
    let table = Fixture::new().infer(&graph, c).unwrap();
    assert_eq!(table.result(c).unwrap(), &UnionType::float());
}

#[test]
fn test_reduce_body_must_stay_within_element_type() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![8]).unwrap();
    let mut ast = Ast::new();
    let x = ast.read("a");
    let half = ast.lit(0.5f32);
    ast.binary(x, "*", half);
    let r = graph
        .reduce(a, Some(Block::new(&["a", "b"], ast)), None)
        .unwrap();
    let err = Fixture::new().infer(&graph, r).unwrap_err();
    assert!(matches!(err, CompileError::Type { .. }));
    assert!(err.to_string().contains("reduction body returns"));
}

#[test]
fn test_reduce_result_is_element_type() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![8]).unwrap();
    let r = graph.reduce(a, None, Some("+")).unwrap();
    let table = Fixture::new().infer(&graph, r).unwrap();
    assert_eq!(table.result(r).unwrap(), &UnionType::int());
    assert_eq!(
        table.command(r).unwrap().params,
        vec![UnionType::int(), UnionType::int()]
    );
}

#[test]
fn test_stencil_parameter_array_type() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![10]).unwrap();
    let mut ast = Ast::new();
    let p = ast.read("p");
    let size = ast.call(Some(p), "size", vec![]);
    let p2 = ast.read("p");
    let zero = ast.lit(0);
    let first = ast.call(Some(p2), "[]", vec![zero]);
    ast.binary(first, "+", size);
    let s = graph
        .add(
            CommandSpec::stencil(a, offsets_1d(&[-1, 0, 1]), Value::Int(0), Block::new(&["p"], ast))
                .strategy(StencilStrategy::ParameterArray),
        )
        .unwrap();
    let table = Fixture::new().infer(&graph, s).unwrap();
    assert_eq!(
        table.command(s).unwrap().params,
        vec![UnionType::array_of(UnionType::int())]
    );
    assert_eq!(table.result(s).unwrap(), &UnionType::int());
}

#[test]
fn test_stencil_fallback_must_fit() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![10]).unwrap();
    let mut ast = Ast::new();
    let l = ast.read("l");
    let r = ast.read("r");
    ast.binary(l, "+", r);
    let s = graph
        .add(
            CommandSpec::stencil(a, offsets_1d(&[-1, 1]), Value::Bool(true), Block::new(&["l", "r"], ast))
                .strategy(StencilStrategy::SeparateScalars),
        )
        .unwrap();
    let err = Fixture::new().infer(&graph, s).unwrap_err();
    assert!(err.to_string().contains("fallback"));
}

#[test]
fn test_captured_scalar_and_array() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let mut ast = Ast::new();
    let table_read = ast.read("table");
    let x = ast.read("x");
    let elem = ast.call(Some(table_read), "[]", vec![x]);
    let k = ast.read("k");
    ast.binary(elem, "*", k);
    let body = Block::new(&["x"], ast)
        .capture("k", Value::Int(3))
        .capture(
            "table",
            Value::Array((0..4).map(Value::Int).collect()),
        );
    let c = graph.combine(a, &[], body).unwrap();
    let types = Fixture::new().infer(&graph, c).unwrap();
    let body = types.command(c).unwrap().body.clone().unwrap();
    assert_eq!(body.var_kind("k"), Some(VarKind::Capture));
    assert_eq!(body.captures.len(), 2);
    assert_eq!(types.result(c).unwrap(), &UnionType::int());
}

#[test]
fn test_assigning_to_capture_rejected() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let body = unary("x", |ast, x| {
        ast.write("k", x);
    })
    .capture("k", Value::Int(3));
    let c = graph.combine(a, &[], body).unwrap();
    let err = Fixture::new().infer(&graph, c).unwrap_err();
    assert!(err.to_string().contains("cannot assign to captured variable 'k'"));
}

#[test]
fn test_free_function_call() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let body = unary("x", |ast, x| {
        ast.call(None, "sqrt", vec![x]);
    });
    let c = graph.combine(a, &[], body).unwrap();
    let table = Fixture::new().infer(&graph, c).unwrap();
    assert_eq!(table.result(c).unwrap(), &UnionType::float());
}

fn point_class() -> ClassDef {
    let mut ast = Ast::new();
    let this = ast.read("self");
    let x = ast.call(Some(this), "x", vec![]);
    let factor = ast.read("factor");
    ast.binary(x, "*", factor);
    ClassDef::new("Point")
        .field("x", UnionType::float())
        .field("y", UnionType::float())
        .method("scaled_x", Block::new(&["factor"], ast))
}

fn point(x: f32, y: f32) -> Value {
    Value::Object {
        class: "Point".to_string(),
        fields: vec![
            ("x".to_string(), Value::Float(x)),
            ("y".to_string(), Value::Float(y)),
        ],
    }
}

#[test]
fn test_instance_method_is_collected_once() {
    let fixture = Fixture::new().with_class(point_class());
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let make_body = || {
        let mut ast = Ast::new();
        let p = ast.read("origin");
        let x = ast.read("x");
        ast.call(Some(p), "scaled_x", vec![x]);
        Block::new(&["x"], ast).capture("origin", point(1.0, 2.0))
    };
    let c1 = graph.combine(a, &[], make_body()).unwrap();
    let c2 = graph.combine(c1, &[], {
        let mut ast = Ast::new();
        let v = ast.read("v");
        let one = ast.lit(1);
        let idx = ast.read("origin");
        let call = ast.call(Some(idx), "scaled_x", vec![one]);
        ast.binary(v, "+", call);
        Block::new(&["v"], ast).capture("origin", point(3.0, 4.0))
    })
    .unwrap();
    let table = fixture.infer(&graph, c2).unwrap();
    assert_eq!(table.methods.len(), 1);
    let key = table.methods.keys().next().unwrap();
    assert_eq!(key.class, "Point");
    assert_eq!(key.selector, "scaled_x");
    assert_eq!(key.args, vec![UnionType::int()]);
    assert_eq!(table.result(c2).unwrap(), &UnionType::float());
}

#[test]
fn test_unknown_class_instance_rejected() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let body = unary("x", |_, _| {}).capture("p", point(0.0, 0.0));
    let c = graph.combine(a, &[], body).unwrap();
    let err = Fixture::new().infer(&graph, c).unwrap_err();
    assert!(err.to_string().contains("uninitialized constant Point"));
}

#[test]
fn test_mixed_union_of_class_and_int_is_error() {
    let fixture = Fixture::new().with_class(point_class());
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let mut ast = Ast::new();
    let x = ast.read("x");
    let zero = ast.lit(0);
    let cond = ast.binary(x, "==", zero);
    let p = ast.read("p");
    let other = ast.read("x");
    ast.if_else(cond, p, Some(other));
    let body = Block::new(&["x"], ast).capture("p", point(0.0, 0.0));
    let c = graph.combine(a, &[], body).unwrap();
    let err = fixture.infer(&graph, c).unwrap_err();
    assert!(matches!(err, CompileError::Type { .. }));
}

#[test]
fn test_local_without_device_representation_is_error() {
    let fixture = Fixture::new().with_class(point_class());
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    // v = p; v = x; x
    let mut ast = Ast::new();
    let p = ast.read("p");
    let first = ast.write("v", p);
    let x = ast.read("x");
    let second = ast.write("v", x);
    let out = ast.read("x");
    ast.seq(vec![first, second, out]);
    let body = Block::new(&["x"], ast).capture("p", point(0.0, 0.0));
    let c = graph.combine(a, &[], body).unwrap();
    let err = fixture.infer(&graph, c).unwrap_err();
    assert!(matches!(err, CompileError::Type { .. }));
    assert!(err.to_string().contains("variable 'v'"), "{}", err);
}

#[test]
fn test_memoized_types_are_reused() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let body = unary("x", |ast, x| {
        let one = ast.lit(1);
        ast.binary(x, "+", one);
    });
    let c = graph.combine(a, &[], body).unwrap();
    let fixture = Fixture::new();
    let first = fixture.infer(&graph, c).unwrap();
    let second = fixture.infer(&graph, c).unwrap();
    assert!(Arc::ptr_eq(
        first.command(c).unwrap(),
        second.command(c).unwrap()
    ));
    assert!(graph.command(c).unwrap().inferred().is_some());
}

#[test]
fn test_cycle_after_rewire_reported() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let body = || {
        let mut ast = Ast::new();
        let x = ast.read("x");
        let one = ast.lit(1);
        ast.binary(x, "+", one);
        Block::new(&["x"], ast)
    };
    let b = graph.combine(a, &[], body()).unwrap();
    let c = graph.combine(b, &[], body()).unwrap();
    graph.rewire_input(b, 0, c).unwrap();
    let err = Fixture::new().infer(&graph, c).unwrap_err();
    assert!(matches!(err, CompileError::Cycle { .. }));
}

#[test]
fn test_dependency_order_recorded() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let r = graph.reduce(a, None, Some("+")).unwrap();
    let table = Fixture::new().infer(&graph, r).unwrap();
    assert_eq!(table.order, vec![a, r]);
    assert_eq!(table.len(), 2);
}
