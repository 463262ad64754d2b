use std::collections::BTreeMap;

use super::*;
use crate::ast::Ast;
use crate::graph::{CommandGraph, CommandId};
use crate::typeck::classes::ClassDef;
use crate::typeck::dispatch::DispatchTable;
use crate::typeck::{TypeInferenceEngine, TypeTable};

fn infer(graph: &CommandGraph, root: CommandId, classes: &ClassRegistry) -> TypeTable {
    let mut dispatch = DispatchTable::with_builtins();
    for class in classes.iter() {
        dispatch.register_class(class);
    }
    let globals = BTreeMap::new();
    TypeInferenceEngine::new(graph, classes, &dispatch, &globals)
        .infer(root)
        .unwrap()
}

fn emit(graph: &CommandGraph, root: CommandId, classes: &ClassRegistry) -> (String, String) {
    let table = infer(graph, root, classes);
    let mut ctx = CodegenContext::new(classes, true);
    ctx.emit_methods(&table.methods).unwrap();
    let types = table.command(root).unwrap().clone();
    let body = types.body.clone().unwrap();
    let block = graph.command(root).unwrap().body().unwrap();
    let params = body
        .params
        .iter()
        .map(|(name, ty)| format!("{} v_{}", ctx.c_type(ty).unwrap(), name))
        .collect();
    let function = BlockFunction {
        name: format!("_block_k_{}_", root),
        block,
        types: &body,
        params,
        prelude: Vec::new(),
        bindings: BTreeMap::new(),
        result: types.result.clone(),
        comment: Some(format!("command {}", root)),
    };
    ctx.emit_block(&function).unwrap();
    (ctx.preamble(), ctx.functions())
}

#[test]
fn test_simple_body_function() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let mut ast = Ast::new();
    let x = ast.read("x");
    let two = ast.lit(2);
    ast.binary(x, "*", two);
    let c = graph.combine(a, &[], Block::new(&["x"], ast)).unwrap();
    let (preamble, functions) = emit(&graph, c, &ClassRegistry::new());
    assert!(preamble.is_empty());
    assert!(functions.contains(&format!(
        "__device__ int _block_k_{}_(environment_t *_env_, int v_x)",
        c
    )));
    assert!(functions.contains("return (v_x * 2);"));
    assert!(functions.contains(&format!("// command {}", c)));
}

#[test]
fn test_polymorphic_result_boxes_into_union() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let mut ast = Ast::new();
    let x = ast.read("x");
    let two = ast.lit(2);
    let cond = ast.binary(x, ">", two);
    let f = ast.lit(1.5f32);
    let i = ast.lit(7);
    ast.if_else(cond, f, Some(i));
    let c = graph.combine(a, &[], Block::new(&["x"], ast)).unwrap();
    let (preamble, functions) = emit(&graph, c, &ClassRegistry::new());
    assert!(preamble.contains("typedef struct union_t"));
    assert!(preamble.contains("union_t_from_int(int v)"));
    assert!(functions.contains("__device__ union_t _block_k_"));
    assert!(functions.contains("return union_t_from_float(1.5f);"));
    assert!(functions.contains("return union_t_from_int(7);"));
}

#[test]
fn test_union_receiver_uses_dispatch_helper() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let mut ast = Ast::new();
    let x = ast.read("x");
    let zero = ast.lit(0);
    let cond = ast.binary(x, "==", zero);
    let f = ast.lit(2.5f32);
    let i = ast.lit(3);
    let branch = ast.if_else(cond, f, Some(i));
    let write = ast.write("v", branch);
    let v = ast.read("v");
    let one = ast.lit(1);
    let sum = ast.binary(v, "+", one);
    ast.seq(vec![write, sum]);
    let c = graph.combine(a, &[], Block::new(&["x"], ast)).unwrap();
    let (_, functions) = emit(&graph, c, &ClassRegistry::new());
    assert!(functions.contains("union_t v_v = union_t_nil();"));
    assert!(functions.contains("__device__ union_t _dispatch_0_(environment_t *_env_, union_t _self_, int _arg_0)"));
    assert!(functions.contains("case 1: return union_t_from_int((_self_.value.int_ + _arg_0));"));
    assert!(functions.contains("case 2: return union_t_from_float((_self_.value.float_ + _arg_0));"));
    assert!(functions.contains("_dispatch_0_(_env_, v_v, 1)"));
}

#[test]
fn test_while_loop_reevaluates_condition() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
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
    let out = ast.read("acc");
    ast.seq(vec![init, lp, out]);
    let c = graph.combine(a, &[], Block::new(&["x"], ast)).unwrap();
    let (_, functions) = emit(&graph, c, &ClassRegistry::new());
    assert!(functions.contains("int v_acc = 0;"));
    assert!(functions.contains("while (true) {"));
    assert!(functions.contains("if (!((v_acc < v_x))) break;"));
    assert!(functions.contains("v_acc = (v_acc + 1);"));
    assert!(functions.contains("return v_acc;"));
}

#[test]
fn test_zip_struct_typedef_and_field_access() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![3]).unwrap();
    let b = graph
        .to_command(vec![
            crate::types::Value::Float(1.0),
            crate::types::Value::Float(2.0),
            crate::types::Value::Float(3.0),
        ])
        .unwrap();
    let z = graph.zip(a, &[b]).unwrap();
    let mut ast = Ast::new();
    let s = ast.read("s");
    let one = ast.lit(1);
    ast.call(Some(s), "[]", vec![one]);
    let c = graph.combine(z, &[], Block::new(&["s"], ast)).unwrap();
    let (preamble, functions) = emit(&graph, c, &ClassRegistry::new());
    assert!(preamble.contains("typedef struct {\n    int field_0;\n    float field_1;\n} indexed_struct_2_lt_int_float_gt_t;"));
    assert!(functions.contains("return (v_s).field_1;"));
}

#[test]
fn test_instance_method_emitted_with_prototype() {
    let mut scale = Ast::new();
    let this = scale.read("self");
    let x = scale.call(Some(this), "x", vec![]);
    let factor = scale.read("factor");
    scale.binary(x, "*", factor);
    let mut classes = ClassRegistry::new();
    classes
        .register(
            ClassDef::new("Point")
                .field("x", UnionType::float())
                .method("scaled", Block::new(&["factor"], scale)),
        )
        .unwrap();

    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let mut ast = Ast::new();
    let p = ast.read("p");
    let x = ast.read("x");
    ast.call(Some(p), "scaled", vec![x]);
    let body = Block::new(&["x"], ast).capture(
        "p",
        crate::types::Value::Object {
            class: "Point".to_string(),
            fields: vec![("x".to_string(), crate::types::Value::Float(2.0))],
        },
    );
    let c = graph.combine(a, &[], body).unwrap();

    let table = infer(&graph, c, &classes);
    let mut ctx = CodegenContext::new(&classes, false);
    ctx.emit_methods(&table.methods).unwrap();
    let types = table.command(c).unwrap().clone();
    let body = types.body.clone().unwrap();
    let mut bindings = BTreeMap::new();
    bindings.insert("p".to_string(), VarBinding::scalar(format!("_env_->l{}_p", c)));
    let function = BlockFunction {
        name: format!("_block_k_{}_", c),
        block: graph.command(c).unwrap().body().unwrap(),
        types: &body,
        params: vec!["int v_x".to_string()],
        prelude: Vec::new(),
        bindings,
        result: types.result.clone(),
        comment: None,
    };
    ctx.emit_block(&function).unwrap();
    let functions = ctx.functions();
    assert!(functions.contains(
        "__device__ float _method_0_scaled(environment_t *_env_, cls_Point_t v_self, int v_factor);"
    ));
    assert!(functions.contains("return ((v_self).f_x * v_factor);"));
    assert!(functions.contains(&format!("return _method_0_scaled(_env_, _env_->l{}_p, v_x);", c)));
    assert!(ctx.preamble().contains("} cls_Point_t;"));
}

#[test]
fn test_emitting_same_block_twice_is_noop() {
    let mut graph = CommandGraph::new();
    let a = graph.index(vec![4]).unwrap();
    let mut ast = Ast::new();
    ast.read("x");
    let c = graph.combine(a, &[], Block::new(&["x"], ast)).unwrap();
    let classes = ClassRegistry::new();
    let table = infer(&graph, c, &classes);
    let body = table.command(c).unwrap().body.clone().unwrap();
    let mut ctx = CodegenContext::new(&classes, false);
    let function = BlockFunction {
        name: "_block_k_1_".to_string(),
        block: graph.command(c).unwrap().body().unwrap(),
        types: &body,
        params: vec!["int v_x".to_string()],
        prelude: Vec::new(),
        bindings: BTreeMap::new(),
        result: UnionType::int(),
        comment: None,
    };
    ctx.emit_block(&function).unwrap();
    ctx.emit_block(&function).unwrap();
    assert_eq!(ctx.block_count(), 1);
    assert!(ctx.has_block("_block_k_1_"));
}

#[test]
fn test_coerce_rules() {
    let classes = ClassRegistry::new();
    let mut ctx = CodegenContext::new(&classes, false);
    let num = UnionType::int().union(&UnionType::float());
    assert_eq!(
        ctx.coerce("x", &UnionType::int(), &UnionType::float()).unwrap(),
        "((float) x)"
    );
    assert_eq!(
        ctx.coerce("x", &UnionType::bool(), &num.union(&UnionType::bool())).unwrap(),
        "union_t_from_bool(x)"
    );
    assert_eq!(ctx.coerce("x", &num, &num).unwrap(), "x");
    assert!(ctx.coerce("x", &UnionType::float(), &UnionType::int()).is_err());
    assert!(ctx.uses_union());
}

#[test]
fn test_sanitize_operator_selectors() {
    assert_eq!(sanitize_selector("+"), "plus");
    assert_eq!(sanitize_selector("[]"), "idxidx");
    assert_eq!(sanitize_selector("norm"), "norm");
}
