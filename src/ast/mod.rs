//! Per-element body ASTs, stored in an arena.
//!
//! The frontend hands over already-parsed bodies. Nodes refer to each other
//! by `NodeId`, so rewriting a child is an overwrite at an index rather than
//! a pointer swap.

mod display;

use serde::{Deserialize, Serialize};

use crate::span::Span;
use crate::types::Value;

/// Stable index of a node inside its `Ast`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    /// A primitive literal (`nil`, booleans, numbers).
    Literal(Value),
    /// Read of a parameter, local, captured variable, or structure-of-arrays field.
    Read(String),
    /// Assignment to a local variable; evaluates to the assigned value.
    Write { name: String, value: NodeId },
    If {
        cond: NodeId,
        then_branch: NodeId,
        else_branch: Option<NodeId>,
    },
    While { cond: NodeId, body: NodeId },
    /// Method call (with receiver) or free function call (without).
    Call {
        receiver: Option<NodeId>,
        selector: String,
        args: Vec<NodeId>,
    },
    Return(Option<NodeId>),
    Seq(Vec<NodeId>),
}

/// Arena of body nodes plus the root.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ast {
    nodes: Vec<Node>,
    spans: Vec<Option<Span>>,
    root: Option<NodeId>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: Node) -> NodeId {
        self.push_spanned(node, None)
    }

    pub fn push_spanned(&mut self, node: Node, span: Option<Span>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.spans.push(span);
        id
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = Some(root);
    }

    /// Root node; an AST without an explicit root evaluates its last node.
    pub fn root(&self) -> Option<NodeId> {
        self.root.or_else(|| {
            self.nodes
                .len()
                .checked_sub(1)
                .map(|last| NodeId(last as u32))
        })
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    pub fn span(&self, id: NodeId) -> Option<Span> {
        self.spans.get(id.0 as usize).copied().flatten()
    }

    /// Overwrite a node in place; every parent keeps pointing at the same id.
    pub fn replace(&mut self, id: NodeId, node: Node) -> Option<Node> {
        self.nodes
            .get_mut(id.0 as usize)
            .map(|slot| std::mem::replace(slot, node))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn lit(&mut self, value: impl Into<Value>) -> NodeId {
        self.push(Node::Literal(value.into()))
    }

    pub fn nil(&mut self) -> NodeId {
        self.push(Node::Literal(Value::Nil))
    }

    pub fn read(&mut self, name: &str) -> NodeId {
        self.push(Node::Read(name.to_string()))
    }

    pub fn write(&mut self, name: &str, value: NodeId) -> NodeId {
        self.push(Node::Write {
            name: name.to_string(),
            value,
        })
    }

    /// `lhs <op> rhs`, a one-argument call on `lhs`.
    pub fn binary(&mut self, lhs: NodeId, op: &str, rhs: NodeId) -> NodeId {
        self.call(Some(lhs), op, vec![rhs])
    }

    pub fn call(&mut self, receiver: Option<NodeId>, selector: &str, args: Vec<NodeId>) -> NodeId {
        self.push(Node::Call {
            receiver,
            selector: selector.to_string(),
            args,
        })
    }

    pub fn if_else(&mut self, cond: NodeId, then_branch: NodeId, else_branch: Option<NodeId>) -> NodeId {
        self.push(Node::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    pub fn while_loop(&mut self, cond: NodeId, body: NodeId) -> NodeId {
        self.push(Node::While { cond, body })
    }

    pub fn ret(&mut self, value: Option<NodeId>) -> NodeId {
        self.push(Node::Return(value))
    }

    pub fn seq(&mut self, items: Vec<NodeId>) -> NodeId {
        self.push(Node::Seq(items))
    }
}

/// A parsed per-element function body with its parameter and capture metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub params: Vec<String>,
    /// Captured lexical variables and their values at construction time.
    pub captures: Vec<(String, Value)>,
    pub ast: Ast,
    /// Original source text, used only to render diagnostics.
    pub source: Option<String>,
}

impl Block {
    pub fn new(params: &[&str], ast: Ast) -> Self {
        Self {
            params: params.iter().map(|p| p.to_string()).collect(),
            captures: Vec::new(),
            ast,
            source: None,
        }
    }

    pub fn capture(mut self, name: &str, value: Value) -> Self {
        self.captures.push((name.to_string(), value));
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    /// Synthetic two-parameter body `a <op> b`.
    pub fn binary_op(op: &str) -> Self {
        let mut ast = Ast::new();
        let a = ast.read("a");
        let b = ast.read("b");
        let root = ast.binary(a, op, b);
        ast.set_root(root);
        Block::new(&["a", "b"], ast)
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn captured(&self, name: &str) -> Option<&Value> {
        self.captures
            .iter()
            .find(|(capture, _)| capture == name)
            .map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_defaults_to_last_node() {
        let mut ast = Ast::new();
        let a = ast.read("a");
        let one = ast.lit(1);
        let sum = ast.binary(a, "+", one);
        assert_eq!(ast.root(), Some(sum));
        ast.set_root(a);
        assert_eq!(ast.root(), Some(a));
        assert_eq!(ast.len(), 3);
    }

    #[test]
    fn test_replace_keeps_parent_links() {
        let mut ast = Ast::new();
        let a = ast.read("a");
        let one = ast.lit(1);
        let sum = ast.binary(a, "+", one);
        let old = ast.replace(one, Node::Literal(Value::Int(2)));
        assert_eq!(old, Some(Node::Literal(Value::Int(1))));
        match ast.node(sum) {
            Some(Node::Call { args, .. }) => {
                assert_eq!(ast.node(args[0]), Some(&Node::Literal(Value::Int(2))))
            }
            other => panic!("expected call, got {:?}", other),
        }
        assert!(ast.replace(NodeId(99), Node::Seq(vec![])).is_none());
    }

    #[test]
    fn test_binary_op_block() {
        let block = Block::binary_op("*");
        assert_eq!(block.params, vec!["a", "b"]);
        assert_eq!(block.to_string(), "|a, b| a * b");
    }

    #[test]
    fn test_captures_lookup() {
        let block = Block::binary_op("+").capture("scale", Value::Float(2.0));
        assert_eq!(block.captured("scale"), Some(&Value::Float(2.0)));
        assert!(block.captured("other").is_none());
    }

    #[test]
    fn test_spans_are_optional() {
        let mut ast = Ast::new();
        let a = ast.push_spanned(Node::Read("a".into()), Some(Span::new(3, 4)));
        let b = ast.read("b");
        assert_eq!(ast.span(a), Some(Span::new(3, 4)));
        assert_eq!(ast.span(b), None);
    }
}
