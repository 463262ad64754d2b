//! Pretty-printing of bodies back to a Ruby-like surface form.
//!
//! Used by diagnostics and debug comments. The output is for humans and is
//! never parsed again.

use std::fmt;

use super::{Ast, Block, Node, NodeId};

const INFIX: &[&str] = &[
    "+", "-", "*", "/", "%", "<", "<=", ">", ">=", "==", "!=", "&", "|", "^", "<<", ">>", "&&",
    "||",
];

/// True if the selector prints as an infix operator.
pub fn is_infix(selector: &str) -> bool {
    INFIX.contains(&selector)
}

impl Ast {
    /// Render the node and its children.
    pub fn format_node(&self, id: NodeId) -> String {
        let Some(node) = self.node(id) else {
            return format!("<missing node {}>", id.0);
        };
        match node {
            Node::Literal(value) => value.to_string(),
            Node::Read(name) => name.clone(),
            Node::Write { name, value } => format!("{} = {}", name, self.format_node(*value)),
            Node::If {
                cond,
                then_branch,
                else_branch,
            } => match else_branch {
                Some(else_branch) => format!(
                    "if {} then {} else {} end",
                    self.format_node(*cond),
                    self.format_node(*then_branch),
                    self.format_node(*else_branch)
                ),
                None => format!(
                    "if {} then {} end",
                    self.format_node(*cond),
                    self.format_node(*then_branch)
                ),
            },
            Node::While { cond, body } => format!(
                "while {} do {} end",
                self.format_node(*cond),
                self.format_node(*body)
            ),
            Node::Call {
                receiver,
                selector,
                args,
            } => self.format_call(*receiver, selector, args),
            Node::Return(Some(value)) => format!("return {}", self.format_node(*value)),
            Node::Return(None) => "return".to_string(),
            Node::Seq(items) => items
                .iter()
                .map(|item| self.format_node(*item))
                .collect::<Vec<_>>()
                .join("; "),
        }
    }

    fn format_call(&self, receiver: Option<NodeId>, selector: &str, args: &[NodeId]) -> String {
        let args_text: Vec<String> = args.iter().map(|a| self.format_node(*a)).collect();
        let Some(receiver) = receiver else {
            return format!("{}({})", selector, args_text.join(", "));
        };
        let recv = self.format_operand(receiver);
        match (selector, args_text.len()) {
            (op, 1) if is_infix(op) => format!("{} {} {}", recv, op, args_text[0]),
            ("-@", 0) => format!("-{}", recv),
            ("!", 0) => format!("!{}", recv),
            ("[]", _) => format!("{}[{}]", recv, args_text.join(", ")),
            (_, 0) => format!("{}.{}", recv, selector),
            _ => format!("{}.{}({})", recv, selector, args_text.join(", ")),
        }
    }

    /// Receivers that are themselves infix calls get parenthesized.
    fn format_operand(&self, id: NodeId) -> String {
        let text = self.format_node(id);
        match self.node(id) {
            Some(Node::Call {
                receiver: Some(_),
                selector,
                args,
            }) if args.len() == 1 && is_infix(selector) => format!("({})", text),
            _ => text,
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "|{}| ", self.params.join(", "))?;
        match self.ast.root() {
            Some(root) => write!(f, "{}", self.ast.format_node(root)),
            None => write!(f, "nil"),
        }
    }
}
