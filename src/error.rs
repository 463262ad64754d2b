//! Error taxonomy for construction, inference, and translation.
//!
//! Construction, cycle, and type errors are user-facing and abort the
//! current compilation. Evaluation errors come only from the host reference
//! interpreter. Internal errors mean the translator itself is
//! inconsistent and are never recovered from.

use crate::ast::NodeId;
use crate::diagnostic::Diagnostic;
use crate::graph::{CommandId, GeneratorSite};
use crate::span::Span;

pub type Result<T> = std::result::Result<T, CompileError>;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// Malformed combinator arguments.
    #[error("construction error{}: {message}", at(.command))]
    Construction {
        command: Option<CommandId>,
        message: String,
    },

    /// A command transitively depends on itself.
    #[error("cycle detected at command {command}{}", site_suffix(.site))]
    Cycle {
        command: CommandId,
        site: Option<GeneratorSite>,
    },

    /// Unresolvable selector or a union with no shared representation.
    #[error("type error{}: {message}", at(.command))]
    Type {
        command: Option<CommandId>,
        node: Option<NodeId>,
        span: Option<Span>,
        message: String,
    },

    /// The host reference interpreter could not evaluate a body.
    #[error("evaluation error{}: {message}", at(.command))]
    Evaluation {
        command: Option<CommandId>,
        message: String,
    },

    /// Translator defect: scope underflow, missing cached result.
    #[error("internal consistency error: {0}")]
    Internal(String),
}

fn at(command: &Option<CommandId>) -> String {
    match command {
        Some(id) => format!(" in command {}", id),
        None => String::new(),
    }
}

fn site_suffix(site: &Option<GeneratorSite>) -> String {
    match site {
        Some(site) => format!(" (generated again by call site {})", site.0),
        None => String::new(),
    }
}

impl CompileError {
    pub fn construction(message: impl Into<String>) -> Self {
        CompileError::Construction {
            command: None,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        CompileError::Type {
            command: None,
            node: None,
            span: None,
            message: message.into(),
        }
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        CompileError::Evaluation {
            command: None,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CompileError::Internal(message.into())
    }

    /// Attach the offending command if none is recorded yet.
    pub fn in_command(self, id: CommandId) -> Self {
        match self {
            CompileError::Construction { command: None, message } => CompileError::Construction {
                command: Some(id),
                message,
            },
            CompileError::Type {
                command: None,
                node,
                span,
                message,
            } => CompileError::Type {
                command: Some(id),
                node,
                span,
                message,
            },
            CompileError::Evaluation { command: None, message } => CompileError::Evaluation {
                command: Some(id),
                message,
            },
            other => other,
        }
    }

    /// Attach the offending AST node (and its span) if none is recorded yet.
    pub fn at_node(self, at: NodeId, at_span: Option<Span>) -> Self {
        match self {
            CompileError::Type {
                command,
                node: None,
                span: _,
                message,
            } => CompileError::Type {
                command,
                node: Some(at),
                span: at_span,
                message,
            },
            other => other,
        }
    }

    pub fn command(&self) -> Option<CommandId> {
        match self {
            CompileError::Construction { command, .. }
            | CompileError::Type { command, .. }
            | CompileError::Evaluation { command, .. } => *command,
            CompileError::Cycle { command, .. } => Some(*command),
            CompileError::Internal(_) => None,
        }
    }

    pub fn is_user_facing(&self) -> bool {
        !matches!(self, CompileError::Internal(_))
    }

    /// Convert into a renderable diagnostic.
    pub fn to_diagnostic(&self) -> Diagnostic {
        let span = match self {
            CompileError::Type { span, .. } => *span,
            _ => None,
        };
        let message = match self {
            CompileError::Construction { message, .. }
            | CompileError::Type { message, .. }
            | CompileError::Evaluation { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let mut diag = Diagnostic::error(message, span);
        if let Some(id) = self.command() {
            diag = diag.for_command(id);
        }
        match self {
            CompileError::Cycle { .. } => diag.with_help(
                "a parallel section cannot consume a result produced by the same call site"
                    .to_string(),
            ),
            CompileError::Internal(_) => {
                diag.with_note("this is a translator defect, not an input error".to_string())
            }
            _ => diag,
        }
    }
}
