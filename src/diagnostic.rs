use crate::graph::CommandId;
use crate::span::Span;

/// A compiler diagnostic (error or warning) attached to a command body.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Location inside the offending body, when the frontend supplied spans.
    pub span: Option<Span>,
    /// The command whose body or construction produced the diagnostic.
    pub command: Option<CommandId>,
    pub notes: Vec<String>,
    pub help: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl Diagnostic {
    pub fn error(message: String, span: Option<Span>) -> Self {
        Self {
            severity: Severity::Error,
            message,
            span,
            command: None,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn warning(message: String, span: Option<Span>) -> Self {
        Self {
            severity: Severity::Warning,
            message,
            span,
            command: None,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn for_command(mut self, command: CommandId) -> Self {
        self.command = Some(command);
        self
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.notes.push(note);
        self
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }

    fn build_report<'a>(
        &'a self,
        filename: &'a str,
        source_len: usize,
    ) -> ariadne::Report<'a, (&'a str, std::ops::Range<usize>)> {
        use ariadne::{Color, Config, Label, Report, ReportKind};

        let kind = match self.severity {
            Severity::Error => ReportKind::Error,
            Severity::Warning => ReportKind::Warning,
        };

        let color = match self.severity {
            Severity::Error => Color::Red,
            Severity::Warning => Color::Yellow,
        };

        // Spans from a different body than `source` must not index past its end.
        let range = self
            .span
            .filter(|s| !s.is_dummy() && (s.end as usize) <= source_len)
            .map(|s| s.range())
            .unwrap_or(0..0);

        let mut report = Report::build(kind, filename, range.start)
            .with_config(Config::default().with_color(false))
            .with_message(self.headline());

        if !range.is_empty() {
            report = report.with_label(
                Label::new((filename, range))
                    .with_message(&self.message)
                    .with_color(color),
            );
        }

        for note in &self.notes {
            report = report.with_note(note);
        }

        if let Some(help) = &self.help {
            report = report.with_help(help);
        }

        report.finish()
    }

    fn headline(&self) -> String {
        match self.command {
            Some(id) => format!("{} (command {})", self.message, id),
            None => self.message.clone(),
        }
    }

    /// Render the diagnostic against the body source into a string.
    pub fn render_to_string(&self, filename: &str, source: &str) -> String {
        use ariadne::Source;

        let mut out = Vec::new();
        let written = self
            .build_report(filename, source.len())
            .write((filename, Source::from(source)), &mut out);
        match written {
            Ok(()) => String::from_utf8_lossy(&out).into_owned(),
            Err(_) => self.headline(),
        }
    }

    /// Render the diagnostic to stderr using ariadne.
    pub fn render(&self, filename: &str, source: &str) {
        use ariadne::Source;

        let _ = self
            .build_report(filename, source.len())
            .eprint((filename, Source::from(source)));
    }
}

/// Render a list of diagnostics.
pub fn render_diagnostics(diagnostics: &[Diagnostic], filename: &str, source: &str) {
    for diag in diagnostics {
        diag.render(filename, source);
    }
}
