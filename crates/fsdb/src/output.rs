//! Terminal output utilities.

use console::{Style, Term};
use serde_json::Value;

use crate::error::CliError;

/// Results go to stdout, messages to stderr.
pub(crate) struct Output {
    out: Term,
    term: Term,
    green: Style,
    red: Style,
}

impl Output {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            out: Term::stdout(),
            term: Term::stderr(),
            green: Style::new().green(),
            red: Style::new().red(),
        }
    }

    /// Print a JSON result (pretty) on stdout.
    pub(crate) fn json(&self, value: &Value) -> Result<(), CliError> {
        self.out.write_line(&serde_json::to_string_pretty(value)?)?;
        Ok(())
    }

    /// Print a plain result line on stdout.
    pub(crate) fn line(&self, msg: &str) -> Result<(), CliError> {
        self.out.write_line(msg)?;
        Ok(())
    }

    /// Print a success message (green).
    pub(crate) fn success(&self, msg: &str) {
        let _ = self.term.write_line(&self.green.apply_to(msg).to_string());
    }

    /// Print an error message (red).
    pub(crate) fn error(&self, msg: &str) {
        let _ = self.term.write_line(&self.red.apply_to(msg).to_string());
    }
}
