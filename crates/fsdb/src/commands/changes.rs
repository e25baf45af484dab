//! `fsdb changes` command.

use clap::Args;
use serde_json::json;

use crate::context::Context;
use crate::error::CliError;
use crate::output::Output;

/// Arguments for the changes command.
#[derive(Args)]
pub(crate) struct ChangesArgs {
    /// Database name.
    db: String,
}

impl ChangesArgs {
    pub(crate) fn execute(self, ctx: &Context, output: &Output) -> Result<(), CliError> {
        let changes = serde_json::to_value(ctx.db(&self.db)?.changes()?)?;
        output.json(&json!({ "results": changes }))
    }
}
