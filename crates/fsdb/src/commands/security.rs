//! `fsdb security` command.

use clap::Args;
use fsdb_storage::Security;

use super::read_json;
use crate::context::Context;
use crate::error::CliError;
use crate::output::Output;

/// Arguments for the security command.
#[derive(Args)]
pub(crate) struct SecurityArgs {
    /// Database name.
    db: String,

    /// Replace the security document with this JSON (`-` reads stdin).
    #[arg(long)]
    set: Option<String>,
}

impl SecurityArgs {
    pub(crate) fn execute(self, ctx: &Context, output: &Output) -> Result<(), CliError> {
        let db = ctx.db(&self.db)?;
        if let Some(text) = self.set.as_deref() {
            let security: Security = serde_json::from_value(read_json(Some(text))?)?;
            db.set_security(&security)?;
            output.success(&format!("Updated security document of {}", self.db));
            return Ok(());
        }
        output.json(&serde_json::to_value(db.security()?)?)
    }
}
