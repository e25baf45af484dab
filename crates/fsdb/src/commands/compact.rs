//! `fsdb compact` command.

use clap::Args;
use fsdb_storage::CancelToken;

use crate::context::Context;
use crate::error::CliError;
use crate::output::Output;

/// Arguments for the compact command.
#[derive(Args)]
pub(crate) struct CompactArgs {
    /// Database name.
    db: String,
}

impl CompactArgs {
    pub(crate) fn execute(self, ctx: &Context, output: &Output) -> Result<(), CliError> {
        let stats = ctx.db(&self.db)?.compact(&CancelToken::new())?;
        output.line(&format!(
            "Compacted {} documents, removed {} orphaned attachment directories",
            stats.documents, stats.orphaned_dirs
        ))
    }
}
