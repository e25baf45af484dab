//! `fsdb get`, `fsdb put` and `fsdb delete` commands.

use clap::Args;
use fsdb_client::{GetOptions, PutOptions};
use fsdb_storage::CancelToken;
use serde_json::json;

use super::read_json;
use crate::context::Context;
use crate::error::CliError;
use crate::output::Output;

/// Arguments for the get command.
#[derive(Args)]
pub(crate) struct GetArgs {
    /// Database name.
    db: String,

    /// Document ID.
    id: String,

    /// Fetch this revision instead of the winner.
    #[arg(long)]
    rev: Option<String>,

    /// Include the revision history.
    #[arg(long)]
    revs: bool,

    /// Include the status of every ancestor revision.
    #[arg(long)]
    revs_info: bool,

    /// Inline attachment content as base64.
    #[arg(short, long)]
    attachments: bool,
}

impl GetArgs {
    pub(crate) fn execute(self, ctx: &Context, output: &Output) -> Result<(), CliError> {
        let db = ctx.db(&self.db)?;
        let opts = GetOptions {
            rev: self.rev,
            revs: self.revs,
            revs_info: self.revs_info,
            attachments: self.attachments,
            json_only: true,
        };
        let fetched = db.get(&self.id, &opts)?;
        output.json(&fetched.body)
    }
}

/// Arguments for the put command.
#[derive(Args)]
pub(crate) struct PutArgs {
    /// Database name.
    db: String,

    /// Document ID.
    id: String,

    /// Document body as JSON (default: read from stdin).
    body: Option<String>,

    /// Parent revision; must match the body `_rev` when both are set.
    #[arg(long)]
    rev: Option<String>,
}

impl PutArgs {
    pub(crate) fn execute(self, ctx: &Context, output: &Output) -> Result<(), CliError> {
        let db = ctx.db(&self.db)?;
        let body = read_json(self.body.as_deref())?;
        let opts = PutOptions {
            rev: self.rev,
            cancel: CancelToken::new(),
        };
        let rev = db.put(&self.id, body, &opts)?;
        output.json(&json!({"ok": true, "id": self.id, "rev": rev}))
    }
}

/// Arguments for the delete command.
#[derive(Args)]
pub(crate) struct DeleteArgs {
    /// Database name.
    db: String,

    /// Document ID.
    id: String,

    /// Current revision of the document.
    #[arg(long)]
    rev: String,
}

impl DeleteArgs {
    pub(crate) fn execute(self, ctx: &Context, output: &Output) -> Result<(), CliError> {
        let db = ctx.db(&self.db)?;
        let rev = db.delete(&self.id, &self.rev, &CancelToken::new())?;
        output.json(&json!({"ok": true, "id": self.id, "rev": rev}))
    }
}
