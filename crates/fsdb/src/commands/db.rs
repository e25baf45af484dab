//! `fsdb db` commands.

use clap::Subcommand;
use serde_json::Value;

use crate::context::Context;
use crate::error::CliError;
use crate::output::Output;

/// Database management commands.
#[derive(Subcommand)]
pub(crate) enum DbCommand {
    /// List all databases.
    List,
    /// Create a database.
    Create {
        /// Database name.
        name: String,
    },
    /// Destroy a database and everything in it.
    Destroy {
        /// Database name.
        name: String,
    },
}

impl DbCommand {
    pub(crate) fn execute(self, ctx: &Context, output: &Output) -> Result<(), CliError> {
        match self {
            Self::List => {
                let names = ctx.client.all_dbs()?;
                output.json(&Value::from(names))
            }
            Self::Create { name } => {
                ctx.client.create_db(&name)?;
                output.success(&format!("Created database {name}"));
                Ok(())
            }
            Self::Destroy { name } => {
                ctx.client.destroy_db(&name)?;
                output.success(&format!("Destroyed database {name}"));
                Ok(())
            }
        }
    }
}
