//! Resolved configuration shared by all commands.

use fsdb_client::{Client, Database};
use fsdb_config::{CliSettings, Config};
use fsdb_storage::Format;
use tracing::debug;

use crate::GlobalArgs;
use crate::error::CliError;

/// Client opened on the configured storage root.
pub(crate) struct Context {
    pub(crate) client: Client,
}

impl Context {
    /// Load config, apply global flags and open the storage root.
    pub(crate) fn load(global: &GlobalArgs) -> Result<Self, CliError> {
        let cli_settings = CliSettings {
            root: global.root.clone(),
            format: global.format.clone(),
        };
        let config = Config::load(global.config.as_deref(), Some(&cli_settings))?;
        let storage = &config.storage_resolved;
        let format = Format::by_ext(&storage.format).ok_or_else(|| {
            CliError::Validation(format!("unknown format: {}", storage.format))
        })?;
        debug!(root = %storage.root.display(), format = format.ext(), "opening storage root");

        let client = Client::new(&storage.root)?.with_format(format);
        Ok(Self { client })
    }

    pub(crate) fn db(&self, name: &str) -> Result<Database, CliError> {
        Ok(self.client.db(name)?)
    }
}
