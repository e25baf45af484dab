//! CLI command implementations.

pub(crate) mod changes;
pub(crate) mod compact;
pub(crate) mod db;
pub(crate) mod document;
pub(crate) mod security;

pub(crate) use changes::ChangesArgs;
pub(crate) use compact::CompactArgs;
pub(crate) use db::DbCommand;
pub(crate) use document::{DeleteArgs, GetArgs, PutArgs};
pub(crate) use security::SecurityArgs;

use std::io::Read;

use serde_json::Value;

use crate::error::CliError;

/// Parse a JSON argument, reading stdin when it is absent or `-`.
pub(crate) fn read_json(arg: Option<&str>) -> Result<Value, CliError> {
    match arg {
        Some(text) if text != "-" => Ok(serde_json::from_str(text)?),
        _ => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(serde_json::from_str(&text)?)
        }
    }
}
