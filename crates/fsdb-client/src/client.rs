//! Database directory lifecycle.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use fsdb_storage::{Format, Result, StorageError, Store, escape_id, unescape_id};
use regex::Regex;
use tracing::info;

use crate::database::Database;

static DB_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_$()+/-]*$").unwrap());

/// Entry point: a directory whose sub-directories are databases.
#[derive(Debug, Clone)]
pub struct Client {
    root: PathBuf,
    format: &'static Format,
}

impl Client {
    /// Open the root directory. It must already exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let meta = fs::metadata(&root).map_err(|e| StorageError::io(e, Some(root.clone())))?;
        if !meta.is_dir() {
            return Err(StorageError::bad_request(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root,
            format: Format::json(),
        })
    }

    /// Write new revision files in `format`.
    #[must_use]
    pub fn with_format(mut self, format: &'static Format) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn db_path(&self, name: &str) -> PathBuf {
        self.root.join(escape_id(name))
    }

    /// Names of all databases, sorted.
    pub fn all_dbs(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root).map_err(|e| StorageError::io(e, Some(self.root.clone())))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(e, Some(self.root.clone())))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(unescape_id) else {
                continue;
            };
            if DB_NAME_RE.is_match(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn db_exists(&self, name: &str) -> Result<bool> {
        validate_db_name(name)?;
        Ok(self.db_path(name).is_dir())
    }

    pub fn create_db(&self, name: &str) -> Result<()> {
        validate_db_name(name)?;
        let path = self.db_path(name);
        if path.exists() {
            return Err(StorageError::precondition_failed("database already exists"));
        }
        fs::create_dir(&path).map_err(|e| StorageError::io(e, Some(path.clone())))?;
        info!(db = name, "created database");
        Ok(())
    }

    pub fn destroy_db(&self, name: &str) -> Result<()> {
        validate_db_name(name)?;
        let path = self.db_path(name);
        if !path.is_dir() {
            return Err(StorageError::not_found("database does not exist"));
        }
        fs::remove_dir_all(&path).map_err(|e| StorageError::io(e, Some(path.clone())))?;
        info!(db = name, "destroyed database");
        Ok(())
    }

    /// Handle to an existing database.
    pub fn db(&self, name: &str) -> Result<Database> {
        validate_db_name(name)?;
        let path = self.db_path(name);
        if !path.is_dir() {
            return Err(StorageError::not_found("database does not exist"));
        }
        Ok(Database::new(name, Store::new(path).with_format(self.format)))
    }
}

fn validate_db_name(name: &str) -> Result<()> {
    if DB_NAME_RE.is_match(name) {
        return Ok(());
    }
    Err(StorageError::bad_request(format!(
        "Name: '{name}'. Only lowercase characters (a-z), digits (0-9), and any of the characters _, $, (, ), +, -, and / are allowed. Must begin with a letter."
    )))
}
