//! Database-wide compaction walk.

use std::collections::BTreeSet;
use std::fs;

use tracing::info;

use crate::cancel::CancelToken;
use crate::error::{IoResultExt, Result};
use crate::format::Format;
use crate::store::{SECURITY_BASE, Store, is_main_dir_orphan, remove_dir_all, unescape_id};

/// What a compaction run touched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    /// Documents opened and compacted.
    pub documents: usize,
    /// Canonical attachment directories removed because no revision owned them.
    pub orphaned_dirs: usize,
}

/// Walks a database root and compacts every document found in it.
#[derive(Debug, Clone)]
pub struct Compactor {
    store: Store,
}

impl Compactor {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Compact every document under the store root.
    ///
    /// Documents are discovered from canonical files, history directories and
    /// canonical attachment directories. An attachment directory with neither
    /// a canonical file nor a history directory is removed outright.
    pub fn run(&self, cancel: &CancelToken) -> Result<CompactionStats> {
        let root = self.store.root();
        let mut stats = CompactionStats::default();
        let mut bases = BTreeSet::new();

        for entry in fs::read_dir(root).at(root)? {
            cancel.check()?;
            let entry = entry.at(root)?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let path = entry.path();
            let file_type = entry.file_type().at(&path)?;

            if file_type.is_file() {
                if let Some((base, ext)) = name.rsplit_once('.')
                    && !base.is_empty()
                    && base != SECURITY_BASE
                    && Format::by_ext(ext).is_some()
                {
                    bases.insert(base.to_owned());
                }
            } else if file_type.is_dir() {
                if let Some(base) = name.strip_prefix('.') {
                    if !base.is_empty() {
                        bases.insert(base.to_owned());
                    }
                } else if is_main_dir_orphan(root, &name) {
                    info!(path = %path.display(), "removing orphaned attachment directory");
                    remove_dir_all(&path)?;
                    stats.orphaned_dirs += 1;
                }
            }
        }

        for base in bases {
            cancel.check()?;
            let mut doc = self.store.document(&unescape_id(&base))?;
            if doc.revisions().is_empty() {
                continue;
            }
            doc.compact(cancel)?;
            stats.documents += 1;
        }

        info!(
            root = %root.display(),
            documents = stats.documents,
            orphaned_dirs = stats.orphaned_dirs,
            "compaction finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::StorageErrorKind;
    use crate::revision::Revision;

    fn put(store: &Store, id: &str, body: serde_json::Value) -> String {
        let mut doc = store.document(id).unwrap();
        doc.add_revision(Revision::from_input(body).unwrap(), None, &CancelToken::new())
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_removes_orphaned_attachment_directory() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("foo")).unwrap();
        fs::write(dir.path().join("foo/bar.txt"), "bar").unwrap();
        let store = Store::new(dir.path());

        let stats = Compactor::new(store).run(&CancelToken::new()).unwrap();

        assert!(!dir.path().join("foo").exists());
        assert_eq!(stats.orphaned_dirs, 1);
        assert_eq!(stats.documents, 0);
    }

    #[test]
    fn test_compacts_every_document() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let a1 = put(&store, "a", json!({"v": 1}));
        put(&store, "a", json!({"_rev": a1, "v": 2}));
        let b1 = put(&store, "_design/b", json!({"v": 1}));
        put(&store, "_design/b", json!({"_rev": b1, "v": 2}));
        put(&store, "c", json!({"v": 1}));
        fs::write(dir.path().join("_security.json"), "{}").unwrap();

        let stats = Compactor::new(store.clone()).run(&CancelToken::new()).unwrap();

        assert_eq!(stats.documents, 3);
        assert!(!dir.path().join(".a").exists());
        assert!(!dir.path().join("._design%2Fb").exists());
        assert_eq!(store.open("a").unwrap().revisions().len(), 1);
        assert!(dir.path().join("_security.json").is_file());
    }

    #[test]
    fn test_keeps_attachment_directory_of_live_document() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        put(
            &store,
            "foo",
            json!({"_attachments": {"a.txt": {"data": "YQ=="}}}),
        );

        let stats = Compactor::new(store).run(&CancelToken::new()).unwrap();

        assert_eq!(stats.orphaned_dirs, 0);
        assert_eq!(fs::read(dir.path().join("foo/a.txt")).unwrap(), b"a");
    }

    #[test]
    fn test_history_only_document_is_promoted() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".foo")).unwrap();
        fs::write(dir.path().join(".foo/1-aaa.json"), r#"{"v":1}"#).unwrap();
        let store = Store::new(dir.path());

        Compactor::new(store).run(&CancelToken::new()).unwrap();

        assert!(dir.path().join("foo.json").is_file());
        assert!(!dir.path().join(".foo").exists());
    }

    #[test]
    fn test_missing_root() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join("nope"));

        let err = Compactor::new(store).run(&CancelToken::new()).unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::NotFound);
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        put(&store, "a", json!({"v": 1}));
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = Compactor::new(store).run(&cancel).unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::Cancelled);
    }
}
