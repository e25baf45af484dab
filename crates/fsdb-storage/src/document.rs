//! All revisions sharing one document ID.
//!
//! `revisions[0]` is always the winner: the greatest [`RevId`]. The winner
//! lives at the canonical path, every other revision under the document's
//! history directory. Writes are made visible one file at a time with the
//! store's atomic rename, attachments always before the metadata file that
//! references them.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::attachment::{Content, invalid_attachment};
use crate::cancel::CancelToken;
use crate::error::{IoResultExt, Result, StorageError};
use crate::rev::{RevHistory, RevId};
use crate::revision::{RevInfo, Revision, attachment_dir};
use crate::store::{
    Store, atomic_copy, atomic_write, move_dir, remove_dir_all, remove_dir_if_empty, remove_file,
};

const UPDATE_CONFLICT: &str = "document update conflict";

/// A document and every revision stored for it.
#[derive(Debug)]
pub struct Document {
    store: Store,
    id: String,
    revisions: Vec<Revision>,
}

impl Document {
    pub(crate) fn from_revisions(store: Store, id: &str, mut revisions: Vec<Revision>) -> Self {
        revisions.sort_by(|a, b| b.rev.cmp(&a.rev));
        Self {
            store,
            id: id.to_owned(),
            revisions,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Revisions, winner first.
    #[must_use]
    pub fn revisions(&self) -> &[Revision] {
        &self.revisions
    }

    #[must_use]
    pub fn winner(&self) -> Option<&Revision> {
        self.revisions.first()
    }

    /// Find a revision by its text form.
    #[must_use]
    pub fn revision(&self, rev: &str) -> Option<&Revision> {
        self.revisions.iter().find(|r| r.rev.to_string() == rev)
    }

    /// Revisions that are nobody's ancestor.
    #[must_use]
    pub fn leaves(&self) -> Vec<&Revision> {
        let index = self.ancestor_index();
        self.revisions
            .iter()
            .filter(|r| !index.contains_key(&r.rev.to_string()))
            .collect()
    }

    /// `_revs_info` entries for `revision`'s lineage.
    #[must_use]
    pub fn revs_info(&self, revision: &Revision) -> Vec<RevInfo> {
        revision
            .history()
            .ancestors()
            .into_iter()
            .map(|rev| {
                let status = match self.revision(&rev) {
                    Some(r) if r.deleted => "deleted",
                    Some(_) => "available",
                    None => "missing",
                };
                RevInfo { rev, status }
            })
            .collect()
    }

    /// Every ancestor revision string mapped to the revisions claiming it.
    fn ancestor_index(&self) -> HashMap<String, Vec<usize>> {
        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, revision) in self.revisions.iter().enumerate() {
            for ancestor in revision.history().ancestors().into_iter().skip(1) {
                index.entry(ancestor).or_default().push(i);
            }
        }
        index
    }

    /// Add a new edit on top of an existing leaf and persist it.
    ///
    /// `target` is an explicitly requested parent revision; it must agree
    /// with the body's `_rev` when both are given. Stub attachments are
    /// checked against the parent and replaced by its copy. Returns the new
    /// revision identifier.
    ///
    /// If persisting fails, a revision that never reached disk is dropped
    /// again so the handle keeps matching what is stored.
    pub fn add_revision(
        &mut self,
        mut revision: Revision,
        target: Option<&RevId>,
        cancel: &CancelToken,
    ) -> Result<RevId> {
        if let Some(target) = target {
            if !revision.rev.is_zero() && revision.rev != *target {
                return Err(StorageError::conflict(
                    "document rev from request body and query string have different values",
                ));
            }
            revision.rev = target.clone();
        }
        let parent = self.find_parent(&mut revision.rev)?.map(|i| &self.revisions[i]);
        if revision.rev.seq() == u64::MAX {
            return Err(StorageError::bad_request(format!(
                "revision {} cannot be extended",
                revision.rev
            )));
        }
        let parent_seq = i64::try_from(revision.rev.seq()).unwrap_or(i64::MAX);

        for (filename, att) in &mut revision.attachments {
            if att.stub {
                let inherited = parent
                    .and_then(|p| p.attachments.get(filename))
                    .filter(|p| {
                        att.digest().is_none_or(|d| Some(d) == p.digest())
                            && att.revpos.is_none_or(|r| Some(r) == p.revpos)
                    })
                    .ok_or_else(|| invalid_attachment(filename))?;
                *att = inherited.clone();
            } else if matches!(att.content, Content::Absent) {
                return Err(invalid_attachment(filename));
            } else if att.revpos.is_none() {
                att.revpos = Some(parent_seq);
            }
        }

        let payload = revision.hash_payload()?;
        revision.rev.increment([payload]);
        let seq = i64::try_from(revision.rev.seq()).unwrap_or(i64::MAX);

        for (filename, att) in &mut revision.attachments {
            if matches!(att.content, Content::Inline(_)) {
                let kept = parent
                    .and_then(|p| p.attachments.get(filename))
                    .filter(|p| p.digest() == att.digest())
                    .and_then(|p| p.revpos);
                att.revpos = Some(kept.unwrap_or(seq));
            }
        }

        revision.history = Some(match parent {
            Some(p) => p.history().child(&revision.rev),
            None => RevHistory::synthesize(&revision.rev),
        });
        revision.location = None;

        if self.revisions.iter().any(|r| r.rev == revision.rev) {
            return Err(StorageError::conflict(UPDATE_CONFLICT));
        }
        let rev = revision.rev.clone();
        debug!(id = %self.id, rev = %rev, "minted revision");

        self.revisions.push(revision);
        self.revisions.sort_by(|a, b| b.rev.cmp(&a.rev));
        if let Err(err) = self.persist(cancel) {
            self.revisions.retain(|r| r.location.is_some());
            return Err(err);
        }
        Ok(rev)
    }

    /// Index of the leaf a new edit with parent `rev` applies to.
    ///
    /// A write without `_rev` creates the document, or resurrects it when
    /// the winner is a deletion tombstone.
    fn find_parent(&self, rev: &mut RevId) -> Result<Option<usize>> {
        let Some(winner) = self.revisions.first() else {
            if rev.is_zero() {
                return Ok(None);
            }
            return Err(StorageError::conflict(UPDATE_CONFLICT));
        };
        if rev.is_zero() {
            if winner.deleted {
                *rev = winner.rev.clone();
                return Ok(Some(0));
            }
            return Err(StorageError::conflict(UPDATE_CONFLICT));
        }
        let index = self.ancestor_index();
        self.revisions
            .iter()
            .position(|r| r.rev == *rev)
            .filter(|&i| !index.contains_key(&self.revisions[i].rev.to_string()))
            .map(Some)
            .ok_or_else(|| StorageError::conflict(UPDATE_CONFLICT))
    }

    /// Write every unwritten revision, then move the winner into the
    /// canonical slot if it is not there yet.
    pub fn persist(&mut self, cancel: &CancelToken) -> Result<()> {
        if self.revisions.is_empty() {
            return Err(StorageError::bad_request("document has no revisions"));
        }
        for i in 0..self.revisions.len() {
            if self.revisions[i].location.is_none() {
                cancel.check()?;
                self.materialize(i)?;
            }
        }
        cancel.check()?;
        self.promote()
    }

    /// Write `revisions[i]` to its historical location: new attachment
    /// bytes first, then the metadata file.
    fn materialize(&mut self, i: usize) -> Result<()> {
        let format = self.store.format();
        let path = self
            .store
            .history_path(&self.id, &self.revisions[i].rev, format.ext());
        let dir = attachment_dir(&path);
        let revision = &mut self.revisions[i];

        for (filename, att) in &mut revision.attachments {
            if let Content::Inline(bytes) = &att.content {
                let dest = dir.join(filename);
                let (length, digest) = atomic_copy(&dest, &mut bytes.as_slice())?;
                att.placed(dest, length, digest);
            }
        }

        let bytes = format.encode(&revision.stored_value()?).map_err(|e| {
            StorageError::internal("failed to encode revision")
                .with_path(&path)
                .with_source(e)
        })?;
        atomic_write(&path, &bytes)?;
        revision.location = Some(path);
        Ok(())
    }

    fn is_main(&self, revision: &Revision) -> bool {
        revision
            .location
            .as_deref()
            .is_some_and(|p| self.store.is_main_path(&self.id, p))
    }

    /// Move the winner into the canonical slot, demoting the occupant.
    fn promote(&mut self) -> Result<()> {
        let Some(winner) = self.revisions.first() else {
            return Ok(());
        };
        if self.is_main(winner) {
            return Ok(());
        }
        if let Some(occupant) = self.revisions.iter().position(|r| self.is_main(r)) {
            let revision = &self.revisions[occupant];
            let to = self
                .store
                .history_path(&self.id, &revision.rev, location_ext(revision));
            self.relocate(occupant, to)?;
        }
        let to = self.store.main_path(&self.id, location_ext(&self.revisions[0]));
        self.relocate(0, to)?;
        debug!(id = %self.id, rev = %self.revisions[0].rev, "promoted winning revision");
        remove_dir_if_empty(&self.store.history_dir(&self.id))
    }

    /// Move `revisions[i]` to metadata path `to`, attachments first.
    fn relocate(&mut self, i: usize, to: PathBuf) -> Result<()> {
        let Some(from) = self.revisions[i].location.clone() else {
            return Err(StorageError::internal("revision has not been written"));
        };
        let from_dir = attachment_dir(&from);
        let to_dir = attachment_dir(&to);
        move_dir(&from_dir, &to_dir)?;
        self.remap(&from_dir, &to_dir);

        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        fs::rename(&from, &to).at(&from)?;
        self.revisions[i].location = Some(to);
        Ok(())
    }

    /// Point in-memory attachment paths under `from` at `to`.
    fn remap(&mut self, from: &Path, to: &Path) {
        for revision in &mut self.revisions {
            for att in revision.attachments.values_mut() {
                if let Content::File(path) = &att.content
                    && let Ok(rest) = path.strip_prefix(from)
                {
                    att.content = Content::File(to.join(rest));
                }
            }
        }
    }

    /// Remove every non-leaf revision and reclaim orphaned attachment files.
    ///
    /// Attachment bytes a surviving revision still reads from a pruned
    /// revision's directory are hard-linked into the survivor's own
    /// directory first.
    pub fn compact(&mut self, cancel: &CancelToken) -> Result<()> {
        if self.revisions.is_empty() {
            return Ok(());
        }
        let index = self.ancestor_index();
        let pruned: Vec<usize> = (1..self.revisions.len())
            .filter(|&i| index.contains_key(&self.revisions[i].rev.to_string()))
            .collect();

        for &i in &pruned {
            cancel.check()?;
            let Some(dir) = self.revisions[i].attachment_dir() else {
                continue;
            };
            for j in 0..self.revisions.len() {
                if !pruned.contains(&j) {
                    self.adopt_attachments(j, &dir)?;
                }
            }
        }

        for &i in &pruned {
            cancel.check()?;
            let revision = &self.revisions[i];
            if let Some(location) = revision.location() {
                remove_file(location)?;
                remove_dir_all(&attachment_dir(location))?;
            }
            info!(id = %self.id, rev = %revision.rev, "pruned non-leaf revision");
        }

        let mut i = 0;
        self.revisions.retain(|_| {
            let keep = !pruned.contains(&i);
            i += 1;
            keep
        });

        cancel.check()?;
        self.promote()?;
        self.sweep(cancel)
    }

    /// Hard-link attachments of `revisions[j]` stored under `dir` into the
    /// revision's own directory.
    fn adopt_attachments(&mut self, j: usize, dir: &Path) -> Result<()> {
        let Some(own_dir) = self.revisions[j].attachment_dir() else {
            return Ok(());
        };
        if own_dir == dir {
            return Ok(());
        }
        for (filename, att) in &mut self.revisions[j].attachments {
            let Some(src) = att.path().filter(|p| p.starts_with(dir)).map(Path::to_path_buf) else {
                continue;
            };
            let dest = own_dir.join(filename);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).at(parent)?;
            }
            match fs::hard_link(&src, &dest) {
                Err(e) if e.kind() != io::ErrorKind::AlreadyExists => {
                    return Err(StorageError::io(e, Some(src)));
                }
                _ => {}
            }
            att.content = Content::File(dest);
        }
        Ok(())
    }

    /// Delete history sub-directories owned by no revision and attachment
    /// files no revision references.
    fn sweep(&self, cancel: &CancelToken) -> Result<()> {
        let owned: HashSet<PathBuf> = self
            .revisions
            .iter()
            .filter_map(Revision::attachment_dir)
            .collect();
        let referenced: HashSet<&Path> = self
            .revisions
            .iter()
            .flat_map(|r| r.attachments.values())
            .filter_map(|a| a.path())
            .collect();

        let history_dir = self.store.history_dir(&self.id);
        match fs::read_dir(&history_dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.at(&history_dir)?;
                    let path = entry.path();
                    if entry.file_type().at(&path)?.is_dir() && !owned.contains(&path) {
                        cancel.check()?;
                        info!(id = %self.id, path = %path.display(), "removing orphaned attachment directory");
                        remove_dir_all(&path)?;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(e, Some(history_dir))),
        }

        for dir in &owned {
            for file in list_files(dir)? {
                if referenced.contains(file.as_path()) {
                    continue;
                }
                cancel.check()?;
                info!(id = %self.id, path = %file.display(), "removing unreferenced attachment");
                remove_file(&file)?;
            }
            if list_files(dir)?.is_empty() {
                remove_dir_all(dir)?;
            }
        }

        remove_dir_if_empty(&history_dir)
    }
}

fn location_ext(revision: &Revision) -> &str {
    revision
        .location()
        .and_then(|p| p.extension())
        .and_then(|e| e.to_str())
        .unwrap_or("json")
}

/// Every file below `dir`, recursively. A missing directory is empty.
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
            return Ok(Vec::new());
        }
        Err(e) => return Err(StorageError::io(e, Some(dir.into()))),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.at(dir)?;
        let path = entry.path();
        if entry.file_type().at(&path)?.is_dir() {
            files.extend(list_files(&path)?);
        } else {
            files.push(path);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use tempfile::TempDir;

    use super::*;
    use crate::StorageErrorKind;
    use crate::attachment::Attachment;

    fn put(store: &Store, id: &str, body: Value) -> Result<RevId> {
        let mut doc = store.document(id)?;
        doc.add_revision(Revision::from_input(body)?, None, &CancelToken::new())
    }

    fn read(path: impl AsRef<Path>) -> Value {
        serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn test_put_new_document() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());

        let rev = put(&store, "foo", json!({"value": "bar"})).unwrap();

        assert_eq!(rev.to_string(), "1-dfa62a1425fc6e708c425f48686f7c78");
        assert_eq!(
            read(dir.path().join("foo.json")),
            json!({
                "_rev": "1-dfa62a1425fc6e708c425f48686f7c78",
                "_revisions": {"start": 1, "ids": ["dfa62a1425fc6e708c425f48686f7c78"]},
                "value": "bar"
            })
        );
        assert!(!dir.path().join(".foo").exists());
    }

    #[test]
    fn test_put_hash_is_independent_of_id() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());

        let a = put(&store, "a", json!({"foo": "bar"})).unwrap();
        let b = put(&store, "b", json!({"foo": "bar"})).unwrap();

        assert_eq!(a.to_string(), "1-04edfaf9abdaed3c0accf6c463e78fd4");
        assert_eq!(a, b);
    }

    #[test]
    fn test_put_with_attachment() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());

        let rev = put(
            &store,
            "foo",
            json!({
                "value": "bar",
                "_attachments": {
                    "!foo.txt": {"content_type": "text/plain", "data": "c29tZSB0ZXN0IGNvbnRlbnQ="}
                }
            }),
        )
        .unwrap();

        assert_eq!(rev.to_string(), "1-1472ad25836971f236294ad7b19d9f65");
        assert_eq!(
            fs::read(dir.path().join("foo/!foo.txt")).unwrap(),
            b"some test content"
        );
        assert_eq!(
            read(dir.path().join("foo.json"))["_attachments"],
            json!({
                "!foo.txt": {
                    "content_type": "text/plain",
                    "revpos": 1,
                    "length": 17,
                    "digest": "md5-2eNn4v/9o9ZdZp3E8/d4Cw==",
                    "stub": true
                }
            })
        );
    }

    #[test]
    fn test_update_moves_parent_to_history() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let first = put(&store, "foo", json!({"foo": "bar"})).unwrap();

        let second = put(&store, "foo", json!({"_rev": first.to_string(), "foo": "quxx"})).unwrap();

        assert_eq!(second.seq(), 2);
        assert_eq!(read(dir.path().join("foo.json"))["foo"], json!("quxx"));
        assert_eq!(
            read(dir.path().join(format!(".foo/{first}.json")))["foo"],
            json!("bar")
        );
        let doc = store.open("foo").unwrap();
        assert_eq!(
            doc.winner().unwrap().history().ancestors(),
            vec![second.to_string(), first.to_string()]
        );
    }

    #[test]
    fn test_update_requires_rev() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        put(&store, "foo", json!({"foo": "bar"})).unwrap();

        let err = put(&store, "foo", json!({"foo": "baz"})).unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::Conflict);
        assert_eq!(err.to_string(), "document update conflict");
    }

    #[test]
    fn test_update_with_stale_rev_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let first = put(&store, "foo", json!({"v": 1})).unwrap();
        put(&store, "foo", json!({"_rev": first.to_string(), "v": 2})).unwrap();

        let err = put(&store, "foo", json!({"_rev": first.to_string(), "v": 3})).unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::Conflict);
    }

    #[test]
    fn test_update_on_max_sequence_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("foo.json"),
            r#"{"_rev":"18446744073709551615-abc"}"#,
        )
        .unwrap();
        let store = Store::new(dir.path());

        let err = put(&store, "foo", json!({"_rev": "18446744073709551615-abc", "v": 1}))
            .unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::BadRequest);
        assert_eq!(
            err.to_string(),
            "revision 18446744073709551615-abc cannot be extended"
        );
        assert!(!dir.path().join(".foo").exists());
    }

    #[test]
    fn test_failed_persist_leaves_document_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let first = put(&store, "foo", json!({"v": 1})).unwrap();
        let mut doc = store.open("foo").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let body = json!({"_rev": first.to_string(), "v": 2});
        let err = doc
            .add_revision(Revision::from_input(body).unwrap(), None, &cancel)
            .unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::Cancelled);
        assert_eq!(doc.revisions().len(), 1);
        assert_eq!(doc.winner().map(|r| r.rev.clone()), Some(first.clone()));
        let second = doc
            .add_revision(
                Revision::from_input(json!({"_rev": first.to_string(), "v": 2})).unwrap(),
                None,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(second.seq(), 2);
    }

    #[test]
    fn test_ids_differing_only_in_escapes_are_distinct() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());

        put(&store, "a%2F", json!({"v": 1})).unwrap();
        put(&store, "a%252F", json!({"v": 2})).unwrap();
        put(&store, ".x", json!({"v": 3})).unwrap();
        put(&store, "%2Ex", json!({"v": 4})).unwrap();

        let value = |id: &str| store.open(id).unwrap().winner().unwrap().data["v"].clone();
        assert_eq!(value("a%2F"), json!(1));
        assert_eq!(value("a%252F"), json!(2));
        assert_eq!(value(".x"), json!(3));
        assert_eq!(value("%2Ex"), json!(4));
        assert_eq!(
            store.document_ids().unwrap(),
            vec!["%2Ex".to_owned(), ".x".to_owned(), "a%252F".to_owned(), "a%2F".to_owned()]
        );
    }

    #[test]
    fn test_new_document_with_rev_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());

        let err = put(&store, "foo", json!({"_rev": "1-abc"})).unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::Conflict);
    }

    #[test]
    fn test_target_and_body_rev_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let mut doc = store.document("foo").unwrap();
        let revision = Revision::from_input(json!({"_rev": "1-abc"})).unwrap();

        let err = doc
            .add_revision(revision, Some(&RevId::new(1, "xyz")), &CancelToken::new())
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "document rev from request body and query string have different values"
        );
    }

    #[test]
    fn test_target_rev_selects_parent() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let first = put(&store, "foo", json!({"v": 1})).unwrap();
        let mut doc = store.open("foo").unwrap();

        let second = doc
            .add_revision(
                Revision::from_input(json!({"v": 2})).unwrap(),
                Some(&first),
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(second.seq(), 2);
    }

    #[test]
    fn test_stub_inherits_parent_attachment() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let first = put(
            &store,
            "foo",
            json!({"_attachments": {"a.txt": {"content_type": "text/plain", "data": "VGVzdCBjb250ZW50Cg=="}}}),
        )
        .unwrap();

        let second = put(
            &store,
            "foo",
            json!({
                "_rev": first.to_string(),
                "v": 2,
                "_attachments": {"a.txt": {"stub": true, "revpos": 1}}
            }),
        )
        .unwrap();

        let doc = store.open("foo").unwrap();
        let winner = doc.winner().unwrap();
        assert_eq!(winner.rev, second);
        let att = &winner.attachments["a.txt"];
        assert_eq!(att.revpos, Some(1));
        assert_eq!(att.read_bytes().unwrap(), b"Test content\n");
        assert_eq!(
            att.path(),
            Some(dir.path().join(format!(".foo/{first}/a.txt")).as_path())
        );
    }

    #[test]
    fn test_stub_with_wrong_digest_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let first = put(
            &store,
            "foo",
            json!({"_attachments": {"a.txt": {"data": "VGVzdCBjb250ZW50Cg=="}}}),
        )
        .unwrap();

        let err = put(
            &store,
            "foo",
            json!({
                "_rev": first.to_string(),
                "_attachments": {"a.txt": {"stub": true, "digest": "md5-wrong"}}
            }),
        )
        .unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::BadRequest);
        assert_eq!(err.to_string(), "invalid attachment data for a.txt");
    }

    #[test]
    fn test_stub_with_wrong_revpos_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let first = put(
            &store,
            "foo",
            json!({"_attachments": {"a.txt": {"data": "VGVzdCBjb250ZW50Cg=="}}}),
        )
        .unwrap();

        let err = put(
            &store,
            "foo",
            json!({
                "_rev": first.to_string(),
                "_attachments": {"a.txt": {"stub": true, "revpos": 7}}
            }),
        )
        .unwrap_err();

        assert_eq!(err.to_string(), "invalid attachment data for a.txt");
    }

    #[test]
    fn test_stub_on_new_document_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());

        let err = put(
            &store,
            "foo",
            json!({"_attachments": {"a.txt": {"stub": true}}}),
        )
        .unwrap_err();

        assert_eq!(err.to_string(), "invalid attachment data for a.txt");
        assert!(!dir.path().join("foo.json").exists());
    }

    #[test]
    fn test_attachment_without_data_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());

        let err = put(
            &store,
            "foo",
            json!({"_attachments": {"a.txt": {"content_type": "text/plain"}}}),
        )
        .unwrap_err();

        assert_eq!(err.to_string(), "invalid attachment data for a.txt");
    }

    #[test]
    fn test_reupload_keeps_revpos_of_identical_content() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let first = put(
            &store,
            "foo",
            json!({"_attachments": {"a.txt": {"data": "VGVzdCBjb250ZW50Cg=="}}}),
        )
        .unwrap();

        put(
            &store,
            "foo",
            json!({
                "_rev": first.to_string(),
                "_attachments": {
                    "a.txt": {"data": "VGVzdCBjb250ZW50Cg=="},
                    "b.txt": {"data": "VGVzdCBjb250ZW50Cg=="}
                }
            }),
        )
        .unwrap();

        let doc = store.open("foo").unwrap();
        let winner = doc.winner().unwrap();
        assert_eq!(winner.attachments["a.txt"].revpos, Some(1));
        assert_eq!(winner.attachments["b.txt"].revpos, Some(2));
    }

    #[test]
    fn test_delete_then_recreate_without_rev() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let first = put(&store, "foo", json!({"v": 1})).unwrap();
        let mut doc = store.open("foo").unwrap();
        let deleted = doc
            .add_revision(Revision::tombstone(), Some(&first), &CancelToken::new())
            .unwrap();

        let recreated = put(&store, "foo", json!({"v": 2})).unwrap();

        assert_eq!(deleted.seq(), 2);
        assert_eq!(recreated.seq(), 3);
        assert_eq!(
            read(dir.path().join(format!(".foo/{deleted}.json")))["_deleted"],
            json!(true)
        );
    }

    #[test]
    fn test_persist_without_revisions() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let mut doc = store.document("foo").unwrap();

        let err = doc.persist(&CancelToken::new()).unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::BadRequest);
        assert_eq!(err.to_string(), "document has no revisions");
    }

    #[test]
    fn test_persist_respects_cancellation() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let mut doc = store.document("foo").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = doc
            .add_revision(Revision::from_input(json!({"v": 1})).unwrap(), None, &cancel)
            .unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::Cancelled);
        assert!(!dir.path().join("foo.json").exists());
    }

    fn conflicting_revision(seq: u64, hash: &str, parent: &RevHistory) -> Revision {
        let mut revision = Revision::from_input(json!({"hash": hash})).unwrap();
        revision.rev = RevId::new(seq, hash);
        revision.history = Some(parent.child(&revision.rev));
        revision
    }

    #[test]
    fn test_tie_is_won_by_greater_hash() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        put(&store, "foo", json!({"v": 1})).unwrap();
        let mut doc = store.open("foo").unwrap();
        let parent = doc.winner().unwrap().history();
        doc.revisions.push(conflicting_revision(2, "yyy", &parent));
        doc.revisions.sort_by(|a, b| b.rev.cmp(&a.rev));
        doc.persist(&CancelToken::new()).unwrap();

        doc.revisions.push(conflicting_revision(2, "zzz", &parent));
        doc.revisions.sort_by(|a, b| b.rev.cmp(&a.rev));
        doc.persist(&CancelToken::new()).unwrap();

        assert_eq!(read(dir.path().join("foo.json"))["hash"], json!("zzz"));
        assert_eq!(read(dir.path().join(".foo/2-yyy.json"))["hash"], json!("yyy"));
        let reopened = store.open("foo").unwrap();
        let leaves: Vec<String> = reopened.leaves().iter().map(|r| r.rev.to_string()).collect();
        assert_eq!(leaves, vec!["2-zzz", "2-yyy"]);
    }

    #[test]
    fn test_winner_is_order_independent() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let parent = RevHistory::synthesize(&RevId::new(1, "aaa"));
        let revs = vec![
            conflicting_revision(2, "yyy", &parent),
            conflicting_revision(2, "zzz", &parent),
            conflicting_revision(1, "zzzz", &RevHistory { start: 0, ids: vec![] }),
        ];
        let mut reversed = revs.clone();
        reversed.reverse();

        let a = Document::from_revisions(store.clone(), "foo", revs);
        let b = Document::from_revisions(store, "foo", reversed);

        assert_eq!(a.winner().unwrap().rev, RevId::new(2, "zzz"));
        assert_eq!(b.winner().unwrap().rev, RevId::new(2, "zzz"));
    }

    #[test]
    fn test_promotion_moves_attachments_with_metadata() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        put(
            &store,
            "foo",
            json!({"_attachments": {"a.txt": {"data": "b2xk"}}}),
        )
        .unwrap();
        let mut doc = store.open("foo").unwrap();
        let parent = doc.winner().unwrap().history();
        let mut revision = conflicting_revision(2, "zzz", &parent);
        revision
            .attachments
            .insert("b.txt".to_owned(), Attachment::from_bytes("text/plain", b"new".to_vec()));
        doc.revisions.push(revision);
        doc.revisions.sort_by(|a, b| b.rev.cmp(&a.rev));

        doc.persist(&CancelToken::new()).unwrap();

        let first = doc.revisions()[1].rev.to_string();
        assert_eq!(fs::read(dir.path().join("foo/b.txt")).unwrap(), b"new");
        assert!(!dir.path().join("foo/a.txt").exists());
        assert_eq!(
            fs::read(dir.path().join(format!(".foo/{first}/a.txt"))).unwrap(),
            b"old"
        );
        assert!(dir.path().join(format!(".foo/{first}.json")).is_file());
        assert_eq!(
            doc.revisions()[1].attachments["a.txt"].path(),
            Some(dir.path().join(format!(".foo/{first}/a.txt")).as_path())
        );
    }

    #[test]
    fn test_revs_info() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let first = put(&store, "foo", json!({"v": 1})).unwrap();
        let second = put(&store, "foo", json!({"_rev": first.to_string(), "v": 2})).unwrap();
        let mut doc = store.open("foo").unwrap();
        doc.compact(&CancelToken::new()).unwrap();

        let info = doc.revs_info(doc.winner().unwrap());

        assert_eq!(
            info,
            vec![
                RevInfo { rev: second.to_string(), status: "available" },
                RevInfo { rev: first.to_string(), status: "missing" },
            ]
        );
    }

    #[test]
    fn test_compact_prunes_non_leaves() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let first = put(&store, "foo", json!({"v": 1})).unwrap();
        let second = put(&store, "foo", json!({"_rev": first.to_string(), "v": 2})).unwrap();
        let third = put(&store, "foo", json!({"_rev": second.to_string(), "v": 3})).unwrap();
        let mut doc = store.open("foo").unwrap();

        doc.compact(&CancelToken::new()).unwrap();

        assert_eq!(doc.revisions().len(), 1);
        assert_eq!(doc.winner().unwrap().rev, third);
        assert!(dir.path().join("foo.json").is_file());
        assert!(!dir.path().join(".foo").exists());
    }

    #[test]
    fn test_compact_keeps_conflicting_leaves() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        put(&store, "foo", json!({"v": 1})).unwrap();
        let mut doc = store.open("foo").unwrap();
        let parent = doc.winner().unwrap().history();
        let first = doc.winner().unwrap().rev.to_string();
        doc.revisions.push(conflicting_revision(2, "yyy", &parent));
        doc.revisions.push(conflicting_revision(2, "zzz", &parent));
        doc.revisions.sort_by(|a, b| b.rev.cmp(&a.rev));
        doc.persist(&CancelToken::new()).unwrap();

        doc.compact(&CancelToken::new()).unwrap();

        let revs: Vec<String> = doc.revisions().iter().map(|r| r.rev.to_string()).collect();
        assert_eq!(revs, vec!["2-zzz", "2-yyy"]);
        assert!(dir.path().join(".foo/2-yyy.json").is_file());
        assert!(!dir.path().join(format!(".foo/{first}.json")).exists());
    }

    #[test]
    fn test_compact_relocates_shared_attachments() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let first = put(
            &store,
            "foo",
            json!({"_attachments": {"a.txt": {"data": "VGVzdCBjb250ZW50Cg=="}}}),
        )
        .unwrap();
        put(
            &store,
            "foo",
            json!({"_rev": first.to_string(), "_attachments": {"a.txt": {"stub": true}}}),
        )
        .unwrap();
        let mut doc = store.open("foo").unwrap();

        doc.compact(&CancelToken::new()).unwrap();

        assert_eq!(
            fs::read(dir.path().join("foo/a.txt")).unwrap(),
            b"Test content\n"
        );
        assert!(!dir.path().join(format!(".foo/{first}")).exists());
        let reopened = store.open("foo").unwrap();
        assert_eq!(
            reopened.winner().unwrap().attachments["a.txt"].read_bytes().unwrap(),
            b"Test content\n"
        );
    }

    #[test]
    fn test_compact_sweeps_orphans() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        put(
            &store,
            "foo",
            json!({"_attachments": {"a.txt": {"data": "VGVzdCBjb250ZW50Cg=="}}}),
        )
        .unwrap();
        fs::write(dir.path().join("foo/stray.txt"), "stray").unwrap();
        fs::create_dir_all(dir.path().join(".foo/9-dead")).unwrap();
        fs::write(dir.path().join(".foo/9-dead/x"), "x").unwrap();
        let mut doc = store.open("foo").unwrap();

        doc.compact(&CancelToken::new()).unwrap();

        assert!(dir.path().join("foo/a.txt").is_file());
        assert!(!dir.path().join("foo/stray.txt").exists());
        assert!(!dir.path().join(".foo").exists());
    }

    #[test]
    fn test_compact_cancelled() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let first = put(&store, "foo", json!({"v": 1})).unwrap();
        put(&store, "foo", json!({"_rev": first.to_string(), "v": 2})).unwrap();
        let mut doc = store.open("foo").unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = doc.compact(&cancel).unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::Cancelled);
        assert!(dir.path().join(format!(".foo/{first}.json")).is_file());
    }
}
