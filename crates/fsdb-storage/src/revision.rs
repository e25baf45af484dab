//! A single document revision and its flat wire encoding.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde::ser::SerializeMap;
use serde_json::{Map, Value};

use crate::attachment::{Attachment, RenderMode, WireAttachment, invalid_attachment};
use crate::error::{Result, StorageError};
use crate::rev::{RevHistory, RevId};

/// Top-level members owned by the storage layer. Document payloads may not
/// use them.
pub const RESERVED_KEYS: [&str; 9] = [
    "_id",
    "_rev",
    "_attachments",
    "_revisions",
    "_revs_info",
    "_deleted",
    "_conflicts",
    "_deleted_conflicts",
    "_local_seq",
];

#[must_use]
pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// One immutable version of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub rev: RevId,
    pub deleted: bool,
    pub attachments: BTreeMap<String, Attachment>,
    pub(crate) history: Option<RevHistory>,
    pub data: Map<String, Value>,
    pub(crate) location: Option<PathBuf>,
}

/// Status of one ancestor in `_revs_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevInfo {
    pub rev: String,
    pub status: &'static str,
}

impl Revision {
    /// Empty revision with only a payload.
    #[must_use]
    pub fn new(data: Map<String, Value>) -> Self {
        Self {
            rev: RevId::default(),
            deleted: false,
            attachments: BTreeMap::new(),
            history: None,
            data,
            location: None,
        }
    }

    /// Deletion tombstone.
    #[must_use]
    pub fn tombstone() -> Self {
        let mut rev = Self::new(Map::new());
        rev.deleted = true;
        rev
    }

    /// Normalize a caller-supplied document body.
    ///
    /// Reserved members are lifted into metadata, `_id` and `_revisions` are
    /// discarded and any other key starting with `_` is rejected.
    pub fn from_input(value: Value) -> Result<Self> {
        let Value::Object(object) = value else {
            return Err(StorageError::bad_request("Document must be a JSON object"));
        };
        let mut revision = Self::new(Map::new());
        for (key, value) in object {
            match key.as_str() {
                "_rev" => {
                    revision.rev = RevId::from_value(&value)
                        .map_err(|e| StorageError::bad_request(e.to_string()))?;
                }
                "_deleted" => revision.deleted = parse_deleted(&value)?,
                "_attachments" => revision.attachments = parse_attachments(&value)?,
                "_id" | "_revisions" | "_revs_info" | "_conflicts" | "_deleted_conflicts"
                | "_local_seq" => {}
                k if k.starts_with('_') => {
                    return Err(StorageError::bad_request(format!(
                        "Bad special document member: {k}"
                    )));
                }
                _ => {
                    revision.data.insert(key, value);
                }
            }
        }
        Ok(revision)
    }

    /// Parse a revision file.
    ///
    /// `file_rev` is the identifier encoded in a historical file name and
    /// takes precedence over the body. A canonical file without a usable
    /// `_rev` is treated as sequence 1. Reserved keys that leak into the
    /// payload are dropped.
    pub fn from_stored(value: Value, file_rev: Option<RevId>, location: PathBuf) -> Result<Self> {
        let Value::Object(object) = value else {
            return Err(StorageError::internal("revision file is not an object").with_path(location));
        };
        let mut revision = Self::new(Map::new());
        for (key, value) in object {
            match key.as_str() {
                "_rev" => revision.rev = RevId::from_value(&value).unwrap_or_default(),
                "_deleted" => revision.deleted = value.as_bool().unwrap_or(false),
                "_attachments" => {
                    revision.attachments =
                        parse_attachments(&value).map_err(|e| e.with_path(&location))?;
                }
                "_revisions" => revision.history = serde_json::from_value(value).ok(),
                k if is_reserved(k) => {}
                _ => {
                    revision.data.insert(key, value);
                }
            }
        }
        match file_rev {
            Some(rev) => revision.rev = rev,
            None if revision.rev.is_zero() => revision.rev = RevId::new(1, ""),
            None => {}
        }
        if revision
            .history
            .as_ref()
            .is_some_and(|h| h.ids.is_empty() || u64::try_from(h.start).ok() != Some(revision.rev.seq()))
        {
            revision.history = None;
        }
        revision.location = Some(location);
        Ok(revision)
    }

    /// Ancestor chain, synthesized when none was stored.
    #[must_use]
    pub fn history(&self) -> RevHistory {
        self.history
            .clone()
            .unwrap_or_else(|| RevHistory::synthesize(&self.rev))
    }

    /// Path of the metadata file, once written.
    #[must_use]
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Directory holding this revision's own attachment files.
    #[must_use]
    pub fn attachment_dir(&self) -> Option<PathBuf> {
        self.location.as_deref().map(attachment_dir)
    }

    /// Flat wire body with attachments encoded in `mode`.
    pub fn body(&self, mode: RenderMode) -> Result<RevisionBody<'_>> {
        let attachments = self
            .attachments
            .iter()
            .map(|(name, att)| Ok((name.as_str(), att.wire(mode)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(RevisionBody {
            id: None,
            rev: &self.rev,
            deleted: self.deleted,
            attachments,
            revisions: None,
            revs_info: None,
            data: &self.data,
        })
    }

    /// Bytes hashed to mint the identifier of this revision's successor
    /// sequence: the stub-mode body without `_id` or `_revisions`.
    pub(crate) fn hash_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.body(RenderMode::Stub)?)
            .map_err(|e| StorageError::internal("failed to encode revision").with_source(e))
    }

    /// Value written to the revision file.
    pub(crate) fn stored_value(&self) -> Result<Value> {
        let body = self.body(RenderMode::Stub)?.with_revisions(self.history());
        serde_json::to_value(&body)
            .map_err(|e| StorageError::internal("failed to encode revision").with_source(e))
    }
}

/// Metadata file location → directory of the revision's attachments.
pub(crate) fn attachment_dir(location: &Path) -> PathBuf {
    location.with_extension("")
}

fn parse_deleted(value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        _ => Err(StorageError::bad_request("_deleted must be a boolean")),
    }
}

fn parse_attachments(value: &Value) -> Result<BTreeMap<String, Attachment>> {
    let Value::Object(map) = value else {
        return Err(StorageError::bad_request(
            "bad special document member: _attachments",
        ));
    };
    map.iter()
        .map(|(filename, value)| {
            if !is_safe_filename(filename) {
                return Err(invalid_attachment(filename));
            }
            Ok((filename.clone(), Attachment::from_value(filename, value)?))
        })
        .collect()
}

fn is_safe_filename(filename: &str) -> bool {
    !filename.is_empty()
        && Path::new(filename)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Serializable flat view of a revision.
///
/// Member order is `_id`, `_rev`, `_deleted`, `_attachments`, `_revisions`,
/// `_revs_info`, then payload keys in sorted order.
#[derive(Debug)]
pub struct RevisionBody<'a> {
    id: Option<&'a str>,
    rev: &'a RevId,
    deleted: bool,
    attachments: Vec<(&'a str, WireAttachment<'a>)>,
    revisions: Option<RevHistory>,
    revs_info: Option<Vec<RevInfo>>,
    data: &'a Map<String, Value>,
}

impl<'a> RevisionBody<'a> {
    #[must_use]
    pub fn with_id(mut self, id: &'a str) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn with_revisions(mut self, history: RevHistory) -> Self {
        self.revisions = Some(history);
        self
    }

    #[must_use]
    pub fn with_revs_info(mut self, info: Vec<RevInfo>) -> Self {
        self.revs_info = Some(info);
        self
    }

    /// Convert into a generic JSON value.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self)
            .map_err(|e| StorageError::internal("failed to encode revision").with_source(e))
    }
}

struct AttachmentsMap<'b, 'a>(&'b [(&'a str, WireAttachment<'a>)]);

impl Serialize for AttachmentsMap<'_, '_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, att) in self.0 {
            map.serialize_entry(name, att)?;
        }
        map.end()
    }
}

impl Serialize for RevisionBody<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(id) = self.id {
            map.serialize_entry("_id", id)?;
        }
        map.serialize_entry("_rev", self.rev)?;
        if self.deleted {
            map.serialize_entry("_deleted", &true)?;
        }
        if !self.attachments.is_empty() {
            map.serialize_entry("_attachments", &AttachmentsMap(&self.attachments))?;
        }
        if let Some(revisions) = &self.revisions {
            map.serialize_entry("_revisions", revisions)?;
        }
        if let Some(info) = &self.revs_info {
            map.serialize_entry("_revs_info", info)?;
        }
        for (key, value) in self.data {
            if !is_reserved(key) {
                map.serialize_entry(key, value)?;
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::StorageErrorKind;

    #[test]
    fn test_from_input_splits_metadata_and_payload() {
        let rev = Revision::from_input(json!({
            "_id": "foo",
            "_rev": "1-abc",
            "value": "bar",
        }))
        .unwrap();

        assert_eq!(rev.rev, RevId::new(1, "abc"));
        assert_eq!(Value::Object(rev.data), json!({"value": "bar"}));
        assert!(!rev.deleted);
    }

    #[test]
    fn test_from_input_rejects_unknown_special_member() {
        let err = Revision::from_input(json!({"_foo": 1})).unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::BadRequest);
        assert_eq!(err.to_string(), "Bad special document member: _foo");
    }

    #[test]
    fn test_from_input_rejects_non_object() {
        let err = Revision::from_input(json!([1, 2])).unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::BadRequest);
    }

    #[test]
    fn test_from_input_rejects_bad_rev() {
        let err = Revision::from_input(json!({"_rev": "nope"})).unwrap_err();

        assert_eq!(err.kind, StorageErrorKind::BadRequest);
    }

    #[test]
    fn test_from_input_rejects_malformed_attachments() {
        let err = Revision::from_input(json!({"_attachments": "foo"})).unwrap_err();

        assert_eq!(err.to_string(), "bad special document member: _attachments");
    }

    #[test]
    fn test_from_input_rejects_traversal_filename() {
        let err = Revision::from_input(json!({
            "_attachments": {"../escape": {"data": ""}}
        }))
        .unwrap_err();

        assert_eq!(err.to_string(), "invalid attachment data for ../escape");
    }

    #[test]
    fn test_from_stored_main_defaults_to_seq_one() {
        let rev = Revision::from_stored(
            json!({"foo": "bar"}),
            None,
            PathBuf::from("/db/foo.json"),
        )
        .unwrap();

        assert_eq!(rev.rev.to_string(), "1-");
        assert_eq!(rev.history().ancestors(), vec!["1-"]);
        assert_eq!(rev.attachment_dir(), Some(PathBuf::from("/db/foo")));
    }

    #[test]
    fn test_from_stored_drops_leaked_reserved_keys() {
        let rev = Revision::from_stored(
            json!({"_rev": "2-abc", "_id": "foo", "_conflicts": [], "_custom": 1, "a": 1}),
            None,
            PathBuf::from("/db/foo.json"),
        )
        .unwrap();

        assert_eq!(Value::Object(rev.data), json!({"_custom": 1, "a": 1}));
    }

    #[test]
    fn test_from_stored_file_rev_wins() {
        let rev = Revision::from_stored(
            json!({"_rev": "9-zzz"}),
            Some(RevId::new(2, "abc")),
            PathBuf::from("/db/.foo/2-abc.json"),
        )
        .unwrap();

        assert_eq!(rev.rev, RevId::new(2, "abc"));
        assert_eq!(rev.attachment_dir(), Some(PathBuf::from("/db/.foo/2-abc")));
    }

    #[test]
    fn test_from_stored_keeps_matching_history() {
        let rev = Revision::from_stored(
            json!({"_rev": "2-bbb", "_revisions": {"start": 2, "ids": ["bbb", "aaa"]}}),
            None,
            PathBuf::from("/db/foo.json"),
        )
        .unwrap();

        assert_eq!(rev.history().ancestors(), vec!["2-bbb", "1-aaa"]);
    }

    #[test]
    fn test_hash_payload_of_new_document() {
        let rev = Revision::from_input(json!({"foo": "bar"})).unwrap();

        let payload = rev.hash_payload().unwrap();

        assert_eq!(payload, br#"{"_rev":"","foo":"bar"}"#);
    }

    #[test]
    fn test_body_member_order() {
        let mut rev = Revision::from_input(json!({
            "_rev": "1-abc",
            "_deleted": true,
            "z": 1,
            "a": 2,
        }))
        .unwrap();
        rev.attachments.insert(
            "foo.txt".to_owned(),
            Attachment::from_bytes("text/plain", b"Test content\n".to_vec()),
        );

        let body = rev
            .body(RenderMode::Stub)
            .unwrap()
            .with_id("doc")
            .with_revisions(rev.history());
        let json = serde_json::to_string(&body).unwrap();

        assert_eq!(
            json,
            concat!(
                r#"{"_id":"doc","_rev":"1-abc","_deleted":true,"_attachments":{"foo.txt":"#,
                r#"{"content_type":"text/plain","length":13,"digest":"md5-EMUuEXyjHv9UCGbpjbnwxQ==","stub":true}},"#,
                r#""_revisions":{"start":1,"ids":["abc"]},"a":2,"z":1}"#
            )
        );
    }

    #[test]
    fn test_tombstone() {
        let rev = Revision::tombstone();

        assert!(rev.deleted);
        assert!(rev.data.is_empty());
        assert!(rev.attachments.is_empty());
    }
}
