//! Document operations on a single database.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::io::Read;

use fsdb_storage::{
    Attachment, CancelToken, CompactionStats, Compactor, RenderMode, Result, RevId, Revision,
    Security, StorageError, Store,
};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Options for [`Database::get`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Specific revision to fetch instead of the winner.
    pub rev: Option<String>,
    /// Include `_revisions`.
    pub revs: bool,
    /// Include `_revs_info`. Ignored when `rev` is given.
    pub revs_info: bool,
    /// Include attachment content.
    pub attachments: bool,
    /// Inline attachment content as base64 rather than returning readers.
    pub json_only: bool,
}

/// Options for [`Database::put`].
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Parent revision; must agree with the body `_rev` when both are set.
    pub rev: Option<String>,
    pub cancel: CancelToken,
}

/// Attachment content returned next to a document body.
pub struct Follows {
    pub filename: String,
    pub content_type: String,
    pub length: u64,
    pub digest: String,
    pub content: Box<dyn Read + Send>,
}

impl fmt::Debug for Follows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Follows")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("length", &self.length)
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

/// A fetched document.
#[derive(Debug)]
pub struct Fetched {
    pub body: Value,
    /// Populated only when attachments follow the body out-of-band.
    pub attachments: Vec<Follows>,
}

/// One row of the changes feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub id: String,
    pub rev: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

/// Revisions a peer would have to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevsDiff {
    pub missing: Vec<String>,
}

/// A database: one directory of documents.
#[derive(Debug, Clone)]
pub struct Database {
    name: String,
    store: Store,
}

impl Database {
    pub(crate) fn new(name: &str, store: Store) -> Self {
        Self {
            name: name.to_owned(),
            store,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Fetch a document.
    ///
    /// Without `rev` the winning revision is returned; a deleted winner is
    /// reported as NotFound `"deleted"`.
    pub fn get(&self, id: &str, opts: &GetOptions) -> Result<Fetched> {
        validate_doc_id(id)?;
        let doc = self.store.open(id)?;
        let revision = match &opts.rev {
            Some(rev) => doc
                .revision(rev)
                .ok_or_else(|| StorageError::not_found("missing"))?,
            None => match doc.winner() {
                Some(winner) if winner.deleted => return Err(StorageError::not_found("deleted")),
                Some(winner) => winner,
                None => return Err(StorageError::not_found("missing")),
            },
        };

        let mode = RenderMode::select(opts.attachments, opts.json_only);
        let mut body = revision.body(mode)?.with_id(id);
        if opts.revs || opts.rev.is_some() {
            body = body.with_revisions(revision.history());
        }
        if opts.revs_info && opts.rev.is_none() {
            body = body.with_revs_info(doc.revs_info(revision));
        }
        let body = body.to_value()?;

        let mut attachments = Vec::new();
        if mode == RenderMode::Follows {
            for (filename, att) in &revision.attachments {
                attachments.push(Follows {
                    filename: filename.clone(),
                    content_type: att.content_type.clone(),
                    length: att.length().unwrap_or_default(),
                    digest: att.digest().unwrap_or_default().to_owned(),
                    content: att.open()?,
                });
            }
        }
        Ok(Fetched { body, attachments })
    }

    /// Fetch one attachment and its bytes.
    pub fn get_attachment(
        &self,
        id: &str,
        filename: &str,
        rev: Option<&str>,
    ) -> Result<(Attachment, Vec<u8>)> {
        validate_doc_id(id)?;
        let doc = self.store.open(id)?;
        let revision = match rev {
            Some(rev) => doc.revision(rev),
            None => doc.winner().filter(|w| !w.deleted),
        }
        .ok_or_else(|| StorageError::not_found("missing"))?;
        let att = revision
            .attachments
            .get(filename)
            .ok_or_else(|| StorageError::not_found("Document is missing attachment"))?;
        let bytes = att.read_bytes()?;
        Ok((att.clone(), bytes))
    }

    /// Store a new edit of `id`. Returns the new revision.
    pub fn put(&self, id: &str, body: Value, opts: &PutOptions) -> Result<RevId> {
        validate_doc_id(id)?;
        let revision = Revision::from_input(body)?;
        let target = opts.rev.as_deref().map(parse_rev).transpose()?;
        let mut doc = self.store.document(id)?;
        let rev = doc.add_revision(revision, target.as_ref(), &opts.cancel)?;
        debug!(db = %self.name, id, %rev, "stored revision");
        Ok(rev)
    }

    /// Mark `id` deleted on top of `rev`.
    pub fn delete(&self, id: &str, rev: &str, cancel: &CancelToken) -> Result<RevId> {
        validate_doc_id(id)?;
        let target = parse_rev(rev)?;
        let mut doc = self.store.open(id)?;
        let rev = doc.add_revision(Revision::tombstone(), Some(&target), cancel)?;
        debug!(db = %self.name, id, %rev, "deleted document");
        Ok(rev)
    }

    pub fn security(&self) -> Result<Security> {
        self.store.security()
    }

    pub fn set_security(&self, security: &Security) -> Result<()> {
        self.store.set_security(security)
    }

    /// Every visible document with its winning revision, sorted by ID.
    pub fn changes(&self) -> Result<Vec<Change>> {
        let mut changes = Vec::new();
        for id in self.store.document_ids()? {
            if id.starts_with('_') && !id.starts_with("_design/") && !id.starts_with("_local/") {
                continue;
            }
            let doc = self.store.open(&id)?;
            let Some(winner) = doc.winner() else {
                continue;
            };
            changes.push(Change {
                rev: winner.rev.to_string(),
                deleted: winner.deleted,
                id,
            });
        }
        Ok(changes)
    }

    /// Report which of the given revisions are unknown here.
    ///
    /// A revision is known when it is stored, or when it appears in the
    /// history of a requested revision that is stored. Missing revisions are
    /// listed once each, greatest first.
    pub fn revs_diff(
        &self,
        revs: &BTreeMap<String, Vec<String>>,
    ) -> Result<BTreeMap<String, RevsDiff>> {
        let mut result = BTreeMap::new();
        for (id, wanted) in revs {
            let doc = self.store.document(id)?;
            let mut known = HashSet::new();
            for rev in wanted {
                if let Some(revision) = doc.revision(rev) {
                    known.extend(revision.history().ancestors());
                }
            }
            let wanted: BTreeSet<&String> = wanted.iter().collect();
            let missing: Vec<String> = wanted
                .into_iter()
                .rev()
                .filter(|rev| !known.contains(rev.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                result.insert(id.clone(), RevsDiff { missing });
            }
        }
        Ok(result)
    }

    /// Prune every document down to its leaves and sweep orphaned files.
    pub fn compact(&self, cancel: &CancelToken) -> Result<CompactionStats> {
        Compactor::new(self.store.clone()).run(cancel)
    }
}

fn parse_rev(rev: &str) -> Result<RevId> {
    rev.parse()
        .map_err(|e| StorageError::bad_request("Invalid rev format").with_source(e))
}

fn validate_doc_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(StorageError::bad_request("no docid specified"));
    }
    if id.starts_with('_') {
        let reserved = matches!(
            id.split_once('/'),
            Some(("_design" | "_local", rest)) if !rest.is_empty()
        );
        if !reserved {
            return Err(StorageError::bad_request(
                "only reserved document ids may start with underscore",
            ));
        }
    }
    Ok(())
}
