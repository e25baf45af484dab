//! Maps document IDs to files and rebuilds revisions from directory listings.
//!
//! # Layout
//!
//! ```text
//! {root}/{id}.{ext}               winning revision
//! {root}/{id}/{filename}          winning revision's attachments
//! {root}/.{id}/{rev}.{ext}        historical revision
//! {root}/.{id}/{rev}/{filename}   historical revision's attachments
//! {root}/_security.{ext}          security document
//! ```
//!
//! `{id}` is the escaped document ID, see [`escape_id`].

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::attachment::{Content, copy_digest};
use crate::document::Document;
use crate::error::{IoResultExt, Result, StorageError};
use crate::format::{Format, Security};
use crate::rev::RevId;
use crate::revision::Revision;

pub(crate) const SECURITY_BASE: &str = "_security";

/// Escape a document ID into a file name.
///
/// Path separators become `%2F` and a leading dot becomes `%2E`. A literal
/// `%` that would read as one of those escapes, or as `%25`, is itself
/// written as `%25`, which keeps distinct IDs on distinct names. Everything
/// else, including non-ASCII text, is kept as is.
#[must_use]
pub fn escape_id(id: &str) -> String {
    let mut escaped = String::with_capacity(id.len());
    for (i, c) in id.char_indices() {
        match c {
            '/' => escaped.push_str("%2F"),
            '.' if i == 0 => escaped.push_str("%2E"),
            '%' if reads_as_escape(&id[i + 1..], i == 0) => escaped.push_str("%25"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn reads_as_escape(rest: &str, leading: bool) -> bool {
    ["2F", "2f", "25"].iter().any(|seq| rest.starts_with(seq))
        || (leading && rest.starts_with("2E"))
}

/// Inverse of [`escape_id`].
#[must_use]
pub fn unescape_id(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    let mut rest = name;
    let mut leading = true;
    while let Some(c) = rest.chars().next() {
        if let Some(tail) = rest.strip_prefix("%2F") {
            id.push('/');
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("%25") {
            id.push('%');
            rest = tail;
        } else if leading && let Some(tail) = rest.strip_prefix("%2E") {
            id.push('.');
            rest = tail;
        } else {
            id.push(c);
            rest = &rest[c.len_utf8()..];
        }
        leading = false;
    }
    id
}

/// Filesystem-backed revision store rooted at one database directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    format: &'static Format,
}

impl Store {
    /// Create a store writing JSON revision files.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            format: Format::json(),
        }
    }

    /// Use `format` for revision files written from now on.
    #[must_use]
    pub fn with_format(mut self, format: &'static Format) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn format(&self) -> &'static Format {
        self.format
    }

    /// Canonical metadata path of `id` for extension `ext`.
    pub(crate) fn main_path(&self, id: &str, ext: &str) -> PathBuf {
        self.root.join(format!("{}.{ext}", escape_id(id)))
    }

    /// Directory holding historical revisions of `id`.
    pub(crate) fn history_dir(&self, id: &str) -> PathBuf {
        self.root.join(format!(".{}", escape_id(id)))
    }

    /// Historical metadata path of revision `rev` of `id`.
    pub(crate) fn history_path(&self, id: &str, rev: &RevId, ext: &str) -> PathBuf {
        self.history_dir(id).join(format!("{rev}.{ext}"))
    }

    /// Whether `path` is a canonical metadata path of `id`.
    pub(crate) fn is_main_path(&self, id: &str, path: &Path) -> bool {
        path.parent() == Some(self.root.as_path())
            && path.file_stem().and_then(|s| s.to_str()) == Some(escape_id(id).as_str())
    }

    /// Open an existing document.
    ///
    /// Returns NotFound `"missing"` when no revision of `id` is stored.
    pub fn open(&self, id: &str) -> Result<Document> {
        let revisions = self.read_revisions(id)?;
        if revisions.is_empty() {
            return Err(StorageError::not_found("missing"));
        }
        Ok(Document::from_revisions(self.clone(), id, revisions))
    }

    /// Open `id`, or start an empty document if nothing is stored yet.
    pub fn document(&self, id: &str) -> Result<Document> {
        let revisions = self.read_revisions(id)?;
        Ok(Document::from_revisions(self.clone(), id, revisions))
    }

    fn read_revisions(&self, id: &str) -> Result<Vec<Revision>> {
        let mut revisions = Vec::new();

        for format in Format::all() {
            let path = self.main_path(id, format.ext());
            let Some(bytes) = read_optional(&path)? else {
                continue;
            };
            let value = decode(format, &bytes, &path)?;
            let revision = Revision::from_stored(value, None, path)?;
            if revision.rev.changed() {
                debug!(id, rev = %revision.rev, "normalized canonical revision id");
            }
            revisions.push(revision);
            break;
        }

        let history_dir = self.history_dir(id);
        for (rev, format, path) in list_history(&history_dir)? {
            if revisions.iter().any(|r| r.rev == rev) {
                continue;
            }
            let bytes = fs::read(&path).at(&path)?;
            let value = decode(format, &bytes, &path)?;
            revisions.push(Revision::from_stored(value, Some(rev), path)?);
        }

        revisions.sort_by(|a, b| b.rev.cmp(&a.rev));

        for revision in &mut revisions {
            self.resolve_attachments(id, revision)?;
        }
        Ok(revisions)
    }

    /// Locate the bytes of every attachment of `revision`.
    ///
    /// Looks in the revision's own directory, then the canonical attachment
    /// directory, then the directories of each ancestor in the revision's
    /// history. When a digest is recorded, the first two only count on a
    /// digest match.
    fn resolve_attachments(&self, id: &str, revision: &mut Revision) -> Result<()> {
        let own_dir = revision.attachment_dir();
        let main_dir = self.root.join(escape_id(id));
        let history_dir = self.history_dir(id);
        let ancestors = revision.history().ancestors();
        let rev = revision.rev.to_string();

        for (filename, att) in &mut revision.attachments {
            if !matches!(att.content, Content::Absent) {
                continue;
            }
            let own = own_dir.as_ref().map(|d| d.join(filename));
            let own = match own {
                Some(own) if digest_matches(&own, att.digest())? => Some(own),
                _ => None,
            };
            let path = if let Some(own) = own {
                Some(own)
            } else if digest_matches(&main_dir.join(filename), att.digest())? {
                Some(main_dir.join(filename))
            } else {
                ancestors
                    .iter()
                    .skip(1)
                    .map(|anc| history_dir.join(anc).join(filename))
                    .find(|p| p.is_file())
            };
            let Some(path) = path else {
                return Err(StorageError::not_found(format!(
                    "attachment {filename} of revision {rev} not found"
                )));
            };
            att.content = Content::File(path);
            att.ensure_metadata()?;
        }
        Ok(())
    }

    /// IDs of every document with at least one stored revision, sorted.
    pub fn document_ids(&self) -> Result<Vec<String>> {
        let mut ids = BTreeSet::new();
        for entry in fs::read_dir(&self.root).at(&self.root)? {
            let entry = entry.at(&self.root)?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let file_type = entry.file_type().at(entry.path())?;
            if file_type.is_file() {
                if let Some((base, ext)) = name.rsplit_once('.')
                    && !base.is_empty()
                    && base != SECURITY_BASE
                    && Format::by_ext(ext).is_some()
                {
                    ids.insert(unescape_id(base));
                }
            } else if file_type.is_dir()
                && let Some(base) = name.strip_prefix('.')
                && !base.is_empty()
                && !list_history(&entry.path())?.is_empty()
            {
                ids.insert(unescape_id(base));
            }
        }
        Ok(ids.into_iter().collect())
    }

    /// Read the security document, empty when none is stored.
    pub fn security(&self) -> Result<Security> {
        for format in Format::all() {
            let path = self.root.join(format!("{SECURITY_BASE}.{}", format.ext()));
            let Some(bytes) = read_optional(&path)? else {
                continue;
            };
            return format.decode_security(&bytes).map_err(|e| {
                StorageError::internal("invalid security document")
                    .with_path(&path)
                    .with_source(e)
            });
        }
        Ok(Security::default())
    }

    /// Replace the security document.
    pub fn set_security(&self, security: &Security) -> Result<()> {
        let path = self.root.join(format!("{SECURITY_BASE}.{}", Format::json().ext()));
        let bytes = serde_json::to_vec(security)
            .map_err(|e| StorageError::internal("failed to encode security document").with_source(e))?;
        atomic_write(&path, &bytes)
    }
}

/// Write `bytes` to `path` through a temp file renamed into place.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    atomic_copy(path, &mut &bytes[..]).map(|_| ())
}

/// Stream `reader` to `path` through a temp file renamed into place,
/// returning the length and digest of the written content.
pub(crate) fn atomic_copy<R: Read + ?Sized>(path: &Path, reader: &mut R) -> Result<(u64, String)> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::internal("path has no parent directory").with_path(path))?;
    fs::create_dir_all(dir).at(dir)?;
    let mut tmp = NamedTempFile::new_in(dir).at(dir)?;
    let (length, digest) = copy_digest(reader, tmp.as_file_mut()).at(path)?;
    tmp.as_file_mut().flush().at(path)?;
    tmp.persist(path)
        .map_err(|e| StorageError::io(e.error, Some(path.to_path_buf())))?;
    Ok((length, digest))
}

/// Move a directory, merging into the destination if it already exists.
/// A missing source is not an error.
pub(crate) fn move_dir(from: &Path, to: &Path) -> Result<()> {
    if !from.is_dir() {
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    if !to.exists() {
        return fs::rename(from, to).at(from);
    }
    for entry in fs::read_dir(from).at(from)? {
        let entry = entry.at(from)?;
        let target = to.join(entry.file_name());
        if entry.file_type().at(entry.path())?.is_dir() {
            move_dir(&entry.path(), &target)?;
        } else {
            fs::rename(entry.path(), &target).at(entry.path())?;
        }
    }
    fs::remove_dir(from).at(from)
}

/// Remove a file, treating an already-missing file as success.
pub(crate) fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(StorageError::io(e, Some(path.into()))),
        _ => Ok(()),
    }
}

/// Remove a directory tree, treating an already-missing one as success.
pub(crate) fn remove_dir_all(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(StorageError::io(e, Some(path.into()))),
        _ => Ok(()),
    }
}

/// Remove `dir` if it exists and is empty.
pub(crate) fn remove_dir_if_empty(dir: &Path) -> Result<()> {
    match fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                fs::remove_dir(dir).at(dir)?;
            }
            Ok(())
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
            Ok(())
        }
        Err(e) => Err(StorageError::io(e, Some(dir.into()))),
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::IsADirectory) => {
            Ok(None)
        }
        Err(e) => Err(StorageError::io(e, Some(path.into()))),
    }
}

fn decode(format: &Format, bytes: &[u8], path: &Path) -> Result<serde_json::Value> {
    format.decode(bytes).map_err(|e| {
        StorageError::internal("invalid revision file")
            .with_path(path)
            .with_source(e)
    })
}

fn digest_matches(path: &Path, digest: Option<&str>) -> Result<bool> {
    let Some(digest) = digest else {
        return Ok(path.is_file());
    };
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::IsADirectory) => {
            return Ok(false);
        }
        Err(e) => return Err(StorageError::io(e, Some(path.into()))),
    };
    if !file.metadata().at(path)?.is_file() {
        return Ok(false);
    }
    let (_, actual) = copy_digest(&mut file, &mut io::sink()).at(path)?;
    Ok(actual == digest)
}

/// Parse the revision files in a history directory.
///
/// Names that are not `{rev}.{ext}` with a registered extension are
/// skipped. A missing directory yields nothing.
pub(crate) fn list_history(dir: &Path) -> Result<Vec<(RevId, &'static Format, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::io(e, Some(dir.into()))),
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.at(dir)?;
        if !entry.file_type().at(entry.path())?.is_file() {
            continue;
        }
        let path = entry.path();
        let parsed = path
            .file_stem()
            .and_then(|s| s.to_str())
            .zip(path.extension().and_then(|e| e.to_str()))
            .and_then(|(stem, ext)| Some((stem.parse::<RevId>().ok()?, Format::by_ext(ext)?)));
        match parsed {
            Some((rev, format)) if !rev.is_zero() => found.push((rev, format, path)),
            _ => debug!(path = %path.display(), "skipping unrecognized history file"),
        }
    }
    Ok(found)
}

pub(crate) fn is_main_dir_orphan(root: &Path, name: &str) -> bool {
    let has_main = Format::all()
        .iter()
        .any(|f| root.join(format!("{name}.{}", f.ext())).is_file());
    !has_main && !root.join(format!(".{name}")).is_dir()
}
