//! Attachments: named binary payloads and their wire encodings.

use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IoResultExt, Result, StorageError};

/// Content type used when the caller does not supply one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// How attachments are encoded in a rendered revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Metadata only, `"stub": true`.
    Stub,
    /// Metadata with `"follows": true`; bytes travel out-of-band.
    Follows,
    /// Metadata with base64 `data`.
    Inline,
}

impl RenderMode {
    /// Pick the mode for a request.
    ///
    /// Without attachments everything is a stub. With attachments the bytes
    /// follow out-of-band unless the response channel can only carry JSON.
    #[must_use]
    pub fn select(attachments: bool, json_only: bool) -> Self {
        match (attachments, json_only) {
            (false, _) => Self::Stub,
            (true, false) => Self::Follows,
            (true, true) => Self::Inline,
        }
    }
}

/// Where an attachment's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// No bytes known yet: a stub awaiting resolution.
    Absent,
    /// Bytes held in memory, typically freshly uploaded.
    Inline(Vec<u8>),
    /// Bytes stored on disk at the given path.
    File(PathBuf),
}

/// A named binary payload of a revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub content_type: String,
    /// Sequence of the revision that introduced this exact content.
    pub revpos: Option<i64>,
    pub stub: bool,
    pub follows: bool,
    pub content: Content,
    length: Option<u64>,
    digest: Option<String>,
}

#[derive(Deserialize)]
struct RawAttachment {
    content_type: Option<String>,
    revpos: Option<i64>,
    #[serde(default)]
    stub: bool,
    #[serde(default)]
    follows: bool,
    data: Option<String>,
    length: Option<u64>,
    digest: Option<String>,
}

/// Serialized form. Field order is part of the revision hash.
#[derive(Debug, Serialize)]
pub(crate) struct WireAttachment<'a> {
    content_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    revpos: Option<i64>,
    length: u64,
    digest: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stub: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    follows: bool,
}

impl Attachment {
    /// Attachment holding `bytes` in memory, digest computed up front.
    #[must_use]
    pub fn from_bytes(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let digest = digest_bytes(&bytes);
        Self {
            content_type: content_type.into(),
            revpos: None,
            stub: false,
            follows: false,
            length: Some(bytes.len() as u64),
            digest: Some(digest),
            content: Content::Inline(bytes),
        }
    }

    /// Parse one `_attachments` member.
    ///
    /// Inline `data` is decoded from base64. Anything else keeps the declared
    /// length and digest and waits for its content to be resolved.
    pub fn from_value(filename: &str, value: &Value) -> Result<Self> {
        let invalid = || invalid_attachment(filename);
        let raw: RawAttachment = serde_json::from_value(value.clone()).map_err(|_| invalid())?;
        let content_type = raw
            .content_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned());

        if let Some(data) = raw.data.filter(|_| !raw.stub) {
            let bytes = STANDARD.decode(data.as_bytes()).map_err(|_| invalid())?;
            let mut att = Self::from_bytes(content_type, bytes);
            att.revpos = raw.revpos;
            return Ok(att);
        }

        Ok(Self {
            content_type,
            revpos: raw.revpos,
            stub: raw.stub,
            follows: raw.follows,
            content: Content::Absent,
            length: raw.length,
            digest: raw.digest.filter(|d| !d.is_empty()),
        })
    }

    /// Content length, if known.
    #[must_use]
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// `"md5-" + base64(MD5(content))`, if known.
    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Path of the on-disk content, if the bytes are stored in a file.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.content {
            Content::File(path) => Some(path),
            _ => None,
        }
    }

    /// Fill in length and digest from the content if either is missing.
    ///
    /// Files are hashed with a single streaming pass. Values already present
    /// are never recomputed.
    pub fn ensure_metadata(&mut self) -> Result<()> {
        if self.length.is_some() && self.digest.is_some() {
            return Ok(());
        }
        let (length, digest) = match &self.content {
            Content::Absent => return Ok(()),
            Content::Inline(bytes) => (bytes.len() as u64, digest_bytes(bytes)),
            Content::File(path) => {
                let mut file = File::open(path).at(path)?;
                copy_digest(&mut file, &mut io::sink()).at(path)?
            }
        };
        self.length.get_or_insert(length);
        self.digest.get_or_insert(digest);
        Ok(())
    }

    /// Record content that was just written to `path`.
    pub(crate) fn placed(&mut self, path: PathBuf, length: u64, digest: String) {
        self.content = Content::File(path);
        self.length.get_or_insert(length);
        self.digest.get_or_insert(digest);
        self.stub = false;
        self.follows = false;
    }

    /// Open a reader over the content.
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        match &self.content {
            Content::Absent => Err(StorageError::not_found("attachment content is not available")),
            Content::Inline(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            Content::File(path) => Ok(Box::new(File::open(path).at(path)?)),
        }
    }

    /// Read the whole content into memory.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        match &self.content {
            Content::Inline(bytes) => Ok(bytes.clone()),
            Content::File(path) => std::fs::read(path).at(path),
            Content::Absent => Err(StorageError::not_found("attachment content is not available")),
        }
    }

    pub(crate) fn wire(&self, mode: RenderMode) -> Result<WireAttachment<'_>> {
        let data = match mode {
            RenderMode::Inline => Some(STANDARD.encode(self.read_bytes()?)),
            RenderMode::Stub | RenderMode::Follows => None,
        };
        Ok(WireAttachment {
            content_type: &self.content_type,
            revpos: self.revpos,
            length: self.length.unwrap_or_default(),
            digest: self.digest.as_deref().unwrap_or_default(),
            data,
            stub: mode == RenderMode::Stub,
            follows: mode == RenderMode::Follows,
        })
    }

    /// JSON encoding in the requested mode.
    pub fn to_value(&self, mode: RenderMode) -> Result<Value> {
        serde_json::to_value(self.wire(mode)?)
            .map_err(|e| StorageError::internal("failed to encode attachment").with_source(e))
    }
}

pub(crate) fn invalid_attachment(filename: &str) -> StorageError {
    StorageError::bad_request(format!("invalid attachment data for {filename}"))
}

/// Digest of in-memory content.
#[must_use]
pub fn digest_bytes(bytes: &[u8]) -> String {
    format_digest(Md5::digest(bytes).as_slice())
}

/// Copy `reader` into `writer`, returning the byte count and digest of
/// what was copied.
pub fn copy_digest<R, W>(reader: &mut R, writer: &mut W) -> io::Result<(u64, String)>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut tee = DigestWriter {
        inner: writer,
        hasher: Md5::new(),
    };
    let length = io::copy(reader, &mut tee)?;
    Ok((length, format_digest(tee.hasher.finalize().as_slice())))
}

fn format_digest(md5: &[u8]) -> String {
    format!("md5-{}", STANDARD.encode(md5))
}

struct DigestWriter<'a, W: ?Sized> {
    inner: &'a mut W,
    hasher: Md5,
}

impl<W: Write + ?Sized> Write for DigestWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
