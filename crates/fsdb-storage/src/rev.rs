//! Revision identifiers and ancestor chains.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum number of ancestor hashes kept in a [`RevHistory`].
pub const REVS_LIMIT: usize = 1000;

/// Error returned when text is not a valid revision identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid rev format: {0:?}")]
pub struct ParseRevIdError(String);

/// Parsed revision identifier, `"{sequence}-{hash}"`.
///
/// Ordering compares the sequence first and the hash lexically second; the
/// greatest identifier wins a conflict. The text the value was parsed from is
/// kept so [`changed`](Self::changed) can tell whether it was advanced since.
#[derive(Debug, Clone, Default)]
pub struct RevId {
    seq: u64,
    hash: String,
    original: String,
}

impl RevId {
    #[must_use]
    pub fn new(seq: u64, hash: impl Into<String>) -> Self {
        let mut rev = Self {
            seq,
            hash: hash.into(),
            original: String::new(),
        };
        rev.original = rev.to_string();
        rev
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// True for the empty identifier of a document that has no revision yet.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.seq == 0
    }

    /// Whether the current value differs from the text it was parsed from.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.original != self.to_string()
    }

    /// Advance the sequence by one, saturating at `u64::MAX`.
    ///
    /// With a payload the new hash is the hex MD5 of the concatenated parts;
    /// without one the hash is cleared.
    pub fn increment<I, T>(&mut self, payload: I)
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.seq = self.seq.saturating_add(1);
        let mut hasher = Md5::new();
        let mut hashed = false;
        for part in payload {
            hasher.update(part.as_ref());
            hashed = true;
        }
        self.hash = if hashed {
            hex::encode(hasher.finalize())
        } else {
            String::new()
        };
    }

    /// Parse a `_rev` member, which may be a string or a bare integer.
    pub fn from_value(value: &Value) -> Result<Self, ParseRevIdError> {
        match value {
            Value::String(s) => s.parse(),
            Value::Number(n) => n
                .as_u64()
                .map(|seq| Self {
                    seq,
                    hash: String::new(),
                    original: n.to_string(),
                })
                .ok_or_else(|| ParseRevIdError(n.to_string())),
            Value::Null => Ok(Self::default()),
            other => Err(ParseRevIdError(other.to_string())),
        }
    }
}

impl FromStr for RevId {
    type Err = ParseRevIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        let (seq, hash) = s.split_once('-').unwrap_or((s, ""));
        let seq = seq
            .parse::<u64>()
            .map_err(|_| ParseRevIdError(s.to_owned()))?;
        Ok(Self {
            seq,
            hash: hash.to_owned(),
            original: s.to_owned(),
        })
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seq == 0 {
            return Ok(());
        }
        write!(f, "{}-{}", self.seq, self.hash)
    }
}

impl PartialEq for RevId {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq && self.hash == other.hash
    }
}

impl Eq for RevId {}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seq
            .cmp(&other.seq)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl Serialize for RevId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Ancestor chain of a revision: `ids[i]` is the hash of the revision
/// `start - i`, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevHistory {
    pub start: i64,
    pub ids: Vec<String>,
}

impl RevHistory {
    /// Best-effort history for a revision stored without one.
    ///
    /// A revision with a hash only knows itself; one without a hash gets
    /// blank placeholders for every ancestor up to [`REVS_LIMIT`].
    #[must_use]
    pub fn synthesize(rev: &RevId) -> Self {
        let ids = if rev.hash.is_empty() {
            let len = usize::try_from(rev.seq).unwrap_or(REVS_LIMIT).min(REVS_LIMIT);
            vec![String::new(); len]
        } else {
            vec![rev.hash.clone()]
        };
        Self {
            start: seq_to_start(rev.seq),
            ids,
        }
    }

    /// History of a new child revision `rev` whose parent owns `self`.
    #[must_use]
    pub fn child(&self, rev: &RevId) -> Self {
        let mut ids = Vec::with_capacity((self.ids.len() + 1).min(REVS_LIMIT));
        ids.push(rev.hash.clone());
        ids.extend(self.ids.iter().take(REVS_LIMIT - 1).cloned());
        Self {
            start: seq_to_start(rev.seq),
            ids,
        }
    }

    /// Lineage strings, newest first; the first entry is the owner itself.
    #[must_use]
    pub fn ancestors(&self) -> Vec<String> {
        self.ids
            .iter()
            .zip(0_i64..)
            .map(|(id, i)| format!("{}-{id}", self.start - i))
            .collect()
    }
}

fn seq_to_start(seq: u64) -> i64 {
    i64::try_from(seq).unwrap_or(i64::MAX)
}
