//! Revision-tree document storage on a plain filesystem.
//!
//! Documents are stored as one structured-text file per revision. The winning
//! revision sits at `{root}/{id}.{ext}`; older and conflicting revisions live
//! under the hidden history directory `{root}/.{id}/`. Attachments are plain
//! files next to the revision that introduced them.
//!
//! The only atomicity primitive is the rename of a single file, so multi-file
//! updates are ordered (attachments before metadata) to stay readable if
//! interrupted.
//!
//! # Example
//!
//! ```ignore
//! use fsdb_storage::{CancelToken, Revision, Store};
//! use serde_json::json;
//!
//! let store = Store::new("data/mydb");
//! let mut doc = store.document("foo")?;
//! let rev = doc.add_revision(
//!     Revision::from_input(json!({"value": "bar"}))?,
//!     None,
//!     &CancelToken::new(),
//! )?;
//! println!("stored {rev}");
//! ```

mod attachment;
mod cancel;
mod compact;
mod document;
mod error;
mod format;
mod rev;
mod revision;
mod store;

pub use attachment::{Attachment, Content, DEFAULT_CONTENT_TYPE, RenderMode, copy_digest, digest_bytes};
pub use cancel::CancelToken;
pub use compact::{CompactionStats, Compactor};
pub use document::Document;
pub use error::{Result, StorageError, StorageErrorKind};
pub use format::{Format, FormatError, Members, Security};
pub use rev::{ParseRevIdError, REVS_LIMIT, RevHistory, RevId};
pub use revision::{RESERVED_KEYS, RevInfo, Revision, RevisionBody, is_reserved};
pub use store::{Store, atomic_write, escape_id, unescape_id};
