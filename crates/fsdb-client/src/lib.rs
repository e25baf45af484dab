//! Database-level API over [`fsdb_storage`].
//!
//! A [`Client`] owns a root directory in which every sub-directory is a
//! database. A [`Database`] validates document IDs and maps document reads,
//! writes and maintenance onto the revision store.
//!
//! # Example
//!
//! ```ignore
//! use fsdb_client::{Client, GetOptions, PutOptions};
//! use serde_json::json;
//!
//! let client = Client::new("data")?;
//! client.create_db("notes")?;
//! let db = client.db("notes")?;
//! let rev = db.put("foo", json!({"value": "bar"}), &PutOptions::default())?;
//! let doc = db.get("foo", &GetOptions::default())?;
//! assert_eq!(doc.body["_rev"], rev.to_string());
//! ```

mod client;
mod database;

pub use client::Client;
pub use database::{Change, Database, Fetched, Follows, GetOptions, PutOptions, RevsDiff};
