//! Structured-text formats revision files may be stored in.
//!
//! The registry is static and sorted by extension. Every format decodes into
//! the generic [`serde_json::Value`] model, so the rest of the engine never
//! cares which one a file used.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error decoding or encoding a stored file.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A registered file format.
pub struct Format {
    ext: &'static str,
    decode: fn(&[u8]) -> Result<Value, FormatError>,
    encode: fn(&Value) -> Result<Vec<u8>, FormatError>,
}

static FORMATS: [Format; 3] = [
    Format {
        ext: "json",
        decode: decode_json,
        encode: encode_json,
    },
    Format {
        ext: "yaml",
        decode: decode_yaml,
        encode: encode_yaml,
    },
    Format {
        ext: "yml",
        decode: decode_yaml,
        encode: encode_yaml,
    },
];

impl Format {
    /// All registered formats, sorted by extension.
    #[must_use]
    pub fn all() -> &'static [Format] {
        &FORMATS
    }

    /// Look a format up by file extension.
    #[must_use]
    pub fn by_ext(ext: &str) -> Option<&'static Format> {
        FORMATS.iter().find(|f| f.ext == ext)
    }

    /// The JSON format.
    #[must_use]
    pub fn json() -> &'static Format {
        &FORMATS[0]
    }

    #[must_use]
    pub fn ext(&self) -> &'static str {
        self.ext
    }

    /// Decode file contents into a generic value.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, FormatError> {
        (self.decode)(bytes)
    }

    /// Encode a generic value as file contents.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, FormatError> {
        (self.encode)(value)
    }

    /// Decode a security document.
    pub fn decode_security(&self, bytes: &[u8]) -> Result<Security, FormatError> {
        let value = self.decode(bytes)?;
        Ok(serde_json::from_value(value)?)
    }
}

impl std::fmt::Debug for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Format").field("ext", &self.ext).finish()
    }
}

fn decode_json(bytes: &[u8]) -> Result<Value, FormatError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn encode_json(value: &Value) -> Result<Vec<u8>, FormatError> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn decode_yaml(bytes: &[u8]) -> Result<Value, FormatError> {
    Ok(serde_yaml::from_slice(bytes)?)
}

fn encode_yaml(value: &Value) -> Result<Vec<u8>, FormatError> {
    Ok(serde_yaml::to_string(value)?.into_bytes())
}

/// Names and roles granted a level of access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Members {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Database security document. Stored, never enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Security {
    #[serde(default)]
    pub admins: Members,
    #[serde(default)]
    pub members: Members,
}
