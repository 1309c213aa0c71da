//! Manifests: the durable record of one capture event.
//!
//! A manifest is written exactly once per (run, url) and never modified.
//! It holds hashes only; blob bytes live in the CAS.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{IntegrityError, VaultError};

/// Current manifest schema version
pub const MANIFEST_VERSION: u32 = 1;

/// SHA-256 of blob content, lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobHash(String);

impl BlobHash {
    /// Hash a byte slice
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a hex digest, rejecting anything that is not 64 hex chars
    pub fn parse(s: &str) -> Result<Self, IntegrityError> {
        let lower = s.trim().to_ascii_lowercase();
        if lower.len() != 64 || !lower.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IntegrityError::MalformedHash(s.to_string()));
        }
        Ok(Self(lower))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for BlobHash {
    type Error = IntegrityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BlobHash> for String {
    fn from(hash: BlobHash) -> Self {
        hash.0
    }
}

/// Crawl session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Validate a caller-supplied run id. It becomes a directory name,
    /// so only `[A-Za-z0-9._-]` is accepted and a leading dot is refused.
    pub fn new(id: impl Into<String>) -> Result<Self, VaultError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= 128
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

        if !valid {
            return Err(VaultError::InvalidInput(format!("Invalid run id: {:?}", id)));
        }
        Ok(Self(id))
    }

    /// Fresh random run id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RunId {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

/// Manifest identifier: SHA256(run_id + "\n" + url)[0:16] as 32 hex chars.
///
/// Deterministic per (run, url), so the manifest path doubles as the
/// single-touch witness across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ManifestId(String);

impl ManifestId {
    pub fn for_capture(run_id: &RunId, url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(run_id.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(url.as_bytes());
        let result = hasher.finalize();
        Self(hex::encode(&result[..16]))
    }

    pub fn parse(s: &str) -> Result<Self, VaultError> {
        let lower = s.trim().to_ascii_lowercase();
        if lower.len() != 32 || !lower.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(VaultError::InvalidInput(format!("Invalid manifest id: {:?}", s)));
        }
        Ok(Self(lower))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ManifestId {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ManifestId> for String {
    fn from(id: ManifestId) -> Self {
        id.0
    }
}

/// How an asset relates to the page that referenced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Image,
    Script,
    Stylesheet,
    Font,
    Media,
    Document,
    Other,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Image => "image",
            Relation::Script => "script",
            Relation::Stylesheet => "stylesheet",
            Relation::Font => "font",
            Relation::Media => "media",
            Relation::Document => "document",
            Relation::Other => "other",
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Relation {
    type Err = std::convert::Infallible;

    /// Unknown relation strings map to `Other` rather than failing
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "image" | "img" => Relation::Image,
            "script" | "js" => Relation::Script,
            "stylesheet" | "css" | "style" => Relation::Stylesheet,
            "font" => Relation::Font,
            "media" | "video" | "audio" => Relation::Media,
            "document" | "iframe" | "frame" => Relation::Document,
            _ => Relation::Other,
        })
    }
}

/// One response header, order preserved as received
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Stored asset reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    pub url: String,
    pub hash: BlobHash,
    pub relation: Relation,
    pub byte_size: u64,
}

/// Category of a fetch-layer failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Non-2xx response
    HttpStatus,
    Timeout,
    Connection,
    MalformedBody,
    Other,
}

/// Failure reported by the fetch layer, kept as evidence in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl FetchFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One capture event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Schema version
    #[serde(default = "default_version")]
    pub version: u32,

    pub manifest_id: ManifestId,

    pub url: String,

    pub run_id: RunId,

    /// Capture time (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// HTTP status; absent when no response arrived (timeout, connection error)
    pub status: Option<u16>,

    #[serde(default)]
    pub headers: Vec<Header>,

    /// Hash of the response body; absent when there was no body
    pub primary_hash: Option<BlobHash>,

    #[serde(default)]
    pub assets: Vec<AssetEntry>,

    /// Body bytes plus asset bytes
    pub total_bytes: u64,

    pub fetch_duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FetchFailure>,
}

fn default_version() -> u32 {
    MANIFEST_VERSION
}

impl Manifest {
    /// True for a 2xx response with no reported failure
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && matches!(self.status, Some(200..=299))
    }

    /// Every blob this manifest references, primary first, in manifest order
    pub fn blob_refs(&self) -> impl Iterator<Item = &BlobHash> {
        self.primary_hash
            .iter()
            .chain(self.assets.iter().map(|a| &a.hash))
    }

    /// First value of a header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}
