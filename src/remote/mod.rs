//! Remote corpus model and the protocol client seam.
//!
//! The orchestration engine never talks to the network directly. It consumes
//! a [`ProtocolClient`] that can list a directory and fetch a byte range of a
//! file. [`HttpProtocolClient`] is the production implementation for servers
//! that expose the corpus as Apache-style directory indexes.
//!
//! # Example
//!
//! ```no_run
//! use mirror_core::remote::{HttpProtocolClient, ProtocolClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpProtocolClient::new("https://ftp.ncbi.nlm.nih.gov/pubchem/RDF/", 30, 300)?;
//! for entry in client.list("compound").await? {
//!     println!("{} ({:?})", entry.path, entry.kind);
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod http;

pub use error::ProtocolError;
pub use http::{HttpClientError, HttpProtocolClient};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

/// Stream of body chunks returned by [`ProtocolClient::fetch`].
pub type ByteStream = BoxStream<'static, Result<Bytes, ProtocolError>>;

/// One downloadable unit of the remote corpus.
///
/// Paths are `/`-separated and relative to the corpus root; the first segment
/// is the top-level category (e.g. `compound/Compound_000000001_000500000.ttl.gz`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    path: String,
    size: Option<u64>,
    content_tag: Option<String>,
}

impl RemoteItem {
    /// Creates a remote item, normalizing leading/trailing slashes.
    ///
    /// Returns `None` when the path is empty or could escape the storage root
    /// (`..`, `.`, or empty segments).
    #[must_use]
    pub fn new(path: &str, size: Option<u64>, content_tag: Option<String>) -> Option<Self> {
        let normalized = normalize_remote_path(path)?;
        Some(Self {
            path: normalized,
            size,
            content_tag,
        })
    }

    /// Returns the normalized corpus-relative path (the ledger key).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the expected size in bytes, when the listing exposed one.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Returns the content tag (modification time or checksum), when known.
    #[must_use]
    pub fn content_tag(&self) -> Option<&str> {
        self.content_tag.as_deref()
    }

    /// Returns the top-level category this item belongs to.
    #[must_use]
    pub fn category(&self) -> &str {
        self.path.split('/').next().unwrap_or(&self.path)
    }

    /// Returns the final path segment.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns where the finished file lives under `root`.
    #[must_use]
    pub fn local_path(&self, root: &Path) -> PathBuf {
        self.path
            .split('/')
            .fold(root.to_path_buf(), |acc, segment| acc.join(segment))
    }
}

/// Kind of a directory listing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A downloadable file.
    File,
    /// A nested directory to descend into.
    Directory,
}

/// One entry returned by [`ProtocolClient::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Corpus-relative path of the entry.
    pub path: String,
    /// File or directory.
    pub kind: EntryKind,
    /// Size in bytes, when the listing exposes an exact one.
    pub size: Option<u64>,
    /// Modification marker, when the listing exposes one.
    pub modified: Option<String>,
}

impl RemoteEntry {
    /// Creates a file entry.
    #[must_use]
    pub fn file(path: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            size,
            modified: None,
        }
    }

    /// Creates a directory entry.
    #[must_use]
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Directory,
            size: None,
            modified: None,
        }
    }
}

/// Body and range metadata returned by [`ProtocolClient::fetch`].
pub struct FetchResponse {
    /// Offset the body actually starts at. A server that ignores the range
    /// request reports 0 here.
    pub start_offset: u64,
    /// Total size of the remote item, when the protocol reports one.
    pub total_size: Option<u64>,
    /// Body chunks from `start_offset` to the end of the item.
    pub body: ByteStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("start_offset", &self.start_offset)
            .field("total_size", &self.total_size)
            .finish_non_exhaustive()
    }
}

/// Connection-level collaborator: directory listings and ranged fetches.
///
/// Implementations must be cheap to share behind an `Arc` across workers.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Lists one directory of the corpus (`dir` is corpus-relative).
    async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>, ProtocolError>;

    /// Fetches `path` starting at byte `start_offset`.
    async fn fetch(&self, path: &str, start_offset: u64) -> Result<FetchResponse, ProtocolError>;
}

/// Normalizes a corpus path, rejecting anything that could leave the storage root.
pub(crate) fn normalize_remote_path(path: &str) -> Option<String> {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let safe = trimmed
        .split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != ".." && !segment.contains('\\'));
    safe.then(|| trimmed.to_string())
}
