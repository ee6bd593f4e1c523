//! HTTP protocol client for corpora published as directory indexes.
//!
//! Listings are parsed from Apache/nginx-style autoindex pages; fetches use
//! `Range: bytes=N-` requests so interrupted files resume where they stopped.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use regex::Regex;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use super::{EntryKind, FetchResponse, ProtocolClient, ProtocolError, RemoteEntry};
use crate::user_agent;

/// Anchor tags in an autoindex page, with the optional `YYYY-MM-DD HH:MM` column after them.
static INDEX_ENTRY_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)<a\s[^>]*?href\s*=\s*"([^"]+)"[^>]*>.*?</a>(?:\s*(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}(?::\d{2})?))?"#,
    )
    .ok()
});

/// Errors constructing an [`HttpProtocolClient`].
#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    /// The configured base URL does not parse or is not http(s).
    #[error("invalid corpus base URL: {0}")]
    InvalidBaseUrl(String),

    /// The underlying reqwest client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// reqwest-backed [`ProtocolClient`].
///
/// Cheap to clone; the inner connection pool is shared.
#[derive(Debug, Clone)]
pub struct HttpProtocolClient {
    client: Client,
    base_url: Url,
}

impl HttpProtocolClient {
    /// Creates a client rooted at `base_url`.
    ///
    /// `read_timeout_secs` bounds the gap between body reads, not the whole
    /// transfer, so multi-gigabyte files are not cut off.
    ///
    /// # Errors
    ///
    /// Returns [`HttpClientError::InvalidBaseUrl`] for a malformed or non-http(s)
    /// URL and [`HttpClientError::Build`] if reqwest rejects the configuration.
    #[instrument(level = "debug")]
    pub fn new(
        base_url: &str,
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, HttpClientError> {
        let base_url = normalize_base_url(base_url)?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(read_timeout_secs))
            .user_agent(user_agent::default_mirror_user_agent())
            .build()?;
        Ok(Self { client, base_url })
    }

    /// Returns the corpus root URL (always ends with `/`).
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, path: &str, directory: bool) -> Result<Url, ProtocolError> {
        let mut relative = path.trim_matches('/').to_string();
        if directory && !relative.is_empty() {
            relative.push('/');
        }
        self.base_url
            .join(&relative)
            .map_err(|e| ProtocolError::rejected(format!("{path} ({e})"), 400))
    }
}

#[async_trait]
impl ProtocolClient for HttpProtocolClient {
    #[instrument(skip(self), fields(dir = %dir))]
    async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>, ProtocolError> {
        let url = self.url_for(dir, true)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_transport_error(dir, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(dir, status));
        }

        let body = response
            .text()
            .await
            .map_err(|e| map_transport_error(dir, &e))?;
        let entries = parse_directory_index(dir, &body);
        debug!(entries = entries.len(), "parsed directory index");
        Ok(entries)
    }

    #[instrument(skip(self), fields(path = %path, start_offset))]
    async fn fetch(&self, path: &str, start_offset: u64) -> Result<FetchResponse, ProtocolError> {
        let url = self.url_for(path, false)?;
        let mut request = self.client.get(url);
        if start_offset > 0 {
            request = request.header(RANGE, format!("bytes={start_offset}-"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(path, &e))?;
        let status = response.status();
        let content_range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let (range_start, total) = content_range
                    .as_deref()
                    .and_then(parse_content_range)
                    .unwrap_or((start_offset, None));
                let total = total.or_else(|| {
                    response
                        .content_length()
                        .map(|remaining| range_start.saturating_add(remaining))
                });
                debug!(range_start, ?total, "server honoured range request");
                Ok(FetchResponse {
                    start_offset: range_start,
                    total_size: total,
                    body: body_stream(path, response),
                })
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                // Offset is at or past the end: nothing left to send.
                let total = content_range
                    .as_deref()
                    .and_then(parse_unsatisfied_range_total);
                debug!(?total, "range not satisfiable");
                Ok(FetchResponse {
                    start_offset,
                    total_size: total,
                    body: futures_util::stream::empty().boxed(),
                })
            }
            status if status.is_success() => {
                if start_offset > 0 {
                    debug!("server ignored range request, body starts at 0");
                }
                Ok(FetchResponse {
                    start_offset: 0,
                    total_size: response.content_length(),
                    body: body_stream(path, response),
                })
            }
            status => Err(map_status(path, status)),
        }
    }
}

fn body_stream(path: &str, response: reqwest::Response) -> super::ByteStream {
    let path = path.to_string();
    response
        .bytes_stream()
        .map(move |chunk| chunk.map_err(|e| map_transport_error(&path, &e)))
        .boxed()
}

fn normalize_base_url(raw: &str) -> Result<Url, HttpClientError> {
    let mut candidate = raw.trim().to_string();
    if !candidate.ends_with('/') {
        candidate.push('/');
    }
    let url =
        Url::parse(&candidate).map_err(|_| HttpClientError::InvalidBaseUrl(raw.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(HttpClientError::InvalidBaseUrl(raw.to_string()));
    }
    Ok(url)
}

fn map_transport_error(path: &str, error: &reqwest::Error) -> ProtocolError {
    if error.is_timeout() {
        ProtocolError::timeout(path)
    } else {
        ProtocolError::connection(path, error.to_string())
    }
}

/// Maps a non-success HTTP status onto the protocol error taxonomy.
///
/// | Status | Error |
/// |--------|-------|
/// | 404, 410 | `NotFound` |
/// | 401, 403, 407 | `Auth` |
/// | 408, 429, 5xx | `Connection` (transient) |
/// | other 4xx | `Rejected` |
#[allow(clippy::match_same_arms)]
fn map_status(path: &str, status: StatusCode) -> ProtocolError {
    let code = status.as_u16();
    match code {
        404 | 410 => ProtocolError::not_found(path),
        401 | 403 | 407 => ProtocolError::auth(path, format!("HTTP {code}")),
        408 | 429 => ProtocolError::connection(path, format!("HTTP {code}")),
        500..=599 => ProtocolError::connection(path, format!("HTTP {code}")),
        _ => ProtocolError::rejected(path, code),
    }
}

/// Parses `bytes START-END/TOTAL` (TOTAL may be `*`).
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.trim().strip_prefix("bytes")?.trim();
    let (range, total) = spec.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let total = total.trim().parse::<u64>().ok();
    Some((start, total))
}

/// Parses the `bytes */TOTAL` form sent with 416 responses.
fn parse_unsatisfied_range_total(value: &str) -> Option<u64> {
    let spec = value.trim().strip_prefix("bytes")?.trim();
    let total = spec.strip_prefix("*/")?;
    total.trim().parse::<u64>().ok()
}

/// Extracts file and directory entries from an autoindex HTML page.
///
/// Sort links (`?C=N;O=D`), absolute links, external URLs and the parent
/// directory link are ignored.
pub(crate) fn parse_directory_index(dir: &str, html: &str) -> Vec<RemoteEntry> {
    let Some(re) = INDEX_ENTRY_RE.as_ref() else {
        return Vec::new();
    };
    let prefix = dir.trim_matches('/');

    let mut entries = Vec::new();
    for captures in re.captures_iter(html) {
        let Some(href) = captures.get(1).map(|m| m.as_str()) else {
            continue;
        };
        if href.starts_with('?')
            || href.starts_with('/')
            || href.starts_with('#')
            || href.contains("://")
            || href.starts_with("../")
            || href == ".."
        {
            continue;
        }

        let is_directory = href.ends_with('/');
        let raw_name = href.trim_end_matches('/');
        let name = urlencoding::decode(raw_name)
            .map(std::borrow::Cow::into_owned)
            .unwrap_or_else(|_| raw_name.to_string());
        if name.is_empty() || name.contains('/') || name == "." {
            continue;
        }

        let path = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let modified = captures.get(2).map(|m| m.as_str().to_string());

        entries.push(RemoteEntry {
            path,
            kind: if is_directory {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
            size: None,
            modified,
        });
    }
    entries
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const APACHE_INDEX: &str = r#"
<html><head><title>Index of /pubchem/RDF/compound</title></head><body>
<h1>Index of /pubchem/RDF/compound</h1>
<pre><a href="?C=N;O=D">Name</a> <a href="?C=M;O=A">Last modified</a>
<hr><a href="/pubchem/RDF/">Parent Directory</a>
<a href="general/">general/</a>                  2024-05-01 03:12    -
<a href="Compound_000000001_000500000.ttl.gz">Compound_000000001_000500000.ttl.gz</a>  2024-04-28 11:03   100M
<a href="name%20with%20space.ttl.gz">name with space.ttl.gz</a>  2024-04-28 11:04   1.2K
<a href="https://example.org/elsewhere">elsewhere</a>
</pre></body></html>
"#;

    #[test]
    fn test_parse_directory_index_extracts_files_and_dirs() {
        let entries = parse_directory_index("compound", APACHE_INDEX);
        assert_eq!(entries.len(), 3, "{entries:?}");

        assert_eq!(entries[0].path, "compound/general");
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].modified.as_deref(), Some("2024-05-01 03:12"));

        assert_eq!(entries[1].path, "compound/Compound_000000001_000500000.ttl.gz");
        assert_eq!(entries[1].kind, EntryKind::File);
        assert!(entries[1].size.is_none());

        assert_eq!(entries[2].path, "compound/name with space.ttl.gz");
    }

    #[test]
    fn test_parse_directory_index_root_prefix() {
        let html = r#"<a href="compound/">compound/</a> <a href="../">up</a>"#;
        let entries = parse_directory_index("", html);
        assert_eq!(entries, vec![RemoteEntry {
            path: "compound".to_string(),
            kind: EntryKind::Directory,
            size: None,
            modified: None,
        }]);
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 100-199/1000"),
            Some((100, Some(1000)))
        );
        assert_eq!(parse_content_range("bytes 5-9/*"), Some((5, None)));
        assert_eq!(parse_content_range("items 1-2/3"), None);
    }

    #[test]
    fn test_parse_unsatisfied_range_total() {
        assert_eq!(parse_unsatisfied_range_total("bytes */1000"), Some(1000));
        assert_eq!(parse_unsatisfied_range_total("bytes 0-1/2"), None);
    }

    #[test]
    fn test_map_status_taxonomy() {
        assert!(matches!(
            map_status("p", StatusCode::NOT_FOUND),
            ProtocolError::NotFound { .. }
        ));
        assert!(matches!(
            map_status("p", StatusCode::GONE),
            ProtocolError::NotFound { .. }
        ));
        assert!(matches!(
            map_status("p", StatusCode::FORBIDDEN),
            ProtocolError::Auth { .. }
        ));
        assert!(matches!(
            map_status("p", StatusCode::TOO_MANY_REQUESTS),
            ProtocolError::Connection { .. }
        ));
        assert!(matches!(
            map_status("p", StatusCode::SERVICE_UNAVAILABLE),
            ProtocolError::Connection { .. }
        ));
        assert!(matches!(
            map_status("p", StatusCode::BAD_REQUEST),
            ProtocolError::Rejected { status: 400, .. }
        ));
    }

    #[test]
    fn test_normalize_base_url_appends_slash() {
        let url = normalize_base_url("https://ftp.ncbi.nlm.nih.gov/pubchem/RDF").unwrap();
        assert_eq!(url.as_str(), "https://ftp.ncbi.nlm.nih.gov/pubchem/RDF/");
    }

    #[test]
    fn test_normalize_base_url_rejects_other_schemes() {
        assert!(normalize_base_url("ftp://ftp.ncbi.nlm.nih.gov/pubchem/RDF/").is_err());
        assert!(normalize_base_url("not a url").is_err());
    }

    #[test]
    fn test_url_for_joins_under_base() {
        let client = HttpProtocolClient::new("https://example.org/rdf", 5, 5).unwrap();
        assert_eq!(
            client.url_for("compound/a.ttl.gz", false).unwrap().as_str(),
            "https://example.org/rdf/compound/a.ttl.gz"
        );
        assert_eq!(
            client.url_for("compound", true).unwrap().as_str(),
            "https://example.org/rdf/compound/"
        );
    }
}
