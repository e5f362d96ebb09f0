//! File naming and collision-free path resolution

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::RecordingFormat;
use crate::exchange::InterceptedRequest;
use crate::{RecorderError, Result};

/// Longest file name accepted from a naming override
pub const MAX_NAME_LEN: usize = 255;

/// Longest path slug embedded in default names
const SLUG_MAX: usize = 48;

/// Short hash of the request's path and query
///
/// Requests that differ only in host, headers or body share a hash; the
/// sequence number in the default name keeps them apart.
#[must_use]
pub fn url_hash(request: &InterceptedRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.path().as_bytes());
    if let Some(query) = request.query() {
        hasher.update(b"?");
        hasher.update(query.as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

/// Default file name: `{METHOD}-{slug}-{hash}-{seq}.{ext}`
#[must_use]
pub fn default_file_name(request: &InterceptedRequest, sequence: u64, extension: &str) -> String {
    let method: String = request
        .method
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let method = if method.is_empty() {
        "REQUEST".to_string()
    } else {
        method
    };

    format!(
        "{method}-{}-{}-{sequence:04}.{extension}",
        path_slug(request.path()),
        url_hash(request)
    )
}

/// Fold a URL path into a short file-system-safe slug
fn path_slug(path: &str) -> String {
    let decoded = urlencoding::decode(path).map_or_else(|_| path.to_string(), |p| p.into_owned());

    let mut slug = String::with_capacity(decoded.len().min(SLUG_MAX));
    for c in decoded.chars() {
        if slug.len() >= SLUG_MAX {
            break;
        }
        if c.is_ascii_alphanumeric() || c == '-' {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }

    let slug = slug.trim_end_matches('_');
    if slug.is_empty() {
        "root".to_string()
    } else {
        slug.to_string()
    }
}

/// File extension for a format, given the response content type
#[must_use]
pub fn extension_for(format: RecordingFormat, content_type: Option<&str>) -> &'static str {
    match format {
        RecordingFormat::Mocktail => "tail",
        RecordingFormat::HttpMessage => "response",
        RecordingFormat::BodyOnly | RecordingFormat::Custom => body_extension(content_type),
    }
}

fn body_extension(content_type: Option<&str>) -> &'static str {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "image/svg+xml" => "svg",
        "application/json" => "json",
        "application/xml" | "text/xml" => "xml",
        "text/html" => "html",
        "text/plain" => "txt",
        "text/css" => "css",
        "text/csv" => "csv",
        "application/javascript" | "text/javascript" => "js",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "application/pdf" => "pdf",
        m if m.ends_with("+json") => "json",
        m if m.ends_with("+xml") => "xml",
        m if m.starts_with("text/") => "txt",
        _ => "bin",
    }
}

/// Validate a file name returned by a naming override
///
/// # Errors
///
/// Returns error if the name could escape the output directory or is
/// otherwise unusable as a single path component
pub fn validate_file_name(name: &str) -> Result<()> {
    let reject = |reason: &str| {
        Err(RecorderError::InvalidPath {
            path: PathBuf::from(name),
            reason: reason.to_string(),
        })
    };

    if name.is_empty() {
        return reject("file name cannot be empty");
    }

    if name.len() > MAX_NAME_LEN {
        return reject("file name too long");
    }

    if name.contains('/') || name.contains('\\') {
        return reject("file name cannot contain path separators");
    }

    if name.starts_with('.') {
        return reject("file name cannot start with dot");
    }

    if name.contains('\0') {
        return reject("file name cannot contain null bytes");
    }

    if name.contains("..") {
        return reject("file name cannot contain '..'");
    }

    Ok(())
}

/// Per-session naming state: sequence counter and claimed paths
#[derive(Debug)]
pub struct NameRegistry {
    dir: PathBuf,
    next_sequence: u64,
    claimed: HashSet<PathBuf>,
}

impl NameRegistry {
    /// Create a registry for files under `dir`
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            next_sequence: 1,
            claimed: HashSet::new(),
        }
    }

    /// Directory files are resolved under
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate the next sequence number
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Number of paths claimed so far
    #[must_use]
    pub fn claimed_count(&self) -> usize {
        self.claimed.len()
    }

    /// Claim a unique path for `requested`, falling back to `default_name`
    /// when `requested` is not a valid file name
    pub fn claim(&mut self, requested: &str, default_name: &str) -> PathBuf {
        let name = match validate_file_name(requested) {
            Ok(()) => requested,
            Err(e) => {
                warn!("Rejected file name override: {}", e);
                default_name
            }
        };

        let mut candidate = self.dir.join(name);
        let mut suffix = 1u32;
        while self.is_taken(&candidate) {
            candidate = self.dir.join(with_suffix(name, suffix));
            suffix += 1;
        }

        self.claimed.insert(candidate.clone());
        candidate
    }

    /// Mark a path produced outside [`claim`](Self::claim) as taken
    ///
    /// Returns false if it was already claimed.
    pub fn reserve(&mut self, path: PathBuf) -> bool {
        self.claimed.insert(path)
    }

    fn is_taken(&self, path: &Path) -> bool {
        self.claimed.contains(path) || path.exists()
    }
}

/// Insert `-{suffix}` before the extension
fn with_suffix(name: &str, suffix: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{suffix}.{ext}"),
        _ => format!("{name}-{suffix}"),
    }
}
