//! Object-store plumbing: root locations, input glob resolution and the
//! overwrite / staged-commit primitives used by table writes.
//!
//! The engine reads and writes through `object_store` stores registered on
//! the DataFusion runtime. Everything here operates on object-store paths
//! (`song_data/A/B/C/x.json`), never on local filesystem paths, so the same
//! code serves `s3a://` buckets and local directories.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use regex::Regex;
use url::Url;

use crate::config::types::AwsCredentials;

/// Errors raised while interpreting or manipulating storage locations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid location '{location}': {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("unsupported scheme '{0}' (expected s3, s3a, file or a filesystem path)")]
    UnsupportedScheme(String),

    #[error("invalid glob '{pattern}': {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("refusing to delete the root of store {0}")]
    RefusedRootDelete(String),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

/// Which kind of store a location lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// An S3 bucket addressed as `s3://` or `s3a://`.
    S3 { scheme: String, bucket: String },
    /// The local filesystem.
    Local,
}

/// A directory-like location: a store plus a key prefix inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    kind: StoreKind,
    prefix: ObjectPath,
}

impl StorageLocation {
    /// Parse an `s3://`, `s3a://` or `file://` URL, or a filesystem path.
    ///
    /// # Errors
    ///
    /// Returns an error for other schemes, bucket-less S3 URLs and paths
    /// that cannot be made absolute.
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let raw = raw.trim();
        let invalid = |reason: String| StorageError::InvalidLocation {
            location: raw.to_string(),
            reason,
        };

        if raw.is_empty() {
            return Err(invalid("location is empty".to_string()));
        }

        if !raw.contains("://") {
            let absolute =
                std::path::absolute(raw).map_err(|e| invalid(format!("cannot resolve path: {e}")))?;
            return Self::local(absolute).map_err(|e| invalid(e.to_string()));
        }

        let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        match url.scheme() {
            "s3" | "s3a" => {
                let bucket = url
                    .host_str()
                    .filter(|host| !host.is_empty())
                    .ok_or_else(|| invalid("missing bucket name".to_string()))?;
                let prefix =
                    ObjectPath::from_url_path(url.path()).map_err(|e| invalid(e.to_string()))?;
                Ok(Self {
                    kind: StoreKind::S3 {
                        scheme: url.scheme().to_string(),
                        bucket: bucket.to_string(),
                    },
                    prefix,
                })
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|()| invalid("not a valid file URL".to_string()))?;
                Self::local(path).map_err(|e| invalid(e.to_string()))
            }
            other => Err(StorageError::UnsupportedScheme(other.to_string())),
        }
    }

    fn local(path: PathBuf) -> Result<Self, object_store::path::Error> {
        Ok(Self {
            kind: StoreKind::Local,
            prefix: ObjectPath::from_absolute_path(path)?,
        })
    }

    #[must_use]
    pub fn kind(&self) -> &StoreKind {
        &self.kind
    }

    /// Key prefix inside the store.
    #[must_use]
    pub fn prefix(&self) -> &ObjectPath {
        &self.prefix
    }

    /// URL identifying the store itself (`s3a://bucket`, `file:///`).
    #[must_use]
    pub fn store_url(&self) -> String {
        match &self.kind {
            StoreKind::S3 { scheme, bucket } => format!("{scheme}://{bucket}"),
            StoreKind::Local => "file:///".to_string(),
        }
    }

    /// Full URL of an object in this location's store.
    #[must_use]
    pub fn object_url(&self, path: &ObjectPath) -> String {
        match &self.kind {
            StoreKind::S3 { scheme, bucket } => format!("{scheme}://{bucket}/{path}"),
            StoreKind::Local => format!("file:///{path}"),
        }
    }

    /// Directory URL of this location, with a trailing `/`.
    #[must_use]
    pub fn dir_url(&self) -> String {
        let base = self.object_url(&self.prefix);
        if base.ends_with('/') {
            base
        } else {
            format!("{base}/")
        }
    }

    /// A location nested under this one.
    #[must_use]
    pub fn child(&self, relative: &str) -> Self {
        let prefix = relative
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.prefix.clone(), |prefix, segment| prefix.child(segment));
        Self {
            kind: self.kind.clone(),
            prefix,
        }
    }

    /// Whether this location equals or is nested under `other`.
    #[must_use]
    pub fn is_within(&self, other: &StorageLocation) -> bool {
        self.kind == other.kind && self.prefix.prefix_matches(&other.prefix)
    }
}

impl std::fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.dir_url())
    }
}

/// Build the object store serving `location`.
///
/// S3 stores start from the standard `AWS_*` environment and are then
/// overridden by explicit credentials when given.
///
/// # Errors
///
/// Returns an error if the S3 client cannot be configured.
pub fn build_store(
    location: &StorageLocation,
    credentials: Option<&AwsCredentials>,
) -> Result<Arc<dyn ObjectStore>, StorageError> {
    match location.kind() {
        StoreKind::Local => Ok(Arc::new(LocalFileSystem::new())),
        StoreKind::S3 { bucket, .. } => {
            let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
            if let Some(aws) = credentials {
                builder = builder
                    .with_access_key_id(&aws.access_key_id)
                    .with_secret_access_key(&aws.secret_access_key);
                if let Some(region) = &aws.region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = &aws.endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
            }
            Ok(Arc::new(builder.build()?))
        }
    }
}

fn is_glob_meta(c: char) -> bool {
    matches!(c, '*' | '?' | '[')
}

/// Translate a shell-style glob into an anchored regex. `*` and `?` never
/// cross a `/`.
fn glob_to_regex(glob: &str) -> Result<String, String> {
    let mut re = String::from("^");
    let mut chars = glob.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            '[' => {
                let mut class = String::from("[");
                let mut closed = false;
                let mut first = true;
                for c in chars.by_ref() {
                    match c {
                        ']' if !first => {
                            closed = true;
                            break;
                        }
                        '!' if first => class.push('^'),
                        '\\' | '[' | '^' => {
                            class.push('\\');
                            class.push(c);
                        }
                        _ => class.push(c),
                    }
                    first = false;
                }
                if !closed {
                    return Err("unterminated character class".to_string());
                }
                class.push(']');
                re.push_str(&class);
            }
            other => re.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    Ok(re)
}

/// Relative key of `path` under `prefix`, or `None` if it is not nested there.
fn relative_key(prefix: &ObjectPath, path: &ObjectPath) -> Option<String> {
    let parts: Vec<String> = path
        .prefix_match(prefix)?
        .map(|part| part.as_ref().to_string())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn list_prefix<'a>(
    store: &'a dyn ObjectStore,
    prefix: &'a ObjectPath,
) -> futures::stream::BoxStream<'a, object_store::Result<object_store::ObjectMeta>> {
    if prefix.as_ref().is_empty() {
        store.list(None)
    } else {
        store.list(Some(prefix))
    }
}

/// An input glob split into a literal base location and a relative pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    base: StorageLocation,
    glob: String,
    matcher: Regex,
}

impl GlobPattern {
    /// Split `pattern` at the last `/` before its first wildcard.
    ///
    /// # Errors
    ///
    /// Returns an error if the base location is invalid or the glob is malformed.
    pub fn parse(pattern: &str) -> Result<Self, StorageError> {
        let invalid = |reason: String| StorageError::InvalidGlob {
            pattern: pattern.to_string(),
            reason,
        };

        let search_end = pattern.find(is_glob_meta).unwrap_or(pattern.len());
        let split_at = pattern[..search_end]
            .rfind('/')
            .map(|idx| idx + 1)
            .ok_or_else(|| invalid("pattern has no base directory".to_string()))?;
        let (base, glob) = pattern.split_at(split_at);
        if glob.is_empty() {
            return Err(invalid("pattern does not name any files".to_string()));
        }

        let base = StorageLocation::parse(base)?;
        let matcher = Regex::new(&glob_to_regex(glob).map_err(invalid)?)
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            base,
            glob: glob.to_string(),
            matcher,
        })
    }

    /// Literal directory the glob is evaluated in.
    #[must_use]
    pub fn base(&self) -> &StorageLocation {
        &self.base
    }

    /// The wildcard part, relative to [`GlobPattern::base`].
    #[must_use]
    pub fn glob(&self) -> &str {
        &self.glob
    }

    /// Whether a key relative to the base matches.
    #[must_use]
    pub fn matches(&self, relative: &str) -> bool {
        self.matcher.is_match(relative)
    }

    /// List the base prefix and keep every object the glob matches.
    /// Hidden objects (any segment starting with `.` or `_`) are never
    /// matched, so the count equals what the reader will open.
    ///
    /// # Errors
    ///
    /// Returns an error if listing the store fails.
    pub async fn resolve(&self, store: &dyn ObjectStore) -> Result<ResolvedFiles, StorageError> {
        let prefix = self.base.prefix();
        let mut listing = list_prefix(store, prefix);
        let mut files = Vec::new();

        while let Some(meta) = listing.next().await {
            let meta = meta?;
            let Some(relative) = relative_key(prefix, &meta.location) else {
                continue;
            };
            if !is_hidden(&relative) && self.matches(&relative) {
                files.push(meta.location);
            }
        }
        files.sort();

        Ok(ResolvedFiles { files })
    }
}

fn is_hidden(relative: &str) -> bool {
    relative
        .split('/')
        .any(|segment| segment.starts_with('.') || segment.starts_with('_'))
}

/// Objects matched by a [`GlobPattern`], sorted by key.
#[derive(Debug, Clone)]
pub struct ResolvedFiles {
    files: Vec<ObjectPath>,
}

impl ResolvedFiles {
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn files(&self) -> &[ObjectPath] {
        &self.files
    }
}

/// Delete every object under `prefix`. Returns the number of objects removed.
///
/// # Errors
///
/// Refuses an empty prefix; otherwise fails if listing or deleting fails.
pub async fn delete_prefix(
    store: &dyn ObjectStore,
    prefix: &ObjectPath,
) -> Result<usize, StorageError> {
    if prefix.as_ref().is_empty() {
        return Err(StorageError::RefusedRootDelete(store.to_string()));
    }

    let locations: Vec<ObjectPath> = store
        .list(Some(prefix))
        .map_ok(|meta| meta.location)
        .try_collect()
        .await?;

    for location in &locations {
        match store.delete(location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(locations.len())
}

/// Move every object under `from` to the same relative key under `to`.
/// Returns the number of objects moved.
///
/// # Errors
///
/// Fails if listing or any rename fails.
pub async fn promote_prefix(
    store: &dyn ObjectStore,
    from: &ObjectPath,
    to: &ObjectPath,
) -> Result<usize, StorageError> {
    let staged: Vec<ObjectPath> = store
        .list(Some(from))
        .map_ok(|meta| meta.location)
        .try_collect()
        .await?;

    for source in &staged {
        let Some(parts) = source.prefix_match(from) else {
            continue;
        };
        let target = parts.fold(to.clone(), |target, part| target.child(part));
        store.rename(source, &target).await?;
    }
    Ok(staged.len())
}

/// Distinct partition directories (`year=2018/month=11`) under `prefix`,
/// taking the first `depth` path segments of every object.
///
/// # Errors
///
/// Fails if listing the store fails.
pub async fn list_partitions(
    store: &dyn ObjectStore,
    prefix: &ObjectPath,
    depth: usize,
) -> Result<BTreeSet<String>, StorageError> {
    let mut partitions = BTreeSet::new();
    if depth == 0 {
        return Ok(partitions);
    }

    let mut listing = list_prefix(store, prefix);
    while let Some(meta) = listing.next().await {
        let meta = meta?;
        let Some(relative) = relative_key(prefix, &meta.location) else {
            continue;
        };
        let segments: Vec<&str> = relative.split('/').collect();
        if segments.len() > depth {
            partitions.insert(segments[..depth].join("/"));
        }
    }
    Ok(partitions)
}
