use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    primitives::ByteStream,
    types::{Delete, ObjectIdentifier},
    Client,
};
use glob::{MatchOptions, Pattern};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;
use walkdir::WalkDir;

/// Where a dataset lives: an S3 bucket and key prefix, or a local directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    S3 { bucket: String, prefix: String },
    Local(PathBuf),
}

impl Location {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("location is empty".to_string());
        }

        for scheme in ["s3://", "s3a://", "s3n://"] {
            if let Some(rest) = raw.strip_prefix(scheme) {
                let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(format!("no bucket in {}", raw));
                }
                return Ok(Location::S3 {
                    bucket: bucket.to_string(),
                    prefix: prefix.trim_matches('/').to_string(),
                });
            }
        }

        let path = raw.strip_prefix("file://").unwrap_or(raw);
        if path.is_empty() {
            return Err(format!("no path in {}", raw));
        }
        Ok(Location::Local(PathBuf::from(path)))
    }

    pub fn is_s3(&self) -> bool {
        matches!(self, Location::S3 { .. })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::S3 { bucket, prefix } if prefix.is_empty() => write!(f, "s3://{}/", bucket),
            Location::S3 { bucket, prefix } => write!(f, "s3://{}/{}/", bucket, prefix),
            Location::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Flat key/value view over a storage root. Keys are `/`-separated and
/// relative to the root the store was created with.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn put(&self, key: &str, body: Vec<u8>, metadata: &[(&str, String)]) -> Result<()>;

    /// Removes every key under `prefix` and returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Human readable address of `key`, used in logs.
    fn display(&self, key: &str) -> String;
}

pub struct S3Store {
    client: Client,
    bucket: String,
    root: String,
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            root: root.into().trim_matches('/').to_string(),
        }
    }

    /// Fails when the bucket is missing or the credentials cannot reach it.
    pub async fn probe(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .with_context(|| format!("Bucket s3://{} is not reachable", self.bucket))?;
        Ok(())
    }

    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    fn relative_key<'a>(&self, full_key: &'a str) -> Option<&'a str> {
        if self.root.is_empty() {
            Some(full_key)
        } else {
            full_key
                .strip_prefix(self.root.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.full_key(prefix))
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page
                .with_context(|| format!("Error listing {}", self.display(prefix)))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .filter_map(|key| self.relative_key(key))
                    .map(|key| key.to_string()),
            );
        }
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let obj = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .with_context(|| format!("Error fetching {}", self.display(key)))?;

        let data = obj.body.collect().await?.into_bytes();
        Ok(data.to_vec())
    }

    async fn put(&self, key: &str, body: Vec<u8>, metadata: &[(&str, String)]) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(ByteStream::from(body))
            .content_type("application/octet-stream");
        for (name, value) in metadata {
            request = request.metadata(*name, value);
        }
        request
            .send()
            .await
            .with_context(|| format!("Error uploading {}", self.display(key)))?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list(prefix).await?;
        // DeleteObjects accepts at most 1000 keys per request
        for chunk in keys.chunks(1000) {
            let objects = chunk
                .iter()
                .map(|key| ObjectIdentifier::builder().key(self.full_key(key)).build())
                .collect::<Result<Vec<_>, _>>()?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .with_context(|| format!("Error deleting under {}", self.display(prefix)))?;
        }
        Ok(keys.len())
    }

    fn display(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, self.full_key(key))
    }
}

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Only the directory the prefix points into needs walking.
        let start = match prefix.rsplit_once('/') {
            Some((dir, _)) => self.path_of(dir),
            None => self.root.clone(),
        };
        if !start.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&start).follow_links(true) {
            let entry = entry.with_context(|| format!("Error walking {}", start.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root)?;
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_of(key);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Error reading {}", path.display()))
    }

    async fn put(&self, key: &str, body: Vec<u8>, _metadata: &[(&str, String)]) -> Result<()> {
        let path = self.path_of(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Error creating {}", parent.display()))?;
        }
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Error writing {}", path.display()))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list(prefix).await?;
        for key in &keys {
            let path = self.path_of(key);
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("Error removing {}", path.display()))?;
        }

        // Leftover partition directories would otherwise pile up between runs.
        let dir = self.path_of(prefix);
        if prefix.ends_with('/') && dir != self.root && dir.is_dir() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Error removing {}", dir.display()))?;
        }
        Ok(keys.len())
    }

    fn display(&self, key: &str) -> String {
        self.path_of(key).display().to_string()
    }
}

/// Shell-style pattern over store keys: `*` and `?` stay within one path
/// segment, `**` spans zero or more whole segments, `[abc]` / `[!abc]` are
/// character classes.
#[derive(Debug, Clone)]
pub struct KeyGlob {
    raw: String,
    pattern: Pattern,
}

const KEY_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl KeyGlob {
    pub fn new(pattern: &str) -> Result<Self> {
        let compiled = Pattern::new(pattern)
            .map_err(|e| anyhow!("Invalid glob pattern {}: {}", pattern, e))?;
        Ok(Self {
            raw: pattern.to_string(),
            pattern: compiled,
        })
    }

    /// Longest wildcard-free leading part, used to narrow listings.
    pub fn literal_prefix(&self) -> &str {
        let end = self
            .raw
            .find(|c| matches!(c, '*' | '?' | '['))
            .unwrap_or(self.raw.len());
        &self.raw[..end]
    }

    pub fn matches(&self, key: &str) -> bool {
        self.pattern.matches_with(key, KEY_MATCH)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Keys in `store` matching `glob`, in sorted order.
pub async fn list_matching(store: &dyn ObjectStore, glob: &KeyGlob) -> Result<Vec<String>> {
    let candidates = store.list(glob.literal_prefix()).await?;
    let total = candidates.len();
    let keys: Vec<String> = candidates
        .into_iter()
        .filter(|key| glob.matches(key))
        .collect();
    debug!(
        "Glob {} matched {} of {} listed keys",
        glob.as_str(),
        keys.len(),
        total
    );
    Ok(keys)
}
