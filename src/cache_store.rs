//! Content-addressed disk cache
//!
//! Entries live at `<cache_dir>/<key>`. Keys that name a directory (a bare
//! host or a path with a trailing slash) are stored in an index file inside
//! that directory.
//!
//! Writers never touch the final path. Bytes are staged into a uniquely named
//! sibling file (`<name>.<random>.temp~`) and published with one rename, so a
//! reader sees either no entry, an old complete entry, or a new complete
//! entry. Concurrent writers to the same key need no locking: the last
//! rename wins.
//!
//! # Entry layout
//!
//! With header persistence enabled an entry is framed as:
//!
//! ```text
//! UCP1\n | u32 big-endian head length | JSON head {status, headers} | body
//! ```
//!
//! Without it the file holds the raw body only.

use crate::cache_key::CacheKey;
use crate::error::{ProxyError, Result};
use crate::headers;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const ENTRY_MAGIC: &[u8; 5] = b"UCP1\n";
const MAX_HEAD_LEN: u32 = 1024 * 1024;
/// Suffix of in-progress staging files; no key segment may end with it
pub const STAGING_SUFFIX: &str = ".temp~";

/// File name used for directory-like keys; no key segment may equal it
pub const INDEX_FILE: &str = "_index";

/// Status line and headers stored in front of a cached body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl EntryHead {
    /// Capture the end-to-end part of an origin response.
    ///
    /// `Content-Length` is dropped; it is recomputed from the stored body on replay.
    pub fn from_response(status: StatusCode, response_headers: &HeaderMap) -> Self {
        let mut stored = Vec::with_capacity(response_headers.len());
        for (name, value) in headers::end_to_end(response_headers).iter() {
            if *name == CONTENT_LENGTH {
                continue;
            }
            match value.to_str() {
                Ok(v) => stored.push((name.as_str().to_string(), v.to_string())),
                Err(_) => debug!(header = %name, "skipping non-text header value"),
            }
        }
        EntryHead {
            status: status.as_u16(),
            headers: stored,
        }
    }

    /// Generic `200 OK` head for entries stored without headers
    pub fn generic(key: &CacheKey) -> Self {
        EntryHead {
            status: 200,
            headers: vec![(
                CONTENT_TYPE.as_str().to_string(),
                guess_content_type(key.as_str()).to_string(),
            )],
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }
}

/// Content type for a body-only entry, guessed from the key's extension
pub fn guess_content_type(key: &str) -> &'static str {
    let name = key.rsplit('/').next().unwrap_or(key);
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => String::new(),
    };
    match ext.as_str() {
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "js" => "application/javascript",
        "css" => "text/css",
        "gz" | "tgz" => "application/gzip",
        "zip" | "whl" => "application/zip",
        "tar" => "application/x-tar",
        _ => "application/octet-stream",
    }
}

/// A complete cache entry opened for reading
#[derive(Debug)]
pub struct CachedEntry {
    /// Stored head, `None` for body-only entries
    pub head: Option<EntryHead>,
    /// Length of the body in bytes
    pub body_len: u64,
    body: File,
}

impl CachedEntry {
    /// File handle positioned at the first body byte
    pub fn into_body(self) -> File {
        self.body
    }

    /// Read the whole body into memory
    pub async fn read_body(mut self) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(self.body_len as usize);
        self.body.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// Disk cache rooted at a directory
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    persist_headers: bool,
}

impl CacheStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>, persist_headers: bool) -> Self {
        CacheStore {
            root: root.into(),
            persist_headers,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn persists_headers(&self) -> bool {
        self.persist_headers
    }

    /// Final on-disk path for `key`
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let path = self.root.join(key.as_str());
        if key.is_directory_like() {
            path.join(INDEX_FILE)
        } else {
            path
        }
    }

    /// Open the committed entry for `key`, if any.
    ///
    /// Only the final path is consulted, so an entry that is still being
    /// staged is never returned.
    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedEntry>> {
        let path = self.entry_path(key);

        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Ok(None);
        }
        let file_len = metadata.len();

        if !self.persist_headers {
            return Ok(Some(CachedEntry {
                head: None,
                body_len: file_len,
                body: file,
            }));
        }

        match read_head(&mut file, file_len).await? {
            HeadRead::Framed { head, body_offset } => Ok(Some(CachedEntry {
                head: Some(head),
                body_len: file_len - body_offset,
                body: file,
            })),
            HeadRead::Unframed => {
                file.seek(SeekFrom::Start(0)).await?;
                Ok(Some(CachedEntry {
                    head: None,
                    body_len: file_len,
                    body: file,
                }))
            }
            HeadRead::Corrupt(reason) => {
                warn!(key = %key, reason, "ignoring unreadable cache entry");
                Ok(None)
            }
        }
    }

    /// Allocate a staging file next to the final path for `key`.
    ///
    /// The parent directory is created on demand; concurrent creation of the
    /// same directory is harmless.
    pub async fn begin_write(&self, key: &CacheKey, head: &EntryHead) -> Result<CacheWriter> {
        let final_path = self.entry_path(key);
        let (parent, file_name) = match (final_path.parent(), final_path.file_name()) {
            (Some(parent), Some(name)) => (parent.to_path_buf(), name.to_string_lossy().into_owned()),
            _ => {
                return Err(ProxyError::CacheWriteError(format!(
                    "cache path {} has no parent",
                    final_path.display()
                )))
            }
        };

        fs::create_dir_all(&parent)
            .await
            .map_err(|e| ProxyError::cache_write("failed to create cache directory", e))?;

        let staging = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(&format!("{}.", file_name))
                .suffix(STAGING_SUFFIX)
                .tempfile_in(&parent)
        })
        .await
        .map_err(|e| ProxyError::CacheWriteError(format!("staging task failed: {}", e)))?
        .map_err(|e| ProxyError::cache_write("failed to create staging file", e))?;

        let (file, temp_path) = staging.into_parts();
        let mut writer = CacheWriter {
            file: File::from_std(file),
            temp_path,
            final_path,
            key: key.clone(),
            body_bytes: 0,
        };

        if self.persist_headers {
            writer.write_head(head).await?;
        }

        debug!(key = %key, staging = %writer.temp_path.display(), "staging cache entry");
        Ok(writer)
    }
}

enum HeadRead {
    Framed { head: EntryHead, body_offset: u64 },
    Unframed,
    Corrupt(&'static str),
}

async fn read_head(file: &mut File, file_len: u64) -> Result<HeadRead> {
    let prefix_len = (ENTRY_MAGIC.len() + 4) as u64;
    if file_len < prefix_len {
        return Ok(HeadRead::Unframed);
    }

    let mut magic = [0u8; 5];
    file.read_exact(&mut magic).await?;
    if &magic != ENTRY_MAGIC {
        return Ok(HeadRead::Unframed);
    }

    let head_len = file.read_u32().await?;
    if head_len > MAX_HEAD_LEN || prefix_len + head_len as u64 > file_len {
        return Ok(HeadRead::Corrupt("head length out of range"));
    }

    let mut raw = vec![0u8; head_len as usize];
    file.read_exact(&mut raw).await?;
    match serde_json::from_slice::<EntryHead>(&raw) {
        Ok(head) => Ok(HeadRead::Framed {
            head,
            body_offset: prefix_len + head_len as u64,
        }),
        Err(_) => Ok(HeadRead::Corrupt("head is not valid JSON")),
    }
}

/// Handle to an entry being staged
///
/// Dropping the writer without [`commit`](CacheWriter::commit) removes the
/// staging file, so a cancelled request never leaves debris under the final key.
pub struct CacheWriter {
    file: File,
    temp_path: TempPath,
    final_path: PathBuf,
    key: CacheKey,
    body_bytes: u64,
}

impl CacheWriter {
    async fn write_head(&mut self, head: &EntryHead) -> Result<()> {
        let raw = serde_json::to_vec(head)
            .map_err(|e| ProxyError::CacheWriteError(format!("failed to encode head: {}", e)))?;
        let len = u32::try_from(raw.len())
            .ok()
            .filter(|len| *len <= MAX_HEAD_LEN)
            .ok_or_else(|| ProxyError::CacheWriteError("response head too large".to_string()))?;

        self.file
            .write_all(ENTRY_MAGIC)
            .await
            .map_err(|e| ProxyError::cache_write("failed to write head", e))?;
        self.file
            .write_u32(len)
            .await
            .map_err(|e| ProxyError::cache_write("failed to write head", e))?;
        self.file
            .write_all(&raw)
            .await
            .map_err(|e| ProxyError::cache_write("failed to write head", e))?;
        Ok(())
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn staging_path(&self) -> &Path {
        &self.temp_path
    }

    /// Body bytes staged so far
    pub fn bytes_written(&self) -> u64 {
        self.body_bytes
    }

    /// Append a chunk of body to the staging file.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| ProxyError::cache_write("failed to write staging file", e))?;
        self.body_bytes += chunk.len() as u64;
        Ok(())
    }

    /// Flush the staging file and publish it under the final path with a
    /// single rename. Returns the number of body bytes published.
    pub async fn commit(self) -> Result<u64> {
        let CacheWriter {
            mut file,
            temp_path,
            final_path,
            key,
            body_bytes,
        } = self;

        file.flush()
            .await
            .map_err(|e| ProxyError::cache_write("failed to flush staging file", e))?;
        file.sync_all()
            .await
            .map_err(|e| ProxyError::cache_write("failed to sync staging file", e))?;
        drop(file);

        let target = final_path.clone();
        tokio::task::spawn_blocking(move || temp_path.persist(&target))
            .await
            .map_err(|e| ProxyError::CacheWriteError(format!("publish task failed: {}", e)))?
            .map_err(|e| ProxyError::cache_write("failed to publish cache entry", e.error))?;

        info!(key = %key, bytes = body_bytes, path = %final_path.display(), "cache entry committed");
        Ok(body_bytes)
    }

    /// Discard the staging file. Nothing appears under the final path.
    pub async fn abort(self) {
        let CacheWriter {
            file,
            temp_path,
            key,
            body_bytes,
            ..
        } = self;
        drop(file);

        match fs::remove_file(&temp_path).await {
            Ok(()) => {
                // already gone; stop the drop handler from trying again
                let _ = temp_path.keep();
            }
            Err(e) => {
                warn!(key = %key, error = %e, "failed to remove staging file");
            }
        }
        debug!(key = %key, bytes = body_bytes, "cache write aborted");
    }
}

#[cfg(test)]
impl CacheWriter {
    /// Writer whose staging file is open read-only, so writes fail.
    pub(crate) async fn unwritable(store: &CacheStore, key: &CacheKey) -> Self {
        let final_path = store.entry_path(key);
        let parent = final_path.parent().unwrap().to_path_buf();
        std::fs::create_dir_all(&parent).unwrap();
        let temp_path = tempfile::Builder::new()
            .suffix(STAGING_SUFFIX)
            .tempfile_in(&parent)
            .unwrap()
            .into_temp_path();
        let file = File::open(&temp_path).await.unwrap();
        CacheWriter {
            file,
            temp_path,
            final_path,
            key: key.clone(),
            body_bytes: 0,
        }
    }
}
