//! Metadata table and on-disk object management for the relay store.
//!
//! The metadata map (`DashMap`) is serialized independently of the room
//! registry (§5): uploads are single-writer per `fileId` by construction
//! (each gets a freshly minted id), and reads of a completed file are safe
//! to interleave since objects are immutable once written.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::Xxh64;

use crate::error::AppError;

/// Uploads at or above this declared size are eligible for the compressed
/// path when the caller requests it.
pub const MIN_COMPRESS_SIZE: u64 = 1024;

/// Read/write granularity for both ingestion and egress.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Declared-size ceiling for an upload.
pub const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Lifetime of a relayed file from upload to automatic expiry.
pub const RELAY_FILE_TTL: Duration = Duration::from_secs(60 * 60);

/// Expiry janitor cadence.
pub const JANITOR_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    pub stored_size: u64,
    pub original_size: u64,
    pub mime_type: String,
    pub checksum: String,
    pub compressed: bool,
    pub room_code: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileMetadata {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// A boxed, owned byte stream: the two download code paths (raw passthrough,
/// on-the-fly decompression) produce different concrete `Stream` types and
/// are unified behind this alias.
pub type BoxByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

fn generate_file_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub struct RelayStore {
    files: DashMap<String, FileMetadata>,
    upload_dir: PathBuf,
    total_bytes_relayed: AtomicU64,
}

impl RelayStore {
    pub fn new(upload_dir: PathBuf) -> Self {
        Self {
            files: DashMap::new(),
            upload_dir,
            total_bytes_relayed: AtomicU64::new(0),
        }
    }

    pub async fn ensure_upload_dir(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.upload_dir).await
    }

    fn object_path(&self, id: &str, compressed: bool) -> PathBuf {
        if compressed {
            self.upload_dir.join(format!("{id}.lz4"))
        } else {
            self.upload_dir.join(id)
        }
    }

    pub fn total_bytes_relayed(&self) -> u64 {
        self.total_bytes_relayed.load(Ordering::Relaxed)
    }

    /// Ingest an upload body as a streaming pipeline: no full buffering of
    /// the payload in memory regardless of which path is taken.
    pub async fn ingest<S, E>(
        &self,
        body: S,
        declared_len: Option<u64>,
        name: String,
        mime_type: String,
        room_code: Option<String>,
        compress: bool,
    ) -> Result<FileMetadata, AppError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(len) = declared_len {
            if len > MAX_FILE_SIZE {
                return Err(AppError::PayloadTooLarge);
            }
        }

        let id = generate_file_id();
        let take_compressed_path =
            compress && declared_len.is_some_and(|len| len > MIN_COMPRESS_SIZE);

        let mapped = body.map(|chunk| chunk.map_err(|e| io::Error::other(e)));
        let reader = StreamReader::new(mapped);

        let (original_size, stored_size, checksum) = if take_compressed_path {
            self.ingest_compressed(reader, &id).await?
        } else {
            self.ingest_raw(reader, &id).await?
        };

        let now = Utc::now();
        let metadata = FileMetadata {
            id: id.clone(),
            name,
            stored_size,
            original_size,
            mime_type,
            checksum,
            compressed: take_compressed_path,
            room_code,
            uploaded_at: now,
            expires_at: now + chrono::Duration::from_std(RELAY_FILE_TTL).unwrap(),
        };

        self.total_bytes_relayed
            .fetch_add(original_size, Ordering::Relaxed);
        info!(file = %id, original_size, stored_size, compressed = take_compressed_path, "file ingested");
        self.files.insert(id, metadata.clone());
        Ok(metadata)
    }

    async fn ingest_raw(
        &self,
        mut reader: impl tokio::io::AsyncRead + Unpin,
        id: &str,
    ) -> Result<(u64, u64, String), AppError> {
        let path = self.object_path(id, false);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(AppError::Io)?;
        let mut hasher = Xxh64::new(0);
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await.map_err(AppError::Io)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await.map_err(AppError::Io)?;
            total += n as u64;
        }
        file.flush().await.map_err(AppError::Io)?;
        Ok((total, total, format!("{:016x}", hasher.digest())))
    }

    async fn ingest_compressed(
        &self,
        reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        id: &str,
    ) -> Result<(u64, u64, String), AppError> {
        let path = self.object_path(id, true);
        tokio::task::spawn_blocking(move || -> io::Result<(u64, u64, String)> {
            let mut std_reader = SyncIoBridge::new(reader);
            let file = std::fs::File::create(&path)?;
            // §4.G calls for "level 4"; lz4_flex's frame encoder implements
            // only the single fixed-speed LZ4 algorithm (no HC levels in the
            // frame API), so there is no knob to set here — see DESIGN.md.
            let mut encoder = lz4_flex::frame::FrameEncoder::new(file);
            let mut hasher = Xxh64::new(0);
            let mut buf = vec![0u8; CHUNK_SIZE];
            let mut total = 0u64;
            loop {
                let n = std::io::Read::read(&mut std_reader, &mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                std::io::Write::write_all(&mut encoder, &buf[..n])?;
                total += n as u64;
            }
            let mut file = encoder.finish().map_err(io::Error::other)?;
            std::io::Write::flush(&mut file)?;
            let stored_size = file.metadata()?.len();
            Ok((total, stored_size, format!("{:016x}", hasher.digest())))
        })
        .await
        .map_err(|e| AppError::Transport(e.to_string()))?
        .map_err(AppError::Io)
    }

    pub fn info(&self, id: &str) -> Result<FileMetadata, AppError> {
        self.files
            .get(id)
            .map(|entry| entry.clone())
            .ok_or(AppError::NotFound)
    }

    /// Stream a file back, decompressing on the fly if it was stored
    /// compressed and the caller asked for plaintext.
    ///
    /// A corrupt chunk surfaces [`AppError::Transport`] and ends the stream
    /// early rather than silently falling back to raw bytes.
    pub async fn download(
        &self,
        id: &str,
        decompress: bool,
    ) -> Result<(FileMetadata, BoxByteStream), AppError> {
        let metadata = self.info(id)?;
        let path = self.object_path(id, metadata.compressed);
        if tokio::fs::metadata(&path).await.is_err() {
            warn!(file = %id, path = %path.display(), "metadata present but object missing on disk");
            return Err(AppError::NotFound);
        }

        let stream: BoxByteStream = if metadata.compressed && decompress {
            Box::pin(decompressed_stream(path))
        } else {
            Box::pin(raw_stream(path).await?)
        };
        Ok((metadata, stream))
    }

    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        let Some((_, metadata)) = self.files.remove(id) else {
            return Ok(());
        };
        let path = self.object_path(id, metadata.compressed);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(AppError::Io(e)),
        }
        debug!(file = %id, "file deleted");
        Ok(())
    }

    /// Delete every file whose TTL has elapsed. Run on [`JANITOR_INTERVAL`].
    fn sweep_expired(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|entry| entry.is_expired())
            .map(|entry| entry.id.clone())
            .collect()
    }
}

async fn raw_stream(
    path: PathBuf,
) -> Result<impl Stream<Item = io::Result<Bytes>>, AppError> {
    let file = tokio::fs::File::open(&path).await.map_err(AppError::Io)?;
    Ok(tokio_util::io::ReaderStream::with_capacity(file, CHUNK_SIZE))
}

fn decompressed_stream(path: PathBuf) -> impl Stream<Item = io::Result<Bytes>> {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(4);
    tokio::task::spawn_blocking(move || {
        let run = || -> io::Result<()> {
            let file = std::fs::File::open(&path)?;
            let mut decoder = lz4_flex::frame::FrameDecoder::new(file);
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = match std::io::Read::read(&mut decoder, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => return Err(e),
                };
                if tx
                    .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    break;
                }
            }
            Ok(())
        };
        if let Err(e) = run() {
            let _ = tx.blocking_send(Err(e));
        }
    });
    ReceiverStream::new(rx)
}

/// Spawn the expiry janitor. Aborting the returned handle cancels it
/// promptly — it is always suspended in `interval.tick()` between sweeps.
pub fn spawn_janitor(store: std::sync::Arc<RelayStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(JANITOR_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let expired = store.sweep_expired();
            for id in &expired {
                if let Err(e) = store.delete(id).await {
                    warn!(file = %id, error = %e, "janitor failed to delete expired file");
                }
            }
            if !expired.is_empty() {
                info!(reaped = expired.len(), "relay janitor swept expired files");
            }
        }
    })
}
