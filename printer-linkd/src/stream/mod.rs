//! MJPEG multipart stream reader.
//!
//! A [`StreamReader`] owns a background task that connects to a webcam
//! stream, cuts the multipart body into images and decodes them. Results
//! arrive on a channel as [`StreamSnapshot`]s; the last item before the
//! channel closes is the error that ended the stream, if any.

pub mod analytics;
pub mod decoder;
pub mod parser;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures::TryStreamExt;
use image::RgbaImage;
use reqwest::header::CONTENT_TYPE;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use crate::config::StreamConfig;
use crate::error::{LinkError, Result};
use self::analytics::{FrameAnalytics, FrameStats};
use self::decoder::FrameDecoder;
use self::parser::{boundary_from_content_type, MultipartParser};

#[derive(Debug, Clone)]
pub enum StreamSnapshot {
    /// A connection attempt is starting
    Loading,
    Frame {
        image: Arc<RgbaImage>,
        analytics: FrameAnalytics,
    },
}

pub struct StreamReader {
    rx: mpsc::Receiver<Result<StreamSnapshot>>,
    cancel: CancellationToken,
}

impl StreamReader {
    /// Start reading `url`. Credentials in the URL are sent as basic auth.
    pub fn spawn(url: &str, config: StreamConfig, client: reqwest::Client) -> Result<Self> {
        let url = Url::parse(url)?;
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let task = StreamTask {
            request: StreamRequest::from_url(url),
            config,
            client,
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        Ok(Self { rx, cancel })
    }

    /// Next snapshot. `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<StreamSnapshot>> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct StreamRequest {
    url: Url,
    username: Option<String>,
    password: Option<String>,
}

impl StreamRequest {
    fn from_url(mut url: Url) -> Self {
        let username = Some(url.username().to_string()).filter(|u| !u.is_empty());
        let password = url.password().map(str::to_string);
        if username.is_some() || password.is_some() {
            let _ = url.set_username("");
            let _ = url.set_password(None);
        }
        Self { url, username, password }
    }

    fn build(&self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let request = client.get(self.url.clone());
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }
}

struct StreamTask {
    request: StreamRequest,
    config: StreamConfig,
    client: reqwest::Client,
    tx: mpsc::Sender<Result<StreamSnapshot>>,
    cancel: CancellationToken,
}

enum SessionEnd {
    /// Cancelled or nobody is listening anymore
    Stopped,
    Failed(LinkError),
}

impl StreamTask {
    async fn run(self) {
        let mut has_connected_once = false;
        let mut attempt = 0u32;
        let host = self.request.url.host_str().unwrap_or_default().to_string();

        loop {
            if self.tx.send(Ok(StreamSnapshot::Loading)).await.is_err() {
                break;
            }

            let end = tokio::select! {
                end = self.session(&mut has_connected_once) => end,
                _ = self.cancel.cancelled() => SessionEnd::Stopped,
                _ = self.tx.closed() => SessionEnd::Stopped,
            };

            let error = match end {
                SessionEnd::Stopped => {
                    tracing::debug!("Stream from {} stopped", host);
                    break;
                }
                SessionEnd::Failed(e) => e,
            };

            if !error.is_retryable() {
                tracing::error!("Stream from {} failed: {}", host, error);
                let _ = self.tx.send(Err(error)).await;
                break;
            }
            if !has_connected_once {
                tracing::info!("Stream from {} failed before connecting, not retrying: {}", host, error);
                let _ = self.tx.send(Err(error)).await;
                break;
            }
            if attempt >= self.config.reconnect_attempts {
                tracing::info!("Reconnecting to {} failed, giving up: {}", host, error);
                let _ = self.tx.send(Err(error)).await;
                break;
            }

            attempt += 1;
            let backoff = self.config.backoff(attempt);
            tracing::info!(
                "Stream from {} broke down, reconnecting in {:?} (attempt {}): {}",
                host,
                backoff,
                attempt,
                error
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.cancel.cancelled() => break,
                _ = self.tx.closed() => break,
            }
        }
    }

    async fn session(&self, has_connected_once: &mut bool) -> SessionEnd {
        match self.read_frames(has_connected_once).await {
            Ok(()) => SessionEnd::Stopped,
            Err(e) => SessionEnd::Failed(e),
        }
    }

    /// One connection. Returns `Ok` only when the consumer went away.
    async fn read_frames(&self, has_connected_once: &mut bool) -> Result<()> {
        let response = self.request.build(&self.client).send().await?.error_for_status()?;
        *has_connected_once = true;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| LinkError::InvalidStreamHeader("missing content type".to_string()))?
            .to_string();
        let boundary = boundary_from_content_type(&content_type)?;
        tracing::info!("Connected to {}, content type {}", self.request.url, content_type);

        let body = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let mut reader = tokio_util::io::StreamReader::new(Box::pin(body));

        let mut parser = MultipartParser::new(boundary, self.config.max_buffer_bytes);
        let mut decoder = FrameDecoder::new(self.config.max_resolution, self.config.pool_size);
        let mut stats = FrameStats::new(self.config.stats_window);
        let mut chunk = vec![0u8; self.config.read_chunk_bytes.max(1)];
        let read_timeout = Duration::from_millis(self.config.timeout_ms);
        let mut dropped = 0usize;
        let mut frame_index = 0u64;

        loop {
            let read_started = Instant::now();
            let n = tokio::time::timeout(read_timeout, reader.read(&mut chunk))
                .await
                .map_err(|_| LinkError::ConnectionIo("read timed out".to_string()))??;
            if n == 0 {
                return Err(LinkError::ConnectionIo("stream ended".to_string()));
            }
            let read_time = read_started.elapsed();

            if let Err(e) = parser.push(&chunk[..n]) {
                return Err(self.dump_overflow(e, parser.buffered()).await);
            }

            loop {
                let search_started = Instant::now();
                let Some(part) = parser.next_part() else {
                    break;
                };
                let search_time = search_started.elapsed();

                let decode_started = Instant::now();
                match decoder.decode(&part) {
                    Ok(frame) => {
                        frame_index += 1;
                        let analytics = FrameAnalytics {
                            frame_index,
                            read_time,
                            search_time,
                            decode_time: decode_started.elapsed(),
                            dropped_before: dropped,
                            sample_size: decoder.sample_size().unwrap_or(1),
                            reused_buffer: frame.reused,
                            buffered_bytes: parser.len(),
                        };
                        dropped = 0;

                        if let Some(summary) = stats.record(&analytics) {
                            tracing::info!(
                                "FPS: {:.1} (read {:?}, search {:?}, decode {:?})",
                                summary.fps,
                                summary.avg_read,
                                summary.avg_search,
                                summary.avg_decode
                            );
                        }

                        let snapshot = StreamSnapshot::Frame {
                            image: frame.image,
                            analytics,
                        };
                        if self.tx.send(Ok(snapshot)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        dropped += 1;
                        tracing::debug!("Dropped frame ({} in a row): {}", dropped, e);
                        if dropped >= self.config.max_dropped_frames {
                            return Err(LinkError::TooManyDroppedFrames(dropped));
                        }
                    }
                }
            }
        }
    }

    async fn dump_overflow(&self, error: LinkError, buffered: &[u8]) -> LinkError {
        let LinkError::BufferOverflow { size, limit, .. } = error else {
            return error;
        };
        let dump = match &self.config.diagnostics_dir {
            Some(dir) => write_dump(dir, buffered).await,
            None => None,
        };
        LinkError::BufferOverflow { size, limit, dump }
    }
}

async fn write_dump(dir: &Path, buffered: &[u8]) -> Option<PathBuf> {
    let path = dir.join(format!(
        "stream-overflow-{}.bin",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")
    ));
    let written = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, buffered).await
    }
    .await;

    match written {
        Ok(()) => {
            tracing::warn!("Dumped {} overflowing bytes to {}", buffered.len(), path.display());
            Some(path)
        }
        Err(e) => {
            tracing::error!("Failed to dump overflowing buffer to {}: {}", path.display(), e);
            None
        }
    }
}
