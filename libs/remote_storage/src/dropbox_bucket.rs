//! Dropbox app folder working as a backup destination, driven through
//! chunked upload sessions.
//!
//! An upload is three wire phases: `upload_session/start` opens a session,
//! `upload_session/append_v2` ships one payload at an explicit byte offset,
//! `upload_session/finish` commits the session under its final path. Nothing
//! is visible remotely until the finish call, so an aborted upload leaves no
//! artifact behind.
//!
//! Incoming chunks are re-cut into payloads of [`UPLOAD_PAYLOAD_SIZE`];
//! payloads are shipped concurrently under a semaphore, with offsets
//! assigned strictly in dequeue order, so the logical byte stream stays
//! linear no matter in which order the requests complete.

use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use camino::Utf8PathBuf;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{ChunkStream, DownloadError, DropboxConfig, RemotePath};

/// Minimum payload of one `append_v2` call. Smaller accumulations are held
/// back until the stream closes.
pub(crate) const UPLOAD_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Size of one ranged `download` request.
pub(crate) const DOWNLOAD_RANGE_SIZE: u64 = 1024 * 1024;

const UPLOAD_SESSION_START_URL: &str =
    "https://content.dropboxapi.com/2/files/upload_session/start";
const UPLOAD_SESSION_APPEND_URL: &str =
    "https://content.dropboxapi.com/2/files/upload_session/append_v2";
const UPLOAD_SESSION_FINISH_URL: &str =
    "https://content.dropboxapi.com/2/files/upload_session/finish";
const GET_METADATA_URL: &str = "https://api.dropboxapi.com/2/files/get_metadata";
const DOWNLOAD_URL: &str = "https://content.dropboxapi.com/2/files/download";

/// One upload session plus retrieval, as wire calls. Factored out of the
/// scheduling so the chunk re-cutting and offset bookkeeping can be
/// exercised without a network.
pub(crate) trait SessionTransport {
    async fn start_session(&self) -> anyhow::Result<String>;
    async fn append(
        &self,
        session_id: &str,
        offset: u64,
        payload: Bytes,
        close: bool,
    ) -> anyhow::Result<()>;
    async fn finish(
        &self,
        session_id: &str,
        total_bytes: u64,
        commit_path: &str,
    ) -> anyhow::Result<()>;
    async fn content_length(&self, path: &str) -> Result<u64, DownloadError>;
    async fn download_range(
        &self,
        path: &str,
        first_byte: u64,
        last_byte: u64,
    ) -> Result<Bytes, DownloadError>;
}

pub struct DropboxBucket {
    api: DropboxApi,
    root_path: String,
    concurrency_limit: NonZeroUsize,
    temp_dir: Utf8PathBuf,
}

impl DropboxBucket {
    pub fn new(config: &DropboxConfig) -> anyhow::Result<Self> {
        let temp_dir = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .map_err(|path| anyhow::anyhow!("Temp directory {path:?} is not valid utf-8"))?;

        // dropbox paths are rooted at the app folder and must start with '/'
        let trimmed = config.root_path.trim_end_matches('/');
        let root_path = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };

        Ok(Self {
            api: DropboxApi {
                client: reqwest::Client::new(),
                access_token: config.access_token.clone(),
            },
            root_path,
            concurrency_limit: config.concurrency_limit,
            temp_dir,
        })
    }

    fn commit_path(&self, path: &RemotePath) -> String {
        format!("{}/{}", self.root_path, path)
    }

    pub(crate) async fn save(
        &self,
        chunks: ChunkStream,
        failure: &CancellationToken,
        to: &RemotePath,
    ) -> anyhow::Result<u64> {
        save_chunked(
            &self.api,
            self.concurrency_limit.get(),
            &self.commit_path(to),
            chunks,
            failure,
        )
        .await
    }

    pub(crate) async fn retrieve(
        &self,
        paths: &[RemotePath],
    ) -> Result<Vec<Utf8PathBuf>, DownloadError> {
        let mut local_paths = Vec::with_capacity(paths.len());
        for path in paths {
            local_paths.push(self.download_one(path).await?);
        }
        Ok(local_paths)
    }

    async fn download_one(&self, path: &RemotePath) -> Result<Utf8PathBuf, DownloadError> {
        let remote_path = self.commit_path(path);
        let total_bytes = self.api.content_length(&remote_path).await?;

        let object_name = path.object_name().ok_or_else(|| {
            DownloadError::Other(anyhow::anyhow!("Remote path {path} has no file name"))
        })?;
        let local_path = self.temp_dir.join(object_name);
        let mut file = fs::File::create(&local_path)
            .await
            .with_context(|| format!("Failed to create local file {local_path:?}"))
            .map_err(DownloadError::Other)?;

        let mut first_byte = 0u64;
        while first_byte < total_bytes {
            let last_byte = (first_byte + DOWNLOAD_RANGE_SIZE).min(total_bytes) - 1;
            let data = self
                .api
                .download_range(&remote_path, first_byte, last_byte)
                .await?;
            file.write_all(&data)
                .await
                .with_context(|| format!("Failed to write to local file {local_path:?}"))
                .map_err(DownloadError::Other)?;
            first_byte = last_byte + 1;
        }
        file.flush().await.map_err(|e| DownloadError::Other(e.into()))?;

        tracing::debug!("Retrieved {remote_path} ({total_bytes} bytes) into {local_path}");
        Ok(local_path)
    }

    pub(crate) async fn delete_retrievals(&self, local_paths: &[Utf8PathBuf]) -> anyhow::Result<()> {
        for path in local_paths {
            fs::remove_file(path)
                .await
                .with_context(|| format!("Failed to remove retrieved file {path:?}"))?;
        }
        Ok(())
    }
}

/// Consumes the chunk channel into one upload session against `transport`.
///
/// Offsets are assigned when a payload is cut off the accumulation buffer,
/// before its request is dispatched, which makes them monotone in dequeue
/// order. Once `failure` fires the channel is still drained (the producer
/// may be blocked on it) but no further payload goes on the wire and the
/// session is never finished.
pub(crate) async fn save_chunked<T: SessionTransport>(
    transport: &T,
    concurrency_limit: usize,
    commit_path: &str,
    mut chunks: ChunkStream,
    failure: &CancellationToken,
) -> anyhow::Result<u64> {
    let session_id = transport
        .start_session()
        .await
        .context("start upload session")?;

    let dispatch_gate = Arc::new(Semaphore::new(concurrency_limit));
    let mut in_flight = FuturesUnordered::new();
    let mut buffer = BytesMut::new();
    let mut offset = 0u64;
    let mut bytes_received = 0u64;
    let mut first_error: Option<anyhow::Error> = None;
    let mut aborted = failure.is_cancelled();

    loop {
        tokio::select! {
            chunk = chunks.recv() => match chunk {
                Some(chunk) => {
                    bytes_received += chunk.len() as u64;
                    if aborted {
                        continue;
                    }
                    buffer.extend_from_slice(&chunk);
                    while buffer.len() >= UPLOAD_PAYLOAD_SIZE {
                        let payload = buffer.split_to(UPLOAD_PAYLOAD_SIZE).freeze();
                        in_flight.push(append_one(
                            transport,
                            Arc::clone(&dispatch_gate),
                            failure,
                            &session_id,
                            offset,
                            payload,
                            false,
                        ));
                        offset += UPLOAD_PAYLOAD_SIZE as u64;
                    }
                }
                None => break,
            },
            Some(append_result) = in_flight.next(), if !in_flight.is_empty() => {
                if let Err(e) = append_result {
                    failure.cancel();
                    aborted = true;
                    first_error.get_or_insert(e);
                }
            },
            _ = failure.cancelled(), if !aborted => {
                aborted = true;
            }
        }
    }

    // the failure may have fired while the loop was busy draining queued
    // chunks; the select above is unbiased and need not have seen it
    if failure.is_cancelled() {
        aborted = true;
    }

    if !aborted && (!buffer.is_empty() || offset == 0) {
        // tail below the minimum payload size; a stream smaller than one
        // payload commits as this single append
        let payload = buffer.split_to(buffer.len()).freeze();
        let payload_len = payload.len() as u64;
        in_flight.push(append_one(
            transport,
            Arc::clone(&dispatch_gate),
            failure,
            &session_id,
            offset,
            payload,
            true,
        ));
        offset += payload_len;
    }

    // settle every dispatched append before deciding the outcome
    while let Some(append_result) = in_flight.next().await {
        if let Err(e) = append_result {
            failure.cancel();
            aborted = true;
            first_error.get_or_insert(e);
        }
    }

    // never commit a session once the failure signal fired, no matter
    // which side of the select observed it
    if aborted || failure.is_cancelled() {
        return Err(first_error
            .unwrap_or_else(|| anyhow::anyhow!("Upload of '{commit_path}' aborted on peer failure")));
    }

    transport
        .finish(&session_id, offset, commit_path)
        .await
        .context("finish upload session")?;
    Ok(bytes_received)
}

async fn append_one<T: SessionTransport>(
    transport: &T,
    dispatch_gate: Arc<Semaphore>,
    failure: &CancellationToken,
    session_id: &str,
    offset: u64,
    payload: Bytes,
    close: bool,
) -> anyhow::Result<()> {
    let _permit = dispatch_gate
        .acquire_owned()
        .await
        .expect("semaphore is never closed");
    if failure.is_cancelled() {
        // peer already failed, keep the payload off the wire
        return Ok(());
    }
    transport.append(session_id, offset, payload, close).await
}

pub(crate) struct DropboxApi {
    client: reqwest::Client,
    access_token: String,
}

#[derive(serde::Deserialize)]
struct UploadSessionStartResponse {
    session_id: String,
}

#[derive(serde::Deserialize)]
struct FileMetadataResponse {
    size: u64,
}

impl DropboxApi {
    /// POST against a content endpoint: arguments ride in the
    /// `Dropbox-API-Arg` header, the body is the raw payload.
    async fn content_request(
        &self,
        url: &str,
        api_arg: serde_json::Value,
        body: Bytes,
    ) -> anyhow::Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .header("Dropbox-API-Arg", api_arg.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {url}"))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let details = response.text().await.unwrap_or_default();
            anyhow::bail!("{url} returned {status}: {details}")
        }
    }
}

impl SessionTransport for DropboxApi {
    async fn start_session(&self) -> anyhow::Result<String> {
        let response = self
            .content_request(
                UPLOAD_SESSION_START_URL,
                serde_json::json!({ "close": false, "session_type": "concurrent" }),
                Bytes::new(),
            )
            .await?;
        let start: UploadSessionStartResponse = response
            .json()
            .await
            .context("decode upload_session/start response")?;
        Ok(start.session_id)
    }

    async fn append(
        &self,
        session_id: &str,
        offset: u64,
        payload: Bytes,
        close: bool,
    ) -> anyhow::Result<()> {
        self.content_request(
            UPLOAD_SESSION_APPEND_URL,
            serde_json::json!({
                "cursor": { "session_id": session_id, "offset": offset },
                "close": close,
            }),
            payload,
        )
        .await?;
        Ok(())
    }

    async fn finish(
        &self,
        session_id: &str,
        total_bytes: u64,
        commit_path: &str,
    ) -> anyhow::Result<()> {
        self.content_request(
            UPLOAD_SESSION_FINISH_URL,
            serde_json::json!({
                "cursor": { "session_id": session_id, "offset": total_bytes },
                "commit": {
                    "path": commit_path,
                    // segments are re-uploaded under the same artifact name
                    // as the server appends to them
                    "mode": "overwrite",
                    "autorename": false,
                    "mute": false,
                    "strict_conflict": false,
                },
            }),
            Bytes::new(),
        )
        .await?;
        Ok(())
    }

    async fn content_length(&self, path: &str) -> Result<u64, DownloadError> {
        let response = self
            .client
            .post(GET_METADATA_URL)
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "path": path }))
            .send()
            .await
            .with_context(|| format!("Failed to request metadata of {path}"))
            .map_err(DownloadError::Other)?;

        let status = response.status();
        if status.is_success() {
            let metadata: FileMetadataResponse = response
                .json()
                .await
                .context("decode get_metadata response")
                .map_err(DownloadError::Other)?;
            Ok(metadata.size)
        } else if status == reqwest::StatusCode::CONFLICT {
            // dropbox reports an unknown path as a 409 conflict
            Err(DownloadError::NotFound)
        } else {
            let details = response.text().await.unwrap_or_default();
            Err(DownloadError::Other(anyhow::anyhow!(
                "get_metadata of {path} returned {status}: {details}"
            )))
        }
    }

    async fn download_range(
        &self,
        path: &str,
        first_byte: u64,
        last_byte: u64,
    ) -> Result<Bytes, DownloadError> {
        let api_arg = serde_json::json!({ "path": path });
        let response = self
            .client
            .post(DOWNLOAD_URL)
            .bearer_auth(&self.access_token)
            .header("Dropbox-API-Arg", api_arg.to_string())
            .header(
                reqwest::header::RANGE,
                format!("bytes={first_byte}-{last_byte}"),
            )
            .send()
            .await
            .with_context(|| format!("Failed to download a range of {path}"))
            .map_err(DownloadError::Other)?;

        let status = response.status();
        if status.is_success() {
            response
                .bytes()
                .await
                .context("read download response body")
                .map_err(DownloadError::Other)
        } else if status == reqwest::StatusCode::CONFLICT {
            Err(DownloadError::NotFound)
        } else {
            let details = response.text().await.unwrap_or_default();
            Err(DownloadError::Other(anyhow::anyhow!(
                "download of {path} returned {status}: {details}"
            )))
        }
    }
}
