//! Client side of the transfer protocol.
//!
//! Every operation returns a [`TransferResult`]; transport and filesystem
//! failures are folded into it instead of being returned as errors.

use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use crate::config::DOWNLOAD_CHUNK_SIZE;
use crate::files::UPLOAD_FIELD;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Why a transfer did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferErrorKind {
    NotFound,
    BadRequest,
    NetworkError,
    ServerError,
    SizeLimitExceeded,
    DownloadFailed,
    LocalIo,
}

impl TransferErrorKind {
    fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::BAD_REQUEST => TransferErrorKind::BadRequest,
            StatusCode::NOT_FOUND => TransferErrorKind::NotFound,
            StatusCode::PAYLOAD_TOO_LARGE => TransferErrorKind::SizeLimitExceeded,
            _ => TransferErrorKind::ServerError,
        }
    }
}

/// Outcome of a single upload or download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferResult {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TransferErrorKind>,
    /// Name the server stored an upload under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Where a download was written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl TransferResult {
    fn success(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            error: None,
            filename: None,
            path: None,
        }
    }

    fn failure(kind: TransferErrorKind, status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            error: Some(kind),
            filename: None,
            path: None,
        }
    }

    fn network(err: &reqwest::Error) -> Self {
        Self::failure(
            TransferErrorKind::NetworkError,
            StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            err.to_string(),
        )
    }

    fn local_io(err: &io::Error) -> Self {
        Self::failure(
            TransferErrorKind::LocalIo,
            StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            err.to_string(),
        )
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// JSON body the server answers with.
#[derive(Debug, Default, Deserialize)]
struct ServerReply {
    message: Option<String>,
    error: Option<String>,
    filename: Option<String>,
}

impl ServerReply {
    fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or_default()
    }
}

enum CopyError {
    Network(reqwest::Error),
    Io(io::Error),
}

/// Uploads and downloads files against one server.
#[derive(Clone, Debug)]
pub struct TransferClient {
    base_url: String,
    http: Client,
}

impl TransferClient {
    pub fn new(base_url: impl Into<String>) -> reqwest::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends `local_path` to `POST {base_url}/upload`.
    ///
    /// A missing local file is reported without touching the network.
    pub async fn upload(&self, local_path: &Path) -> TransferResult {
        let metadata = match fs::metadata(local_path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                error!(path = %local_path.display(), "upload failed: file not found");
                return TransferResult::failure(
                    TransferErrorKind::NotFound,
                    StatusCode::NOT_FOUND.as_u16(),
                    "File not found",
                );
            }
        };
        let file_name = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let file = match File::open(local_path).await {
            Ok(file) => file,
            Err(err) => {
                error!(path = %local_path.display(), error = %err, "upload failed: cannot open file");
                return TransferResult::local_io(&err);
            }
        };
        let part = Part::stream_with_length(
            Body::wrap_stream(ReaderStream::new(file)),
            metadata.len(),
        )
        .file_name(file_name);
        let form = Form::new().part(UPLOAD_FIELD, part);

        let url = format!("{}/upload", self.base_url);
        debug!(url, path = %local_path.display(), size = metadata.len(), "uploading");
        let response = match self.http.post(&url).multipart(form).send().await {
            Ok(response) => response,
            Err(err) => {
                error!(path = %local_path.display(), error = %err, "network error during upload");
                return TransferResult::network(&err);
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                error!(path = %local_path.display(), error = %err, "network error during upload");
                return TransferResult::network(&err);
            }
        };
        let reply = ServerReply::parse(&body);

        if status.is_success() {
            info!(path = %local_path.display(), filename = ?reply.filename, "upload succeeded");
            let mut result = TransferResult::success(
                status.as_u16(),
                reply.message.unwrap_or_else(|| "Unknown response".into()),
            );
            result.filename = reply.filename;
            return result;
        }

        let message = reply
            .error
            .or(reply.message)
            .unwrap_or_else(|| non_empty_or(body.trim(), "Unknown response"));
        error!(
            path = %local_path.display(),
            status = status.as_u16(),
            error = message,
            "upload failed"
        );
        TransferResult::failure(TransferErrorKind::from_status(status), status.as_u16(), message)
    }

    /// Fetches `GET {base_url}/download/{remote_name}` into `save_path`, or
    /// into `./<remote_name>` when no path is given.
    ///
    /// Nothing is written unless the server answers with success, and a
    /// partially written file is removed if the transfer breaks off.
    pub async fn download(&self, remote_name: &str, save_path: Option<&Path>) -> TransferResult {
        let save_path = match save_path {
            Some(path) => path.to_path_buf(),
            None => match default_save_path(remote_name) {
                Ok(path) => path,
                Err(result) => {
                    error!(filename = remote_name, "download failed: invalid name");
                    return result;
                }
            },
        };

        let url = format!(
            "{}/download/{}",
            self.base_url,
            urlencoding::encode(remote_name)
        );
        debug!(url, "downloading");
        let mut response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                error!(filename = remote_name, error = %err, "network error during download");
                return TransferResult::network(&err);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = ServerReply::parse(&body)
                .error
                .unwrap_or_else(|| non_empty_or(body.trim(), status.as_str()));
            error!(
                filename = remote_name,
                status = status.as_u16(),
                error = detail,
                "download failed"
            );
            return TransferResult::failure(
                TransferErrorKind::DownloadFailed,
                status.as_u16(),
                format!("Download failed: {detail}"),
            );
        }

        let file = match File::create(&save_path).await {
            Ok(file) => file,
            Err(err) => {
                error!(path = %save_path.display(), error = %err, "download failed: cannot create file");
                return TransferResult::local_io(&err);
            }
        };
        let mut writer = BufWriter::with_capacity(DOWNLOAD_CHUNK_SIZE, file);
        let copy_result: Result<u64, CopyError> = async {
            let mut total_written: u64 = 0;
            while let Some(chunk) = response.chunk().await.map_err(CopyError::Network)? {
                writer.write_all(&chunk).await.map_err(CopyError::Io)?;
                total_written += chunk.len() as u64;
            }
            writer.flush().await.map_err(CopyError::Io)?;
            Ok(total_written)
        }
        .await;
        drop(writer);

        match copy_result {
            Ok(total_written) => {
                info!(
                    filename = remote_name,
                    path = %save_path.display(),
                    bytes = total_written,
                    "download succeeded"
                );
                let mut result =
                    TransferResult::success(StatusCode::OK.as_u16(), "File downloaded successfully");
                result.path = Some(save_path);
                result
            }
            Err(err) => {
                let _ = fs::remove_file(&save_path).await;
                match err {
                    CopyError::Network(err) => {
                        error!(filename = remote_name, error = %err, "network error during download");
                        TransferResult::network(&err)
                    }
                    CopyError::Io(err) => {
                        error!(path = %save_path.display(), error = %err, "download failed: write error");
                        TransferResult::local_io(&err)
                    }
                }
            }
        }
    }
}

fn default_save_path(remote_name: &str) -> Result<PathBuf, TransferResult> {
    let invalid = || {
        TransferResult::failure(
            TransferErrorKind::BadRequest,
            StatusCode::BAD_REQUEST.as_u16(),
            "Invalid file name",
        )
    };
    let name = Path::new(remote_name).file_name().ok_or_else(invalid)?;
    let cwd = std::env::current_dir().map_err(|err| TransferResult::local_io(&err))?;
    Ok(cwd.join(name))
}

fn non_empty_or(text: &str, fallback: &str) -> String {
    if text.is_empty() {
        fallback.to_string()
    } else {
        text.to_string()
    }
}
