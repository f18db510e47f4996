//! 上传与下载处理器。

use axum::body::Body as AxumBody;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{Extension, Multipart, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use serde::Serialize;
use std::fs::Metadata;
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use crate::atomic::AtomicFile;
use crate::error::ApiError;
use crate::etag::{etag_from_metadata, if_range_matches, is_not_modified};
use crate::http::attachment_disposition;
use crate::storage::{Storage, StorageError, sanitize_filename};

pub const UPLOAD_FIELD: &str = "file";
pub const UPLOAD_SUCCESS_MESSAGE: &str = "File uploaded successfully";

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct UploadResponse {
    pub message: String,
    pub filename: String,
}

/// 接收 multipart 上传，按清洗后的文件名写入存储目录。
pub async fn upload_file(
    Extension(storage): Extension<Arc<Storage>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<JsonResponse<UploadResponse>, ApiError> {
    let result = match multipart {
        Ok(multipart) => store_upload(&storage, multipart).await,
        Err(rejection) => {
            debug!(%rejection, "request is not multipart");
            Err(ApiError::BadRequest("No file part".into()))
        }
    };

    match &result {
        Ok(stored) => info!(filename = stored.filename, "file uploaded"),
        Err(err) => error!(status = err.status().as_u16(), error = %err, "upload failed"),
    }
    result.map(JsonResponse)
}

async fn store_upload(
    storage: &Storage,
    mut multipart: Multipart,
) -> Result<UploadResponse, ApiError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        // A `file` part without a filename is a plain form value.
        let Some(submitted) = field.file_name().map(str::to_owned) else {
            continue;
        };
        if submitted.is_empty() {
            return Err(ApiError::BadRequest("No selected file".into()));
        }

        let filename = sanitize_filename(&submitted);
        if filename.is_empty() {
            return Err(ApiError::BadRequest("Invalid filename".into()));
        }
        let target = storage.resolve_file(&filename).await?;
        debug!(submitted, filename, "receiving upload");

        let mut atomic = AtomicFile::create(&target)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let write_result: Result<u64, ApiError> = async {
            let mut total_written: u64 = 0;
            while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                if chunk.is_empty() {
                    continue;
                }
                atomic
                    .write_chunk(&chunk)
                    .await
                    .map_err(|err| ApiError::Internal(err.to_string()))?;
                total_written += chunk.len() as u64;
            }
            Ok(total_written)
        }
        .await;
        let total_written = match write_result {
            Ok(value) => value,
            Err(err) => {
                atomic.discard().await;
                return Err(err);
            }
        };
        atomic
            .commit()
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        debug!(filename, bytes = total_written, "upload stored");

        return Ok(UploadResponse {
            message: UPLOAD_SUCCESS_MESSAGE.into(),
            filename,
        });
    }

    Err(ApiError::BadRequest("No file part".into()))
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(err.body_text())
    } else {
        ApiError::BadRequest(err.body_text())
    }
}

/// 以附件形式下载文件，支持条件 GET 与单段 Range。
pub async fn download_file(
    Path(filename): Path<String>,
    request_headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let Some((target, metadata)) = locate_file(&storage, &filename).await? else {
        error!(filename, "download failed: file not found");
        return Err(ApiError::NotFound("File not found".into()));
    };

    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let etag = etag_from_metadata(&metadata);

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ETAG, header_value(&etag)?);
    if let Some(modified) = modified {
        response_headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }

    if is_not_modified(&request_headers, &etag, modified) {
        debug!(filename, "download not modified");
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    let mime = mime_guess::from_path(&filename).first_or_octet_stream();
    response_headers.insert(header::CONTENT_TYPE, header_value(mime.essence_str())?);
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&attachment_disposition(&filename))?,
    );

    let range = match request_headers.get(header::RANGE) {
        Some(value) if if_range_matches(&request_headers, &etag, modified) => {
            parse_range(value, file_size).inspect_err(|err| {
                error!(
                    filename,
                    size = file_size,
                    error = %err,
                    "download failed: range not satisfiable"
                );
            })?
        }
        _ => None,
    };

    let mut file = File::open(&target).await.map_err(|err| match err.kind() {
        ErrorKind::NotFound => ApiError::NotFound("File not found".into()),
        _ => ApiError::Internal(err.to_string()),
    })?;

    if let Some(range) = range {
        info!(filename, start = range.start, end = range.end, "file range downloaded");
        file.seek(SeekFrom::Start(range.start))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        response_headers.insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes {}-{}/{}", range.start, range.end, file_size))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, header_value(&range.len().to_string())?);
        let stream = ReaderStream::new(file.take(range.len()));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, header_value(&file_size.to_string())?);
    info!(filename, size = file_size, "file downloaded");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Finds a regular stored file by name. Unsanitized names, symlinks and
/// directories all count as missing.
async fn locate_file(
    storage: &Storage,
    filename: &str,
) -> Result<Option<(PathBuf, Metadata)>, ApiError> {
    let target = match storage.resolve_file(filename).await {
        Ok(target) => target,
        Err(StorageError::InvalidPath) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    match fs::metadata(&target).await {
        Ok(metadata) if metadata.is_file() => Ok(Some((target, metadata))),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ApiError::Internal(err.to_string())),
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value)
        .map_err(|_| ApiError::Internal("Failed to build response header".into()))
}

/// Inclusive byte range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// 解析单段 Range 头。语法无效或多段请求时忽略（返回 None），
/// 范围越界时返回 416。
fn parse_range(value: &HeaderValue, file_size: u64) -> Result<Option<ByteRange>, ApiError> {
    let Some(ranges) = value
        .to_str()
        .ok()
        .and_then(|value| value.trim().strip_prefix("bytes="))
    else {
        return Ok(None);
    };
    if ranges.contains(',') {
        return Ok(None);
    }
    let Some((first, last)) = ranges.split_once('-') else {
        return Ok(None);
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        let Ok(suffix) = last.parse::<u64>() else {
            return Ok(None);
        };
        if suffix == 0 || file_size == 0 {
            return Err(ApiError::RangeNotSatisfiable(file_size));
        }
        return Ok(Some(ByteRange {
            start: file_size.saturating_sub(suffix),
            end: file_size - 1,
        }));
    }

    let Ok(start) = first.parse::<u64>() else {
        return Ok(None);
    };
    let end = if last.is_empty() {
        None
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return Ok(None),
        }
    };
    if start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let last_byte = file_size - 1;
    Ok(Some(ByteRange {
        start,
        end: end.map_or(last_byte, |end| end.min(last_byte)),
    }))
}
