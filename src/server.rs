//! Router assembly and the listening loop for the transfer server.

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::config::{DEFAULT_MAX_CONTENT_LENGTH, DEFAULT_STORAGE_DIR, ServerArgs};
use crate::files;
use crate::http::{add_security_headers, resolve_client_ip};
use crate::storage::Storage;

/// Settings fixed when the server is constructed.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub storage_dir: PathBuf,
    /// Hard cap on request bodies, enforced before any handler runs.
    pub max_content_length: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            storage_dir: args.storage_dir.clone(),
            max_content_length: args.max_content_length,
        }
    }
}

pub struct TransferServer {
    config: ServerConfig,
    storage: Arc<Storage>,
}

impl TransferServer {
    /// Creates the storage directory if needed.
    pub async fn new(config: ServerConfig) -> io::Result<Self> {
        let storage = Arc::new(Storage::new(config.storage_dir.clone()));
        storage.ensure_root().await?;
        Ok(Self { config, storage })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn router(&self) -> Router {
        build_router(self.storage.clone(), &self.config)
    }

    /// Serves until `handle` is shut down.
    pub async fn serve(&self, addr: SocketAddr, handle: Handle) -> io::Result<()> {
        info!(
            %addr,
            storage_dir = %self.config.storage_dir.display(),
            max_content_length = self.config.max_content_length,
            "starting transfer server"
        );
        axum_server::bind(addr)
            .handle(handle)
            .serve(
                self.router()
                    .into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
    }

    /// Serves until `shutdown` resolves, then stops accepting connections and
    /// gives in-flight requests up to `grace` to finish.
    pub async fn serve_with_shutdown<F>(
        &self,
        addr: SocketAddr,
        handle: Handle,
        shutdown: F,
        grace: Duration,
    ) -> io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let drain = handle.clone();
        tokio::spawn(async move {
            shutdown.await;
            info!(grace_secs = grace.as_secs(), "draining in-flight requests");
            drain.graceful_shutdown(Some(grace));
        });
        self.serve(addr, handle).await
    }
}

pub fn build_router(storage: Arc<Storage>, config: &ServerConfig) -> Router {
    let body_limit = usize::try_from(config.max_content_length).unwrap_or(usize::MAX);

    Router::new()
        .route("/upload", post(files::upload_file))
        .route("/download/{filename}", get(files::download_file))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{StatusCode, header};
    use axum::response::Response;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tempfile::tempdir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "XFERBOUNDARY";

    async fn make_server(max_content_length: u64) -> (tempfile::TempDir, TransferServer) {
        let temp = tempdir().expect("tempdir");
        let config = ServerConfig {
            storage_dir: temp.path().join("received_files"),
            max_content_length,
        };
        let server = TransferServer::new(config).await.expect("server");
        (temp, server)
    }

    fn multipart_body(field: &str, filename: Option<&str>, contents: &[u8]) -> Vec<u8> {
        let disposition = match filename {
            Some(name) => format!("form-data; name=\"{field}\"; filename=\"{name}\""),
            None => format!("form-data; name=\"{field}\""),
        };
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: {disposition}\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(contents);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> Request<Body> {
        Request::post("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .expect("request")
    }

    fn download_request(name: &str) -> Request<Body> {
        Request::get(format!("/download/{name}"))
            .body(Body::empty())
            .expect("request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn upload_then_download_report() {
        let (_temp, server) = make_server(DEFAULT_MAX_CONTENT_LENGTH).await;
        let router = server.router();

        let response = router
            .clone()
            .oneshot(upload_request(multipart_body("file", Some("report.txt"), b"hello")))
            .await
            .expect("upload");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::X_CONTENT_TYPE_OPTIONS).unwrap(),
            "nosniff"
        );
        let json = json_body(response).await;
        assert_eq!(json["message"], "File uploaded successfully");
        assert_eq!(json["filename"], "report.txt");

        let response = router
            .oneshot(download_request("report.txt"))
            .await
            .expect("download");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"report.txt\""
        );
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn upload_overwrites_existing_file() {
        let (_temp, server) = make_server(DEFAULT_MAX_CONTENT_LENGTH).await;
        let router = server.router();
        for contents in [&b"first version"[..], &b"second"[..]] {
            let response = router
                .clone()
                .oneshot(upload_request(multipart_body("file", Some("notes.md"), contents)))
                .await
                .expect("upload");
            assert_eq!(response.status(), StatusCode::OK);
        }
        let stored = std::fs::read(server.storage().root_path().join("notes.md")).expect("read");
        assert_eq!(stored, b"second");
    }

    #[tokio::test]
    async fn traversal_filename_is_stored_inside_root() {
        let (temp, server) = make_server(DEFAULT_MAX_CONTENT_LENGTH).await;
        let router = server.router();

        let response = router
            .clone()
            .oneshot(upload_request(multipart_body(
                "file",
                Some("../../etc/passwd"),
                b"root:x:0:0",
            )))
            .await
            .expect("upload");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["filename"], "etc_passwd");

        let root = server.storage().root_path();
        let stored = root.join("etc_passwd").canonicalize().expect("stored file");
        assert!(stored.starts_with(root.canonicalize().expect("root")));
        assert!(!temp.path().join("etc").exists());

        let response = router
            .oneshot(download_request("..%2F..%2Fetc%2Fpasswd"))
            .await
            .expect("download");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_without_file_part_is_bad_request() {
        let (_temp, server) = make_server(DEFAULT_MAX_CONTENT_LENGTH).await;

        let response = server
            .router()
            .oneshot(upload_request(multipart_body("document", Some("a.txt"), b"x")))
            .await
            .expect("upload");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "No file part");

        let response = server
            .router()
            .oneshot(upload_request(multipart_body("file", None, b"plain value")))
            .await
            .expect("upload");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "No file part");
    }

    #[tokio::test]
    async fn upload_with_empty_filename_is_bad_request() {
        let (_temp, server) = make_server(DEFAULT_MAX_CONTENT_LENGTH).await;
        let response = server
            .router()
            .oneshot(upload_request(multipart_body("file", Some(""), b"x")))
            .await
            .expect("upload");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "No selected file");
    }

    #[tokio::test]
    async fn upload_with_unusable_filename_is_bad_request() {
        let (_temp, server) = make_server(DEFAULT_MAX_CONTENT_LENGTH).await;
        let response = server
            .router()
            .oneshot(upload_request(multipart_body("file", Some(".."), b"x")))
            .await
            .expect("upload");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "Invalid filename");
    }

    #[tokio::test]
    async fn non_multipart_upload_is_bad_request() {
        let (_temp, server) = make_server(DEFAULT_MAX_CONTENT_LENGTH).await;
        let request = Request::post("/upload")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .expect("request");
        let response = server.router().oneshot(request).await.expect("upload");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "No file part");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_handler() {
        let (_temp, server) = make_server(1024).await;
        let body = multipart_body("file", Some("big.bin"), &vec![b'a'; 4096]);

        let response = server
            .router()
            .oneshot(upload_request(body))
            .await
            .expect("upload");
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let entries = std::fs::read_dir(server.storage().root_path())
            .expect("read dir")
            .count();
        assert_eq!(entries, 0);
    }

    #[tokio::test]
    async fn cancelled_upload_leaves_no_temp_file() {
        use std::time::Duration;
        use tokio::io::AsyncWriteExt;
        use tokio_util::io::ReaderStream;

        let (_temp, server) = make_server(DEFAULT_MAX_CONTENT_LENGTH).await;
        let (mut sender, receiver) = tokio::io::duplex(64 * 1024);
        let head = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"report.txt\"\r\nContent-Type: text/plain\r\n\r\nfirst half of the report"
        );
        sender.write_all(head.as_bytes()).await.expect("write head");

        // The body never ends while `sender` is alive.
        let request = Request::post("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from_stream(ReaderStream::new(receiver)))
            .expect("request");
        let outcome =
            tokio::time::timeout(Duration::from_millis(300), server.router().oneshot(request)).await;
        assert!(outcome.is_err(), "upload should still be waiting for the body");
        drop(sender);

        let entries: Vec<_> = std::fs::read_dir(server.storage().root_path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert!(entries.is_empty(), "left behind: {entries:?}");
    }

    #[tokio::test]
    async fn download_missing_file_returns_json_404() {
        let (_temp, server) = make_server(DEFAULT_MAX_CONTENT_LENGTH).await;
        let response = server
            .router()
            .oneshot(download_request("missing.txt"))
            .await
            .expect("download");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "File not found");
    }

    #[tokio::test]
    async fn download_rejects_wrong_method() {
        let (_temp, server) = make_server(DEFAULT_MAX_CONTENT_LENGTH).await;
        let request = Request::post("/download/report.txt")
            .body(Body::empty())
            .expect("request");
        let response = server.router().oneshot(request).await.expect("download");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
