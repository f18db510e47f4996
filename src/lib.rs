//! HTTP file transfer: an upload/download server backed by a local directory
//! and a client for driving it.
//!
//! The server exposes `POST /upload` (multipart, part `file`) and
//! `GET /download/{filename}`. Uploaded names are sanitized so every stored
//! file lives directly inside the storage directory.

pub mod atomic;
pub mod client;
pub mod config;
pub mod error;
pub mod etag;
pub mod files;
pub mod http;
pub mod logging;
pub mod server;
pub mod storage;

use shadow_rs::shadow;

shadow!(build);
