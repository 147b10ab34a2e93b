//! s3cs library: S3-compatible storage core for gated digital downloads.
//!
//! This crate signs requests with AWS Signature Version 4, lists buckets
//! and folder-style object prefixes, streams validated uploads, and hands
//! out short-lived presigned download URLs in place of stored file
//! references.

pub mod auth;
pub mod client;
pub mod config;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod presign;
pub mod types;
pub mod upload;
pub mod xml;

pub use client::ObjectStoreClient;
pub use config::{ConfigResolver, ConnectionConfig, Settings, SettingsFile, SettingsSource};
pub use errors::StorageError;
pub use presign::{DownloadGate, PresignedUrlGenerator};
pub use types::{StorageObject, UploadResult};
