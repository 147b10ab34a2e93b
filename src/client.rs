//! Object store client.
//!
//! Issues SigV4-signed REST calls against an S3-compatible endpoint:
//! bucket enumeration, delimiter listings that emulate folders, and
//! streaming PUT uploads.  Connection settings are resolved afresh for
//! every call.
//!
//! Listing calls never fail outward.  Any error degrades to an empty
//! result and a single entry in the debug log.  Uploads report errors to
//! the caller.

use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::StatusCode;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::auth::{
    build_canonical_query_string, object_uri, s3_uri_encode, RequestToSign, Signer, SigningTime,
    EMPTY_SHA256,
};
use crate::config::{
    Config, ConfigResolver, ConnectionConfig, ConnectionSource, HttpConfig, SettingsSource,
};
use crate::errors::StorageError;
use crate::logging::{DebugLog, TracingDebugLog};
use crate::metrics::{
    outcome_label, record_upload_bytes, OperationTimer, OP_LIST_BUCKETS, OP_LIST_OBJECTS,
    OP_UPLOAD,
};
use crate::types::{base_name, entries_from_page, StorageObject, UploadResult};
use crate::upload::{read_head, sha256_file, UploadPolicy, CHUNK_SIZE};
use crate::xml::{parse_bucket_list, parse_list_objects};

/// Longest response excerpt copied into a debug-log entry.
const BODY_EXCERPT_LEN: usize = 512;

/// An absolute request URL plus the pieces SigV4 signs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestTarget {
    pub url: String,
    /// `host[:port]`, port only when not the scheme default.
    pub host: String,
    /// Endpoint base path followed by the request path.
    pub canonical_uri: String,
}

impl RequestTarget {
    /// Path-style target: `endpoint + path [+ '?' + query]`.
    pub(crate) fn new(
        config: &ConnectionConfig,
        path: &str,
        canonical_query: &str,
    ) -> Result<Self, StorageError> {
        let endpoint = config.endpoint_url()?;
        let host_name = endpoint.host_str().ok_or_else(|| {
            StorageError::NotConfigured("endpoint has no host".to_string())
        })?;
        let host = match endpoint.port() {
            Some(port) => format!("{host_name}:{port}"),
            None => host_name.to_string(),
        };
        let canonical_uri = format!("{}{}", endpoint.path().trim_end_matches('/'), path);

        let mut url = format!("{}://{}{}", endpoint.scheme(), host, canonical_uri);
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(canonical_query);
        }
        Ok(Self {
            url,
            host,
            canonical_uri,
        })
    }
}

/// S3-compatible object store client.
pub struct ObjectStoreClient {
    http: reqwest::Client,
    connection: ConnectionSource,
    log: Arc<dyn DebugLog>,
    policy: UploadPolicy,
    upload_timeout: Duration,
}

impl ObjectStoreClient {
    /// Client that re-resolves settings through `resolver` on every call.
    /// Diagnostics go to the resolver's debug log.
    pub fn new(
        resolver: ConfigResolver,
        http: &HttpConfig,
        policy: UploadPolicy,
    ) -> Result<Self, StorageError> {
        let log = resolver.debug_log().clone();
        Self::build(resolver.into(), http, policy, log)
    }

    /// Client wired from a loaded configuration file.
    pub fn from_config(
        config: &Config,
        source: Arc<dyn SettingsSource>,
    ) -> Result<Self, StorageError> {
        let resolver = ConfigResolver::new(source)
            .with_debug_log(Arc::new(TracingDebugLog::new(config.debug)));
        Self::new(
            resolver,
            &config.http,
            UploadPolicy::from_config(&config.upload),
        )
    }

    /// Client bound to an already-resolved connection.
    pub fn with_connection(
        connection: ConnectionConfig,
        http: &HttpConfig,
        policy: UploadPolicy,
        log: Arc<dyn DebugLog>,
    ) -> Result<Self, StorageError> {
        Self::build(connection.into(), http, policy, log)
    }

    fn build(
        connection: ConnectionSource,
        http: &HttpConfig,
        policy: UploadPolicy,
        log: Arc<dyn DebugLog>,
    ) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(http.connect_timeout_secs))
            .timeout(Duration::from_secs(http.request_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(http.max_redirects))
            .user_agent(concat!("s3cs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StorageError::Connection(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http: client,
            connection,
            log,
            policy,
            upload_timeout: Duration::from_secs(http.upload_timeout_secs),
        })
    }

    /// Current connection parameters.
    pub fn connection(&self) -> ConnectionConfig {
        self.connection.current()
    }

    pub fn debug_log(&self) -> &Arc<dyn DebugLog> {
        &self.log
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Credentials, endpoint and bucket are all set.
    pub fn is_configured(&self) -> bool {
        self.connection().is_configured()
    }

    /// Credentials and endpoint are set; buckets can be listed.
    pub fn is_configured_for_listing(&self) -> bool {
        self.connection().is_configured_for_listing()
    }

    // -- Listing ----------------------------------------------------------------

    /// Names of all buckets visible to the credentials, or empty on error.
    pub async fn list_buckets(&self) -> Vec<String> {
        let timer = OperationTimer::start(OP_LIST_BUCKETS);
        let result = self.try_list_buckets().await;
        timer.finish(outcome_label(&result));

        match result {
            Ok(names) => {
                debug!(count = names.len(), "listed buckets");
                names
            }
            Err(e) => {
                warn!(code = e.code(), "bucket listing failed");
                self.log.record(&format!("Bucket listing failed: {e}"));
                Vec::new()
            }
        }
    }

    async fn try_list_buckets(&self) -> Result<Vec<String>, StorageError> {
        let config = self.connection();
        config.require_listing()?;

        let (status, body) = self.get_with_fallback(&config, "/", &[]).await?;
        check_listing_status(status, &body)?;
        parse_bucket_list(&body).map_err(|e| with_excerpt(e, &body))
    }

    /// Folder-style listing under `prefix`, or empty on error.
    ///
    /// The prefix loses any leading `/` and gains a trailing one, so `docs`
    /// and `/docs/` list the same folder.
    pub async fn list_objects(&self, prefix: &str) -> Vec<StorageObject> {
        let timer = OperationTimer::start(OP_LIST_OBJECTS);
        let prefix = normalize_prefix(prefix);
        let result = self.try_list_objects(&prefix).await;
        timer.finish(outcome_label(&result));

        match result {
            Ok(entries) => {
                debug!(prefix = %prefix, count = entries.len(), "listed objects");
                entries
            }
            Err(e) => {
                warn!(prefix = %prefix, code = e.code(), "object listing failed");
                self.log.record(&format!("Error listing S3 files: {e}"));
                Vec::new()
            }
        }
    }

    async fn try_list_objects(&self, prefix: &str) -> Result<Vec<StorageObject>, StorageError> {
        let config = self.connection();
        config.require_full()?;

        let mut query = vec![
            ("list-type".to_string(), "2".to_string()),
            ("delimiter".to_string(), "/".to_string()),
        ];
        if !prefix.is_empty() {
            query.push(("prefix".to_string(), prefix.to_string()));
        }

        let path = format!("/{}", s3_uri_encode(&config.bucket, true));
        let (status, body) = self.get_with_fallback(&config, &path, &query).await?;
        check_listing_status(status, &body)?;
        let page = parse_list_objects(&body).map_err(|e| with_excerpt(e, &body))?;
        Ok(entries_from_page(page, prefix))
    }

    /// GET signed with SigV4, retried once with the legacy signature when
    /// the SigV4 attempt does not succeed for any reason (transport error
    /// or non-2xx status, including the 400 a region mismatch produces).
    /// Requests are never sent unauthenticated.
    async fn get_with_fallback(
        &self,
        config: &ConnectionConfig,
        path: &str,
        query: &[(String, String)],
    ) -> Result<(StatusCode, String), StorageError> {
        let target = RequestTarget::new(config, path, &build_canonical_query_string(query))?;
        let signer = Signer::from_connection(config);

        let signed = signer.sign(
            &RequestToSign {
                method: "GET",
                host: &target.host,
                canonical_uri: &target.canonical_uri,
                query,
                headers: &[],
                payload_hash: EMPTY_SHA256,
            },
            &SigningTime::now(),
        );
        let mut request = self.http.get(&target.url);
        for (name, value) in signed.headers() {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let status = response.status();
                return Ok((status, response.text().await?));
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                debug!(
                    status = %status,
                    url = %target.url,
                    body = %excerpt(&body),
                    "SigV4 request not accepted, trying legacy signature"
                );
            }
            Err(e) => {
                debug!(error = %e, url = %target.url, "SigV4 request failed, trying legacy signature");
            }
        }

        let response = self
            .http
            .get(&target.url)
            .header(AUTHORIZATION, signer.legacy_authorization(&target.url))
            .send()
            .await?;
        let status = response.status();
        if is_auth_rejection(status) {
            return Err(StorageError::AuthFailure);
        }
        Ok((status, response.text().await?))
    }

    // -- Upload -----------------------------------------------------------------

    /// Validate a local file and upload it under `folder`.
    ///
    /// The stored name is `original_name` (or the local file name)
    /// sanitized.  The file's leading bytes must match its extension.
    /// Every check runs before the first request is sent.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        folder: &str,
        original_name: Option<&str>,
    ) -> Result<UploadResult, StorageError> {
        let name = match original_name {
            Some(name) => name.to_string(),
            None => local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| StorageError::Validation("No file selected.".to_string()))?,
        };
        let size = local_file_size(local_path).await?;
        let request = self.policy.prepare(folder, &name, size)?;
        let head = read_head(local_path).await?;
        if let Err(e) = self.policy.check_file_content(&request.file_name, &head) {
            self.log.record(&format!("Upload rejected: {e}"));
            return Err(e);
        }

        let mut result = self
            .upload_object(local_path, &request.key, &request.content_type)
            .await?;
        result.display_filename = request.file_name;
        Ok(result)
    }

    /// Stream `local_path` to `destination_key` with a signed PUT.
    pub async fn upload_object(
        &self,
        local_path: &Path,
        destination_key: &str,
        content_type: &str,
    ) -> Result<UploadResult, StorageError> {
        let timer = OperationTimer::start(OP_UPLOAD);
        let result = self
            .try_upload(local_path, destination_key, content_type)
            .await;
        if let Err(e) = &result {
            self.log.record(&format!("File upload error: {e}"));
        }
        timer.observe(result)
    }

    async fn try_upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<UploadResult, StorageError> {
        let config = self.connection();
        config.require_full()?;

        if key.is_empty() || key.len() > 1024 {
            return Err(StorageError::Validation(
                "Object key must be between 1 and 1024 bytes".to_string(),
            ));
        }
        let size = local_file_size(local_path).await?;
        self.policy.check_size(size)?;

        let (content_hash, hashed_size) = sha256_file(local_path).await?;
        if hashed_size != size {
            return Err(StorageError::upload(
                None,
                "file changed while it was being read",
            ));
        }

        let target = RequestTarget::new(&config, &object_uri(&config.bucket, key), "")?;
        let extra_headers = vec![
            ("content-length".to_string(), size.to_string()),
            ("content-type".to_string(), content_type.to_string()),
        ];
        let signed = Signer::from_connection(&config).sign(
            &RequestToSign {
                method: "PUT",
                host: &target.host,
                canonical_uri: &target.canonical_uri,
                query: &[],
                headers: &extra_headers,
                payload_hash: &content_hash,
            },
            &SigningTime::now(),
        );

        let file = tokio::fs::File::open(local_path).await.map_err(|e| {
            StorageError::upload(None, format!("Failed to open file stream: {e}"))
        })?;
        let body = reqwest::Body::wrap_stream(ReaderStream::with_capacity(file, CHUNK_SIZE));

        debug!(key = %key, size, "uploading object");
        let mut request = self
            .http
            .put(&target.url)
            .timeout(self.upload_timeout)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, size.to_string())
            .body(body);
        for (name, value) in signed.headers() {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            self.log
                .record(&format!("Upload response {status}: {}", excerpt(&detail)));
            return Err(StorageError::upload(
                Some(status.as_u16()),
                format!(
                    "S3 upload failed with status: {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("")
                )
                .trim_end()
                .to_string(),
            ));
        }

        record_upload_bytes(size);
        info!(bucket = %config.bucket, key = %key, size, "uploaded object");
        Ok(UploadResult {
            stored_path: key.to_string(),
            display_filename: base_name(key).to_string(),
        })
    }
}

impl std::fmt::Debug for ObjectStoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreClient")
            .field("connection", &self.connection)
            .field("upload_timeout", &self.upload_timeout)
            .finish_non_exhaustive()
    }
}

// -- Helpers --------------------------------------------------------------------

/// Strip leading `/`, ensure trailing `/` when non-empty.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

fn is_auth_rejection(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

fn check_listing_status(status: StatusCode, body: &str) -> Result<(), StorageError> {
    if status == StatusCode::OK {
        Ok(())
    } else {
        Err(StorageError::Connection(format!(
            "Non-200 response: {}; body: {}",
            status.as_u16(),
            excerpt(body)
        )))
    }
}

fn with_excerpt(err: StorageError, body: &str) -> StorageError {
    match err {
        StorageError::Parse(msg) => StorageError::Parse(format!("{msg}; body: {}", excerpt(body))),
        other => other,
    }
}

fn excerpt(body: &str) -> &str {
    if body.len() <= BODY_EXCERPT_LEN {
        return body;
    }
    let mut end = BODY_EXCERPT_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

async fn local_file_size(path: &Path) -> Result<u64, StorageError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| StorageError::upload(None, format!("cannot read {}: {e}", path.display())))?;
    if !metadata.is_file() {
        return Err(StorageError::upload(
            None,
            format!("{} is not a regular file", path.display()),
        ));
    }
    Ok(metadata.len())
}
