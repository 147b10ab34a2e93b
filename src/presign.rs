//! Presigned download URLs and the download hand-off.
//!
//! [`PresignedUrlGenerator`] turns an object key into a time-limited GET
//! URL that forces a download.  [`DownloadGate`] sits in front of it for
//! the storefront: references carrying the storage prefix are swapped for
//! presigned URLs, everything else passes through untouched.

use std::sync::Arc;
use tracing::debug;

use crate::auth::{object_uri, Signer, SigningTime};
use crate::client::RequestTarget;
use crate::config::{
    clamp_expiry_minutes, Config, ConfigResolver, ConnectionSource, SettingsSource,
    DEFAULT_EXPIRY_MINUTES,
};
use crate::errors::StorageError;
use crate::logging::{DebugLog, TracingDebugLog};
use crate::metrics::{OperationTimer, OP_PRESIGN};
use crate::types::base_name;

/// Builds presigned GET URLs.
#[derive(Clone)]
pub struct PresignedUrlGenerator {
    connection: ConnectionSource,
}

impl PresignedUrlGenerator {
    pub fn new(connection: impl Into<ConnectionSource>) -> Self {
        Self {
            connection: connection.into(),
        }
    }

    /// Presigned URL for `object_key`, valid for `expiry_minutes` (the
    /// configured lifetime when `None`).
    pub fn generate(
        &self,
        object_key: &str,
        expiry_minutes: Option<i64>,
    ) -> Result<String, StorageError> {
        let timer = OperationTimer::start(OP_PRESIGN);
        timer.observe(self.generate_at(object_key, expiry_minutes, &SigningTime::now()))
    }

    /// [`generate`](Self::generate) with an explicit signing time.
    pub fn generate_at(
        &self,
        object_key: &str,
        expiry_minutes: Option<i64>,
        time: &SigningTime,
    ) -> Result<String, StorageError> {
        let config = self.connection.current();
        config.require_full()?;

        let key = object_key.trim_start_matches('/');
        if key.is_empty() {
            return Err(StorageError::Validation("Object key is empty".to_string()));
        }

        let minutes = match expiry_minutes {
            Some(m) if m < 1 => DEFAULT_EXPIRY_MINUTES,
            Some(m) => clamp_expiry_minutes(m),
            None => config.link_expiry_minutes,
        };

        let file_name = disposition_file_name(key);
        if file_name.is_empty() {
            return Err(StorageError::Validation(format!(
                "Object key {key} does not name a file"
            )));
        }

        let target = RequestTarget::new(&config, &object_uri(&config.bucket, key), "")?;
        let disposition = vec![(
            "response-content-disposition".to_string(),
            format!("attachment; filename=\"{file_name}\""),
        )];
        let signed = Signer::from_connection(&config).presign(
            &target.host,
            &target.canonical_uri,
            &disposition,
            u64::from(minutes) * 60,
            time,
        );
        let Some(query) = signed.query_string() else {
            return Err(StorageError::Validation(
                "Presigned request carries no query".to_string(),
            ));
        };

        debug!(key = %key, minutes, "generated presigned URL");
        Ok(format!("{}?{query}", target.url))
    }
}

/// Base name of `key` fit for a quoted `filename` parameter: quotes,
/// backslashes and control characters are dropped.
fn disposition_file_name(key: &str) -> String {
    base_name(key)
        .chars()
        .filter(|c| !matches!(c, '"' | '\\') && !c.is_control())
        .collect()
}

impl std::fmt::Debug for PresignedUrlGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresignedUrlGenerator")
            .field("connection", &self.connection)
            .finish()
    }
}

/// Swaps storage references for presigned URLs at download time.
#[derive(Clone)]
pub struct DownloadGate {
    generator: PresignedUrlGenerator,
    url_prefix: String,
    log: Arc<dyn DebugLog>,
}

impl DownloadGate {
    pub fn new(
        generator: PresignedUrlGenerator,
        url_prefix: impl Into<String>,
        log: Arc<dyn DebugLog>,
    ) -> Self {
        Self {
            generator,
            url_prefix: url_prefix.into(),
            log,
        }
    }

    /// Gate wired from a loaded configuration file.
    pub fn from_config(config: &Config, source: Arc<dyn SettingsSource>) -> Self {
        let log: Arc<dyn DebugLog> = Arc::new(TracingDebugLog::new(config.debug));
        let resolver = ConfigResolver::new(source).with_debug_log(log.clone());
        Self::new(
            PresignedUrlGenerator::new(resolver),
            config.download.url_prefix.clone(),
            log,
        )
    }

    pub fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    /// Whether `reference` points into object storage.
    pub fn is_storage_reference(&self, reference: &str) -> bool {
        !self.url_prefix.is_empty() && reference.starts_with(&self.url_prefix)
    }

    /// The reference to record for an uploaded or selected object.
    pub fn reference_for(&self, object_key: &str) -> String {
        format!("{}{}", self.url_prefix, object_key.trim_start_matches('/'))
    }

    /// Presigned URL for a storage reference.
    ///
    /// Anything that is not a storage reference, or that cannot be signed
    /// (missing configuration, bad key), comes back unchanged.
    pub fn resolve(&self, reference: &str) -> String {
        let Some(key) = reference
            .strip_prefix(self.url_prefix.as_str())
            .filter(|_| !self.url_prefix.is_empty())
        else {
            return reference.to_string();
        };

        match self.generator.generate(key, None) {
            Ok(url) => url,
            Err(e) => {
                self.log
                    .record(&format!("Error generating download URL: {e}"));
                reference.to_string()
            }
        }
    }
}

impl std::fmt::Debug for DownloadGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadGate")
            .field("generator", &self.generator)
            .field("url_prefix", &self.url_prefix)
            .finish_non_exhaustive()
    }
}
