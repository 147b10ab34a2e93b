//! Configuration loading and connection resolution.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  The `storage` section holds the persisted
//! connection settings; it is re-read through a [`SettingsSource`] every
//! time an operation resolves its [`ConnectionConfig`], so edits made by
//! the host application take effect without rebuilding the client.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::{Host, Url};

use crate::errors::StorageError;
use crate::logging::{DebugLog, TracingDebugLog};

/// Region used when none is configured.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Link expiry used when none (or garbage) is configured.
pub const DEFAULT_EXPIRY_MINUTES: u32 = 5;

/// Shortest allowed presigned-link lifetime, in minutes.
pub const MIN_EXPIRY_MINUTES: u32 = 1;

/// Longest allowed presigned-link lifetime, in minutes.
pub const MAX_EXPIRY_MINUTES: u32 = 60;

/// Prefix marking a download reference as S3-backed.
pub const DEFAULT_URL_PREFIX: &str = "edd-s3cs://";

/// Hostnames rejected regardless of how they resolve.
const BLOCKED_HOSTS: [&str; 4] = ["localhost", "127.0.0.1", "0.0.0.0", "::1"];

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Persisted connection settings.
    #[serde(default)]
    pub storage: Settings,

    /// HTTP transport settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Upload validation settings.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Download hand-off settings.
    #[serde(default)]
    pub download: DownloadConfig,

    /// Route diagnostics to the debug log sink.
    #[serde(default)]
    pub debug: bool,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection settings exactly as persisted, before validation.
///
/// Field names also accept the `*_id` aliases used by AWS tooling.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct Settings {
    #[serde(alias = "access_key_id", default)]
    pub access_key: String,

    #[serde(alias = "secret_access_key", default)]
    pub secret_key: String,

    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub bucket: String,

    #[serde(default)]
    pub region: Option<String>,

    /// Kept as a raw YAML value so non-numeric input falls back to the
    /// default instead of failing the whole file.
    #[serde(default)]
    pub expiry_minutes: Option<serde_yaml::Value>,
}

impl Settings {
    /// Overlay `S3CS_*` environment variables on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("S3CS_ACCESS_KEY") {
            self.access_key = v;
        }
        if let Some(v) = non_empty("S3CS_SECRET_KEY") {
            self.secret_key = v;
        }
        if let Some(v) = non_empty("S3CS_ENDPOINT") {
            self.endpoint = v;
        }
        if let Some(v) = non_empty("S3CS_BUCKET") {
            self.bucket = v;
        }
        if let Some(v) = non_empty("S3CS_REGION") {
            self.region = Some(v);
        }
    }
}

/// HTTP transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// TCP/TLS connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Overall timeout for listing calls in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Overall timeout for a single PUT upload in seconds.
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,

    /// Maximum redirects followed per request.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            upload_timeout_secs: default_upload_timeout(),
            max_redirects: default_max_redirects(),
        }
    }
}

/// Upload validation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Largest accepted file in bytes (default 100 MiB).
    #[serde(default = "default_max_upload_size")]
    pub max_size_bytes: u64,

    /// Replaces the built-in extension allow-list when set.
    #[serde(default)]
    pub allowed_extensions: Option<Vec<String>>,

    /// Replaces the built-in MIME allow-list when set.
    #[serde(default)]
    pub allowed_mime_types: Option<Vec<String>>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: default_max_upload_size(),
            allowed_extensions: None,
            allowed_mime_types: None,
        }
    }
}

/// Download hand-off configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    /// Prefix identifying S3-backed file references.
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            url_prefix: default_url_prefix(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_connect_timeout() -> u64 {
    15
}

fn default_request_timeout() -> u64 {
    30
}

fn default_upload_timeout() -> u64 {
    300
}

fn default_max_redirects() -> usize {
    3
}

fn default_max_upload_size() -> u64 {
    104_857_600 // 100 MiB
}

fn default_url_prefix() -> String {
    DEFAULT_URL_PREFIX.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let mut config: Config = serde_yaml::from_str(&contents)?;
    config.storage.apply_env_overrides();
    Ok(config)
}

// -- Settings sources ---------------------------------------------------------

/// Where persisted connection settings come from.
///
/// Loading never fails: a source that cannot produce settings returns
/// empty ones, which resolve to an unconfigured connection.
pub trait SettingsSource: Send + Sync {
    fn load(&self, log: &dyn DebugLog) -> Settings;
}

impl SettingsSource for Settings {
    fn load(&self, _log: &dyn DebugLog) -> Settings {
        self.clone()
    }
}

/// Re-reads the `storage` section of a YAML file on every load.
#[derive(Debug, Clone)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsSource for SettingsFile {
    fn load(&self, log: &dyn DebugLog) -> Settings {
        match load_config(&self.path) {
            Ok(config) => config.storage,
            Err(e) => {
                log.record(&format!(
                    "Could not read settings from {}: {e}",
                    self.path.display()
                ));
                Settings::default()
            }
        }
    }
}

// -- Resolved connection --------------------------------------------------------

/// Validated connection parameters for a single operation.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub access_key: String,
    pub secret_key: String,
    /// Normalized `scheme://host[:port][/path]`, or empty when invalid.
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    /// Presigned-link lifetime, always within `1..=60`.
    pub link_expiry_minutes: u32,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("link_expiry_minutes", &self.link_expiry_minutes)
            .finish()
    }
}

impl ConnectionConfig {
    /// Credentials and endpoint are present, enough to enumerate buckets.
    pub fn is_configured_for_listing(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty() && !self.endpoint.is_empty()
    }

    /// Everything needed for object operations, bucket included.
    pub fn is_configured(&self) -> bool {
        self.is_configured_for_listing() && !self.bucket.is_empty()
    }

    /// Fail with `NotConfigured` unless bucket listing is possible.
    pub fn require_listing(&self) -> Result<(), StorageError> {
        if self.is_configured_for_listing() {
            Ok(())
        } else {
            Err(StorageError::NotConfigured(
                "access key, secret key and a valid endpoint are required".to_string(),
            ))
        }
    }

    /// Fail with `NotConfigured` unless object operations are possible.
    pub fn require_full(&self) -> Result<(), StorageError> {
        self.require_listing()?;
        if self.bucket.is_empty() {
            return Err(StorageError::NotConfigured("no bucket selected".to_string()));
        }
        Ok(())
    }

    /// Parsed endpoint URL.
    pub fn endpoint_url(&self) -> Result<Url, StorageError> {
        Url::parse(&self.endpoint)
            .map_err(|e| StorageError::NotConfigured(format!("invalid endpoint: {e}")))
    }
}

/// Turns persisted settings into a [`ConnectionConfig`].
#[derive(Clone)]
pub struct ConfigResolver {
    source: Arc<dyn SettingsSource>,
    log: Arc<dyn DebugLog>,
}

impl ConfigResolver {
    pub fn new(source: Arc<dyn SettingsSource>) -> Self {
        Self {
            source,
            log: Arc::new(TracingDebugLog::default()),
        }
    }

    /// Resolver over a fixed set of settings.
    pub fn fixed(settings: Settings) -> Self {
        Self::new(Arc::new(settings))
    }

    /// Route diagnostics to `log`.
    pub fn with_debug_log(mut self, log: Arc<dyn DebugLog>) -> Self {
        self.log = log;
        self
    }

    pub fn debug_log(&self) -> &Arc<dyn DebugLog> {
        &self.log
    }

    /// Load settings and validate them.  Never fails: invalid fields come
    /// back empty and the result reports itself as unconfigured.
    pub fn resolve(&self) -> ConnectionConfig {
        let settings = self.source.load(self.log.as_ref());

        let endpoint = if settings.endpoint.trim().is_empty() {
            String::new()
        } else {
            match validate_endpoint(&settings.endpoint) {
                Ok(endpoint) => {
                    if endpoint.starts_with("http://") {
                        tracing::warn!(endpoint = %endpoint, "storage endpoint does not use HTTPS");
                        self.log.record(
                            "Warning: Using non-HTTPS endpoint - consider using HTTPS for better security",
                        );
                    }
                    endpoint
                }
                Err(e) => {
                    self.log.record(&e.to_string());
                    String::new()
                }
            }
        };

        let region = settings
            .region
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        ConnectionConfig {
            access_key: settings.access_key.trim().to_string(),
            secret_key: settings.secret_key.trim().to_string(),
            endpoint,
            bucket: settings.bucket.trim().to_string(),
            region,
            link_expiry_minutes: expiry_minutes_from(settings.expiry_minutes.as_ref()),
        }
    }
}

impl std::fmt::Debug for ConfigResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigResolver").finish_non_exhaustive()
    }
}

/// Where an operation gets its connection parameters.
#[derive(Debug, Clone)]
pub enum ConnectionSource {
    /// Re-resolved from persisted settings on every call.
    Resolved(ConfigResolver),
    /// Fixed for the owner's lifetime.
    Fixed(ConnectionConfig),
}

impl ConnectionSource {
    pub fn current(&self) -> ConnectionConfig {
        match self {
            ConnectionSource::Resolved(resolver) => resolver.resolve(),
            ConnectionSource::Fixed(config) => config.clone(),
        }
    }
}

impl From<ConfigResolver> for ConnectionSource {
    fn from(resolver: ConfigResolver) -> Self {
        ConnectionSource::Resolved(resolver)
    }
}

impl From<ConnectionConfig> for ConnectionSource {
    fn from(config: ConnectionConfig) -> Self {
        ConnectionSource::Fixed(config)
    }
}

// -- Endpoint validation --------------------------------------------------------

/// Normalize an endpoint, returning an empty string when it is rejected.
pub fn resolve_endpoint(raw: &str) -> String {
    validate_endpoint(raw).unwrap_or_default()
}

/// Validate and normalize a user-supplied endpoint.
///
/// 1. A missing scheme becomes `https://`.
/// 2. The URL must have a host.
/// 3. Literal IPs must be public (no private, loopback, reserved or
///    link-local addresses).
/// 4. `localhost`, `127.0.0.1`, `0.0.0.0` and `::1` are always rejected.
/// 5. The result is `scheme://host[:port][/path]`: default ports, a bare
///    `/` path, trailing slashes, query and fragment are dropped.
pub fn validate_endpoint(raw: &str) -> Result<String, StorageError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StorageError::Validation("Invalid endpoint URL: empty".to_string()));
    }

    let lower = trimmed.to_ascii_lowercase();
    let with_scheme = if lower.starts_with("https://") || lower.starts_with("http://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let url = Url::parse(&with_scheme)
        .map_err(|e| StorageError::Validation(format!("Invalid endpoint URL: {e}")))?;

    let host = url.host().ok_or_else(|| {
        StorageError::Validation("Invalid endpoint URL: missing host".to_string())
    })?;

    let host_str = match host {
        Host::Ipv4(ip) => {
            if !is_public_ip(IpAddr::V4(ip)) {
                return Err(ssrf_rejection("private/reserved IP address"));
            }
            ip.to_string()
        }
        Host::Ipv6(ip) => {
            if !is_public_ip(IpAddr::V6(ip)) {
                return Err(ssrf_rejection("private/reserved IP address"));
            }
            format!("[{ip}]")
        }
        Host::Domain(domain) => domain.to_ascii_lowercase(),
    };

    let bare_host = host_str.trim_start_matches('[').trim_end_matches(']');
    if BLOCKED_HOSTS.contains(&bare_host) {
        return Err(ssrf_rejection("localhost"));
    }

    let mut normalized = format!("{}://{}", url.scheme(), host_str);
    // `Url::port` is `None` for the scheme's default port.
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{port}"));
    }
    let path = url.path();
    if path != "/" && !path.is_empty() {
        normalized.push_str(path.trim_end_matches('/'));
    }

    Ok(normalized)
}

fn ssrf_rejection(what: &str) -> StorageError {
    StorageError::Validation(format!("Security: Blocked {what} in endpoint"))
}

/// Whether `ip` is routable on the public internet.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_ipv4(v4),
        IpAddr::V6(v6) => is_public_ipv6(v6),
    }
}

fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || a == 0
        || a >= 240
        // 100.64.0.0/10 shared address space
        || (a == 100 && (64..=127).contains(&b)))
}

fn is_public_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_public_ipv4(v4);
    }
    let first = ip.segments()[0];
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0db8))
}

// -- Expiry --------------------------------------------------------------------

/// Clamp a minute count into `1..=60`.
pub fn clamp_expiry_minutes(minutes: i64) -> u32 {
    minutes.clamp(MIN_EXPIRY_MINUTES as i64, MAX_EXPIRY_MINUTES as i64) as u32
}

/// Interpret a persisted expiry value: numbers and numeric strings are
/// clamped, anything else (or nothing) yields the default.
pub fn expiry_minutes_from(value: Option<&serde_yaml::Value>) -> u32 {
    let minutes = match value {
        Some(serde_yaml::Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(serde_yaml::Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    minutes
        .map(clamp_expiry_minutes)
        .unwrap_or(DEFAULT_EXPIRY_MINUTES)
}
