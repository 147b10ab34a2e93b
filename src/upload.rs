//! Upload validation and preparation.
//!
//! Everything here runs before the first byte goes over the network: the
//! file name is sanitized, checked against the extension allow-list and
//! the dangerous-pattern block-list, the content type is derived and
//! checked against the file's own leading bytes, the size is bounded,
//! and the destination key is assembled.

use garde::Validate;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::config::UploadConfig;
use crate::errors::StorageError;

/// Read buffer for hashing and streaming uploads.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Extensions accepted for digital products.
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    "zip", "rar", "7z", "tar", "gz", "pdf", "doc", "docx", "txt", "rtf", "jpg", "jpeg", "png",
    "gif", "webp", "mp3", "wav", "ogg", "flac", "m4a", "mp4", "avi", "mov", "wmv", "flv", "webm",
    "epub", "mobi", "azw", "azw3", "xls", "xlsx", "csv", "ppt", "pptx", "css", "js", "json", "xml",
];

/// Substrings that reject a file name wherever they appear.
pub const DANGEROUS_PATTERNS: &[&str] = &[
    ".php", ".phtml", ".asp", ".aspx", ".jsp", ".cgi", ".pl", ".py", ".exe", ".com", ".bat",
    ".cmd", ".scr", ".vbs", ".jar", ".sh", ".bash", ".zsh", ".fish", ".htaccess", ".htpasswd",
];

/// Content types accepted for upload.
pub const DEFAULT_ALLOWED_MIME_TYPES: &[&str] = &[
    // Archives
    "application/zip",
    "application/x-zip-compressed",
    "application/x-rar-compressed",
    "application/x-7z-compressed",
    "application/x-tar",
    "application/gzip",
    "application/x-gzip",
    // Documents
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/plain",
    "application/rtf",
    // Images
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
    // Audio
    "audio/mpeg",
    "audio/mp3",
    "audio/wav",
    "audio/ogg",
    "audio/flac",
    "audio/x-m4a",
    // Video
    "video/mp4",
    "video/mpeg",
    "video/quicktime",
    "video/x-msvideo",
    "video/x-ms-wmv",
    "video/x-flv",
    "video/webm",
    // E-books
    "application/epub+zip",
    "application/x-mobipocket-ebook",
    // Spreadsheets
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "text/csv",
    // Presentations
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    // Web files
    "text/css",
    "application/javascript",
    "text/javascript",
    "application/json",
    "application/xml",
    "text/xml",
];

/// Fallback content type for unknown extensions.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Text formats with no magic number; their content type comes from the
/// extension alone.
pub const SIGNATURELESS_EXTENSIONS: &[&str] = &["txt", "csv", "css", "js", "json", "xml"];

/// Types that share a container, so a sniffer may report any of them for
/// the same file.
const CONTAINER_FAMILIES: &[&[&str]] = &[
    &[
        "application/zip",
        "application/x-zip-compressed",
        "application/epub+zip",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ],
    &[
        "application/x-ole-storage",
        "application/msword",
        "application/vnd.ms-excel",
        "application/vnd.ms-powerpoint",
    ],
    &["video/mp4", "audio/x-m4a"],
];

/// A destination that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct UploadRequest {
    /// Object key: normalized folder plus sanitized file name.
    #[garde(length(min = 1, max = 1024))]
    pub key: String,

    /// Sanitized file name.
    #[garde(length(min = 1, max = 255), pattern(r"^[A-Za-z0-9._-]+$"))]
    pub file_name: String,

    /// Content type derived from the file name.
    #[garde(skip)]
    pub content_type: String,
}

/// Size, extension and content-type rules for uploads.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    max_size_bytes: u64,
    allowed_extensions: Vec<String>,
    allowed_mime_types: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

impl UploadPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        let lowered = |list: &[String]| -> Vec<String> {
            list.iter().map(|s| s.trim().to_ascii_lowercase()).collect()
        };
        Self {
            max_size_bytes: config.max_size_bytes,
            allowed_extensions: config
                .allowed_extensions
                .as_deref()
                .map(lowered)
                .unwrap_or_else(|| to_owned_list(DEFAULT_ALLOWED_EXTENSIONS)),
            allowed_mime_types: config
                .allowed_mime_types
                .as_deref()
                .map(lowered)
                .unwrap_or_else(|| to_owned_list(DEFAULT_ALLOWED_MIME_TYPES)),
        }
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    /// Reject empty files and files over the limit.
    pub fn check_size(&self, size: u64) -> Result<(), StorageError> {
        if size == 0 {
            return Err(StorageError::Validation("File is empty".to_string()));
        }
        if size > self.max_size_bytes {
            return Err(StorageError::Validation(format!(
                "File size too large. Maximum allowed size is {} bytes",
                self.max_size_bytes
            )));
        }
        Ok(())
    }

    /// Extension must be allow-listed and the name free of dangerous patterns.
    pub fn check_file_name(&self, name: &str) -> Result<(), StorageError> {
        let lower = name.to_ascii_lowercase();
        let extension = extension_of(&lower);
        if !self.allowed_extensions.iter().any(|e| e == extension) {
            return Err(StorageError::Validation(
                "File type not allowed. Only safe file types are permitted.".to_string(),
            ));
        }
        if DANGEROUS_PATTERNS.iter().any(|p| lower.contains(p)) {
            return Err(StorageError::Validation(
                "File name contains a blocked pattern".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_content_type(&self, content_type: &str) -> Result<(), StorageError> {
        let lower = content_type.to_ascii_lowercase();
        if self.allowed_mime_types.iter().any(|m| *m == lower) {
            Ok(())
        } else {
            Err(StorageError::Validation(format!(
                "Content type {content_type} is not allowed"
            )))
        }
    }

    /// The file's leading bytes must agree with its extension.
    ///
    /// `head` is the start of the file as returned by [`read_head`].  A
    /// file with no recognizable signature passes only when its extension
    /// is a plain-text format.
    pub fn check_file_content(&self, file_name: &str, head: &[u8]) -> Result<(), StorageError> {
        let lower = file_name.to_ascii_lowercase();
        let expected = content_type_for(&lower);

        match sniff_content_type(head) {
            Some(detected) if content_matches(expected, detected) => Ok(()),
            None if SIGNATURELESS_EXTENSIONS.contains(&extension_of(&lower)) => Ok(()),
            detected => Err(StorageError::Validation(format!(
                "File content ({}) does not match its extension ({expected}); possible file type spoofing",
                detected.unwrap_or("unrecognized")
            ))),
        }
    }

    /// Run every name-based check and build the destination.
    ///
    /// `original_name` is what the user picked; the stored name is its
    /// sanitized form under `folder`.
    pub fn prepare(
        &self,
        folder: &str,
        original_name: &str,
        size: u64,
    ) -> Result<UploadRequest, StorageError> {
        self.check_size(size)?;
        self.check_file_name(original_name)?;

        let file_name = sanitize_file_name(original_name)?;
        self.check_file_name(&file_name)?;

        let content_type = content_type_for(&file_name);
        if content_type == OCTET_STREAM {
            return Err(StorageError::Validation(
                "File content type could not be determined".to_string(),
            ));
        }
        self.check_content_type(content_type)?;

        let request = UploadRequest {
            key: format!("{}{}", normalize_folder(folder), file_name),
            file_name,
            content_type: content_type.to_string(),
        };
        request
            .validate()
            .map_err(|report| StorageError::Validation(report.to_string()))?;
        Ok(request)
    }
}

/// Content type detected from magic numbers, normalized to the names
/// [`content_type_for`] uses.
pub fn sniff_content_type(head: &[u8]) -> Option<&'static str> {
    let detected = infer::get(head)?.mime_type();
    Some(match detected {
        "audio/x-wav" | "audio/vnd.wave" => "audio/wav",
        "audio/x-flac" => "audio/flac",
        "audio/m4a" => "audio/x-m4a",
        "video/x-m4v" => "video/mp4",
        "application/vnd.rar" => "application/x-rar-compressed",
        "application/x-gzip" => "application/gzip",
        "text/xml" => "application/xml",
        other => other,
    })
}

fn content_matches(expected: &str, detected: &str) -> bool {
    expected == detected
        || CONTAINER_FAMILIES
            .iter()
            .any(|family| family.contains(&expected) && family.contains(&detected))
}

/// Up to [`CHUNK_SIZE`] leading bytes of a file.
pub async fn read_head(path: &Path) -> Result<Vec<u8>, StorageError> {
    let unreadable =
        |e: std::io::Error| StorageError::upload(None, format!("cannot read {}: {e}", path.display()));

    let file = tokio::fs::File::open(path).await.map_err(unreadable)?;
    let mut head = Vec::with_capacity(CHUNK_SIZE);
    file.take(CHUNK_SIZE as u64)
        .read_to_end(&mut head)
        .await
        .map_err(unreadable)?;
    Ok(head)
}

fn to_owned_list(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Lowercase-insensitive extension without the dot, or `""`.
fn extension_of(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext,
        _ => "",
    }
}

/// Strip a leading `/` and ensure a trailing `/` on non-empty folders.
pub fn normalize_folder(folder: &str) -> String {
    let trimmed = folder.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

/// Reduce a user-supplied name to a safe object-key segment.
///
/// Path components are dropped, whitespace becomes `-`, only
/// `[A-Za-z0-9._-]` survive, runs of `-` or `.` collapse, and leading or
/// trailing separators are trimmed.
pub fn sanitize_file_name(name: &str) -> Result<String, StorageError> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);

    let mut out = String::with_capacity(base.len());
    for ch in base.chars() {
        let mapped = if ch.is_whitespace() {
            '-'
        } else if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            ch
        } else {
            continue;
        };
        if matches!(mapped, '-' | '.') && out.ends_with(mapped) {
            continue;
        }
        out.push(mapped);
    }

    let cleaned = out.trim_matches(|c| matches!(c, '.' | '-' | '_'));
    if cleaned.is_empty() {
        return Err(StorageError::Validation("No file selected.".to_string()));
    }
    Ok(cleaned.to_string())
}

/// Content type for a file name, by extension.
pub fn content_type_for(name: &str) -> &'static str {
    match extension_of(&name.to_ascii_lowercase()) {
        "zip" => "application/zip",
        "rar" => "application/x-rar-compressed",
        "7z" => "application/x-7z-compressed",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain",
        "rtf" => "application/rtf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "m4a" => "audio/x-m4a",
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "webm" => "video/webm",
        "epub" => "application/epub+zip",
        "mobi" | "azw" | "azw3" => "application/x-mobipocket-ebook",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "csv" => "text/csv",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        _ => OCTET_STREAM,
    }
}

/// Hex SHA-256 and byte length of a file, read in [`CHUNK_SIZE`] pieces.
pub async fn sha256_file(path: &Path) -> Result<(String, u64), StorageError> {
    let unreadable =
        |e: std::io::Error| StorageError::upload(None, format!("cannot read {}: {e}", path.display()));

    let mut file = tokio::fs::File::open(path).await.map_err(unreadable)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = file.read(&mut buf).await.map_err(unreadable)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_normalize_folder() {
        assert_eq!(normalize_folder(""), "");
        assert_eq!(normalize_folder("/"), "");
        assert_eq!(normalize_folder("/docs"), "docs/");
        assert_eq!(normalize_folder("docs/2024/"), "docs/2024/");
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("My Guide (v2).pdf").unwrap(), "My-Guide-v2.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd.txt").unwrap(), "passwd.txt");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\a  b.zip").unwrap(), "a-b.zip");
        assert_eq!(sanitize_file_name("..hidden..txt").unwrap(), "hidden.txt");
        assert!(sanitize_file_name("¿?¡").is_err());
        assert!(sanitize_file_name("").is_err());
    }

    #[test]
    fn test_extension_allow_list() {
        let policy = UploadPolicy::default();
        assert!(policy.check_file_name("book.EPUB").is_ok());
        assert!(policy.check_file_name("song.mp3").is_ok());
        assert!(policy.check_file_name("setup.exe").is_err());
        assert!(policy.check_file_name("noextension").is_err());
        assert!(policy.check_file_name(".zip").is_err());
    }

    #[test]
    fn test_dangerous_patterns_block_double_extensions() {
        let policy = UploadPolicy::default();
        assert!(policy.check_file_name("shell.php.zip").is_err());
        assert!(policy.check_file_name("run.sh.txt").is_err());
        assert!(policy.check_file_name(".htaccess.txt").is_err());
    }

    #[test]
    fn test_size_limits() {
        let policy = UploadPolicy::from_config(&UploadConfig {
            max_size_bytes: 10,
            ..UploadConfig::default()
        });
        assert!(policy.check_size(0).is_err());
        assert!(policy.check_size(10).is_ok());
        assert_eq!(policy.check_size(11).unwrap_err().code(), "ValidationError");
    }

    #[test]
    fn test_config_overrides_lists() {
        let policy = UploadPolicy::from_config(&UploadConfig {
            allowed_extensions: Some(vec!["ISO".to_string()]),
            allowed_mime_types: Some(vec!["application/x-iso9660-image".to_string()]),
            ..UploadConfig::default()
        });
        assert!(policy.check_file_name("disk.iso").is_ok());
        assert!(policy.check_file_name("a.zip").is_err());
        assert!(policy.check_content_type("application/zip").is_err());
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a.PDF"), "application/pdf");
        assert_eq!(content_type_for("a.tar.gz"), "application/gzip");
        assert_eq!(content_type_for("a.bin"), OCTET_STREAM);
        assert_eq!(content_type_for("README"), OCTET_STREAM);
    }

    #[test]
    fn test_every_default_extension_maps_to_allowed_mime() {
        let policy = UploadPolicy::default();
        for ext in DEFAULT_ALLOWED_EXTENSIONS {
            let ct = content_type_for(&format!("file.{ext}"));
            assert!(policy.check_content_type(ct).is_ok(), "{ext} -> {ct}");
        }
    }

    #[test]
    fn test_prepare_builds_key() {
        let policy = UploadPolicy::default();
        let req = policy.prepare("/media/2024", "Cover Art.png", 42).unwrap();
        assert_eq!(req.key, "media/2024/Cover-Art.png");
        assert_eq!(req.file_name, "Cover-Art.png");
        assert_eq!(req.content_type, "image/png");
    }

    #[test]
    fn test_prepare_rejects_overlong_key() {
        let policy = UploadPolicy::default();
        let folder = "d/".repeat(600);
        let err = policy.prepare(&folder, "a.zip", 1).unwrap_err();
        assert_eq!(err.code(), "ValidationError");
    }

    const PE_HEADER: &[u8] = b"MZ\x90\x00\x03\x00\x00\x00\x04\x00\x00\x00\xff\xff\x00\x00";

    fn padded(prefix: &[u8]) -> Vec<u8> {
        let mut buf = prefix.to_vec();
        buf.resize(64, 0);
        buf
    }

    #[test]
    fn test_content_matching_extension_passes() {
        let policy = UploadPolicy::default();
        assert!(policy.check_file_content("report.pdf", b"%PDF-1.7\n%\xe2\xe3").is_ok());
        assert!(policy
            .check_file_content("cover.png", b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR")
            .is_ok());
        assert!(policy
            .check_file_content("photo.JPG", b"\xff\xd8\xff\xe0\x00\x10JFIF\x00")
            .is_ok());
    }

    #[test]
    fn test_zip_containers_accept_plain_zip_signature() {
        let policy = UploadPolicy::default();
        let zip = padded(b"PK\x03\x04\x14\x00\x00\x00");
        assert!(policy.check_file_content("bundle.zip", &zip).is_ok());
        assert!(policy.check_file_content("book.epub", &zip).is_ok());
        assert!(policy.check_file_content("slides.pptx", &zip).is_ok());
    }

    #[test]
    fn test_executable_disguised_as_document_is_rejected() {
        let policy = UploadPolicy::default();
        let err = policy
            .check_file_content("report.pdf", &padded(PE_HEADER))
            .unwrap_err();
        assert_eq!(err.code(), "ValidationError");
        assert!(err.to_string().contains("spoofing"));

        assert!(policy.check_file_content("notes.txt", &padded(PE_HEADER)).is_err());
        assert!(policy
            .check_file_content("photo.jpg", b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR")
            .is_err());
    }

    #[test]
    fn test_signatureless_content_only_for_text_formats() {
        let policy = UploadPolicy::default();
        assert!(policy.check_file_content("notes.txt", b"plain words").is_ok());
        assert!(policy.check_file_content("data.csv", b"a,b\n1,2\n").is_ok());
        assert!(policy.check_file_content("data.json", b"{\"a\": 1}").is_ok());
        assert!(policy.check_file_content("report.pdf", b"plain words").is_err());
        assert!(policy.check_file_content("song.mp3", b"plain words").is_err());
    }

    #[tokio::test]
    async fn test_read_head_caps_at_chunk_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![7u8; CHUNK_SIZE + 100]).unwrap();
        file.flush().unwrap();

        let head = read_head(file.path()).await.unwrap();
        assert_eq!(head.len(), CHUNK_SIZE);

        let err = read_head(Path::new("/nonexistent/a.pdf")).await.unwrap_err();
        assert_eq!(err.code(), "UploadFailed");
    }

    #[tokio::test]
    async fn test_sha256_file_streams() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data = vec![b'a'; CHUNK_SIZE * 2 + 17];
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let (hash, size) = sha256_file(file.path()).await.unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(hash, hex::encode(Sha256::digest(&data)));
    }

    #[tokio::test]
    async fn test_sha256_missing_file_is_upload_failure() {
        let err = sha256_file(Path::new("/nonexistent/file.zip")).await.unwrap_err();
        assert_eq!(err.code(), "UploadFailed");
    }
}
