//! Value types shared by the client and its callers.

use serde::Serialize;

use crate::xml::{ListObjectsPage, ListedObject};

/// One row of a folder-style listing.
///
/// Folders are synthesized from `CommonPrefixes`; they are not objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageObject {
    /// Display name: the last path segment.
    pub name: String,
    /// Full key for files; prefix without trailing `/` for folders.
    pub path: String,
    pub is_folder: bool,
    pub size_bytes: u64,
    pub last_modified: Option<i64>,
}

impl StorageObject {
    /// Folder entry for a common prefix such as `docs/img/`.
    pub fn folder(prefix: &str) -> Self {
        let path = prefix.trim_end_matches('/');
        let name = path.rsplit('/').next().unwrap_or(path);
        Self {
            name: name.to_string(),
            path: path.to_string(),
            is_folder: true,
            size_bytes: 0,
            last_modified: None,
        }
    }

    /// File entry, or `None` for keys with an empty basename.
    pub fn file(object: ListedObject) -> Option<Self> {
        let name = base_name(&object.key);
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            path: object.key.clone(),
            is_folder: false,
            size_bytes: object.size,
            last_modified: object.last_modified,
        })
    }
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    /// Object key the file was stored under.
    pub stored_path: String,
    /// Sanitized file name, for display.
    pub display_filename: String,
}

/// Everything after the last `/`.
pub fn base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Turn a delimiter listing into display rows for `prefix`.
///
/// The placeholder object whose key equals `prefix` is dropped, as are
/// keys ending in `/`.  Rows come back folders first, then by name
/// ignoring case.
pub fn entries_from_page(page: ListObjectsPage, prefix: &str) -> Vec<StorageObject> {
    let mut entries: Vec<StorageObject> = page
        .common_prefixes
        .iter()
        .map(|p| StorageObject::folder(p))
        .collect();

    entries.extend(
        page.contents
            .into_iter()
            .filter(|o| prefix.is_empty() || o.key != prefix)
            .filter_map(StorageObject::file),
    );

    sort_entries(&mut entries);
    entries
}

/// Folders before files, then case-insensitive name order.
pub fn sort_entries(entries: &mut [StorageObject]) {
    entries.sort_by(|a, b| {
        b.is_folder
            .cmp(&a.is_folder)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}
