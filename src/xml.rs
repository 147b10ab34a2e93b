//! S3 XML response parsing.
//!
//! S3-compatible endpoints answer listing calls with XML, but not all of
//! them agree on element names or casing.  This module walks responses
//! with `quick-xml`, matching on local names so namespaces never matter,
//! and pulls out just the fields the client needs.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;

use crate::errors::StorageError;

/// One object from a `ListObjectsV2` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    /// Unix seconds, if `LastModified` was present and parseable.
    pub last_modified: Option<i64>,
}

/// The parts of a delimiter listing the client uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListObjectsPage {
    pub common_prefixes: Vec<String>,
    pub contents: Vec<ListedObject>,
}

// ── Walker ──────────────────────────────────────────────────────────

/// A step through the document.  Each variant carries the stack of
/// element local names from the root down to the current element.
enum WalkEvent<'a> {
    Open(&'a [String]),
    Text(&'a [String], String),
    Close(&'a [String]),
}

/// Stream `body` through `visit`.
///
/// Fails when the document is not well formed, has no root element, or
/// ends with elements still open.
fn walk<F>(body: &str, mut visit: F) -> Result<(), StorageError>
where
    F: FnMut(WalkEvent<'_>),
{
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut saw_root = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                saw_root = true;
                stack.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                visit(WalkEvent::Open(&stack));
            }
            Event::Empty(e) => {
                saw_root = true;
                stack.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                visit(WalkEvent::Open(&stack));
                visit(WalkEvent::Close(&stack));
                stack.pop();
            }
            Event::End(_) => {
                visit(WalkEvent::Close(&stack));
                stack.pop();
            }
            Event::Text(e) => {
                if stack.is_empty() {
                    return Err(StorageError::Parse(
                        "text content outside of the root element".to_string(),
                    ));
                }
                let text = e.unescape()?.into_owned();
                visit(WalkEvent::Text(&stack, text));
            }
            Event::CData(e) => {
                let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                visit(WalkEvent::Text(&stack, text));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(StorageError::Parse("document has no root element".to_string()));
    }
    if !stack.is_empty() {
        return Err(StorageError::Parse(format!(
            "document ended inside <{}>",
            stack.join("/")
        )));
    }
    Ok(())
}

fn ends_with(stack: &[String], tail: &[&str]) -> bool {
    stack.len() >= tail.len()
        && stack[stack.len() - tail.len()..]
            .iter()
            .zip(tail)
            .all(|(a, b)| a == b)
}

// ── Bucket list ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JsonBucketList {
    buckets: Vec<JsonBucket>,
}

#[derive(Deserialize)]
struct JsonBucket {
    #[serde(default)]
    name: Option<String>,
}

/// Extract bucket names from a `GET /` response.
///
/// Accepted shapes, in order:
/// - `<Buckets><Bucket><Name>` at any depth (covers `ListAllMyBucketsResult`)
/// - lowercase `<bucket><name>` used by some S3 lookalikes
/// - JSON `{"buckets": [{"name": ...}]}` when the body is not XML
pub fn parse_bucket_list(body: &str) -> Result<Vec<String>, StorageError> {
    let mut names = Vec::new();
    let xml_result = walk(body, |event| {
        if let WalkEvent::Text(stack, text) = event {
            if ends_with(stack, &["Buckets", "Bucket", "Name"])
                || ends_with(stack, &["bucket", "name"])
            {
                names.push(text);
            }
        }
    });

    match xml_result {
        Ok(()) => Ok(names),
        Err(xml_err) => match serde_json::from_str::<JsonBucketList>(body) {
            Ok(list) => Ok(list.buckets.into_iter().filter_map(|b| b.name).collect()),
            Err(_) => Err(xml_err),
        },
    }
}

// ── ListObjectsV2 ───────────────────────────────────────────────────

/// Parse a `ListBucketResult` (ListObjectsV2) document.
pub fn parse_list_objects(body: &str) -> Result<ListObjectsPage, StorageError> {
    let mut page = ListObjectsPage::default();
    let mut current: Option<ListedObject> = None;

    walk(body, |event| match event {
        WalkEvent::Open(stack) => {
            if ends_with(stack, &["Contents"]) {
                current = Some(ListedObject::default());
            }
        }
        WalkEvent::Text(stack, text) => {
            if ends_with(stack, &["CommonPrefixes", "Prefix"]) {
                page.common_prefixes.push(text);
            } else if let Some(obj) = current.as_mut() {
                if ends_with(stack, &["Contents", "Key"]) {
                    obj.key = text;
                } else if ends_with(stack, &["Contents", "Size"]) {
                    obj.size = text.trim().parse().unwrap_or(0);
                } else if ends_with(stack, &["Contents", "LastModified"]) {
                    obj.last_modified = chrono::DateTime::parse_from_rfc3339(text.trim())
                        .ok()
                        .map(|t| t.timestamp());
                }
            }
        }
        WalkEvent::Close(stack) => {
            if ends_with(stack, &["Contents"]) {
                if let Some(obj) = current.take() {
                    page.contents.push(obj);
                }
            }
        }
    })?;

    Ok(page)
}
