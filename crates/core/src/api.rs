use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{Error, Result};

mod http;

pub use http::{HttpTransferApi, HttpTransferApiConfig, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Object,
    Dir,
    AccountRoot,
    Mount,
    Link,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    pub exists: bool,
    pub is_direct_parent: bool,
    /// Path suffix the server could not resolve, when `exists` is false.
    pub remainder: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub account_id: String,
    pub nodes: HashMap<String, NodeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartUploadResponse {
    /// Absent for a zero-byte object: the server stores it directly and
    /// returns only `version_id`, and no chunk or finalize call follows.
    pub upload_id: Option<String>,
    #[serde(default)]
    pub part_urls: Vec<String>,
    pub version_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "PartNumber")]
    pub part_number: u64,
}

/// Body of a (possibly ranged) download request.
#[derive(Debug, Clone)]
pub struct RangeBody {
    pub bytes: Vec<u8>,
    /// Total object size from `Content-Range`; `None` when the server
    /// ignored the range and returned the whole object.
    pub total_size: Option<u64>,
}

/// Wire contract the transfer engine speaks. One implementation talks to the
/// platform over HTTPS; `InMemoryApi` backs the tests.
pub trait TransferApi: Send + Sync {
    fn resolve<'a>(
        &'a self,
        paths: &'a [String],
        allow_parent: bool,
    ) -> Pin<Box<dyn Future<Output = Result<ResolveResponse>> + Send + 'a>>;

    fn start_upload<'a>(
        &'a self,
        path: &'a str,
        content_type: &'a str,
        part_count: u64,
    ) -> Pin<Box<dyn Future<Output = Result<StartUploadResponse>> + Send + 'a>>;

    fn end_upload<'a>(
        &'a self,
        path: &'a str,
        upload_id: &'a str,
        parts: Vec<CompletedPart>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn signed_url<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    fn signed_urls_recursive<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, String>>> + Send + 'a>>;

    fn put_part<'a>(
        &'a self,
        url: &'a str,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    fn get_range<'a>(
        &'a self,
        url: &'a str,
        offset: u64,
        len: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<RangeBody>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
enum MemNode {
    Dir,
    Object(Vec<u8>),
}

#[derive(Debug)]
struct MemUpload {
    path: String,
    part_count: u64,
    parts: HashMap<u64, (String, Vec<u8>)>,
}

/// In-memory content store for tests: a flat namespace of directories and
/// objects, multipart uploads assembled on finalize, range-serving downloads.
#[derive(Debug, Default)]
pub struct InMemoryApi {
    pub start_calls: AtomicUsize,
    pub finalize_calls: AtomicUsize,
    pub resolve_calls: AtomicUsize,
    nodes: Mutex<HashMap<String, MemNode>>,
    uploads: Mutex<HashMap<String, MemUpload>>,
    finalized: Mutex<Vec<(String, Vec<CompletedPart>)>>,
    upload_seq: AtomicUsize,
    /// Remaining number of part puts to fail with a transient error.
    fail_puts: AtomicUsize,
    /// When false, `get_range` ignores the range and returns the whole body.
    serve_ranges: std::sync::atomic::AtomicBool,
    account_id: String,
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self {
            serve_ranges: std::sync::atomic::AtomicBool::new(true),
            account_id: "acc_mem".to_string(),
            ..Self::default()
        }
    }

    pub async fn with_dir(self, path: &str) -> Self {
        self.nodes
            .lock()
            .await
            .insert(path.to_string(), MemNode::Dir);
        self
    }

    pub async fn with_object(self, path: &str, bytes: Vec<u8>) -> Self {
        self.nodes
            .lock()
            .await
            .insert(path.to_string(), MemNode::Object(bytes));
        self
    }

    pub fn fail_next_puts(&self, count: usize) {
        self.fail_puts.store(count, Ordering::Relaxed);
    }

    pub fn set_serve_ranges(&self, on: bool) {
        self.serve_ranges.store(on, Ordering::Relaxed);
    }

    pub async fn object(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().await.get(path) {
            Some(MemNode::Object(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub async fn object_count(&self) -> usize {
        self.nodes
            .lock()
            .await
            .values()
            .filter(|n| matches!(n, MemNode::Object(_)))
            .count()
    }

    /// Finalize calls observed so far, as `(path, parts)` pairs.
    pub async fn finalized(&self) -> Vec<(String, Vec<CompletedPart>)> {
        self.finalized.lock().await.clone()
    }

    fn node_info(path: &str, name: &str, kind: NodeKind) -> NodeInfo {
        NodeInfo {
            id: format!("node:{path}"),
            name: name.to_string(),
            kind,
            exists: true,
            is_direct_parent: false,
            remainder: None,
        }
    }

    async fn classify(&self, path: &str) -> NodeInfo {
        let nodes = self.nodes.lock().await;
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        if let Some(node) = nodes.get(path) {
            let kind = match node {
                MemNode::Dir => NodeKind::Dir,
                MemNode::Object(_) => NodeKind::Object,
            };
            return Self::node_info(path, &name, kind);
        }

        // Find the deepest existing ancestor to compute the missing suffix.
        let mut ancestor = path.to_string();
        while let Some(idx) = ancestor.rfind('/') {
            ancestor.truncate(idx);
            if nodes.contains_key(&ancestor) {
                let remainder = path[ancestor.len() + 1..].to_string();
                let parent_is_dir = matches!(nodes.get(&ancestor), Some(MemNode::Dir));
                return NodeInfo {
                    id: String::new(),
                    name,
                    kind: NodeKind::Object,
                    exists: false,
                    is_direct_parent: parent_is_dir && !remainder.contains('/'),
                    remainder: Some(remainder),
                };
            }
        }

        NodeInfo {
            id: String::new(),
            name,
            kind: NodeKind::Object,
            exists: false,
            is_direct_parent: false,
            remainder: Some(path.to_string()),
        }
    }
}

impl TransferApi for InMemoryApi {
    fn resolve<'a>(
        &'a self,
        paths: &'a [String],
        _allow_parent: bool,
    ) -> Pin<Box<dyn Future<Output = Result<ResolveResponse>> + Send + 'a>> {
        Box::pin(async move {
            self.resolve_calls.fetch_add(1, Ordering::Relaxed);
            let mut out = HashMap::new();
            for path in paths {
                out.insert(path.clone(), self.classify(path).await);
            }
            Ok(ResolveResponse {
                account_id: self.account_id.clone(),
                nodes: out,
            })
        })
    }

    fn start_upload<'a>(
        &'a self,
        path: &'a str,
        _content_type: &'a str,
        part_count: u64,
    ) -> Pin<Box<dyn Future<Output = Result<StartUploadResponse>> + Send + 'a>> {
        Box::pin(async move {
            self.start_calls.fetch_add(1, Ordering::Relaxed);

            if part_count == 0 {
                self.nodes
                    .lock()
                    .await
                    .insert(path.to_string(), MemNode::Object(Vec::new()));
                return Ok(StartUploadResponse {
                    upload_id: None,
                    part_urls: Vec::new(),
                    version_id: Some(format!("v{}", self.upload_seq.fetch_add(1, Ordering::Relaxed))),
                });
            }

            let upload_id = format!("up-{}", self.upload_seq.fetch_add(1, Ordering::Relaxed));
            let part_urls = (1..=part_count)
                .map(|n| format!("mem://part/{upload_id}/{n}"))
                .collect();
            self.uploads.lock().await.insert(
                upload_id.clone(),
                MemUpload {
                    path: path.to_string(),
                    part_count,
                    parts: HashMap::new(),
                },
            );
            Ok(StartUploadResponse {
                upload_id: Some(upload_id),
                part_urls,
                version_id: None,
            })
        })
    }

    fn end_upload<'a>(
        &'a self,
        path: &'a str,
        upload_id: &'a str,
        parts: Vec<CompletedPart>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.finalize_calls.fetch_add(1, Ordering::Relaxed);

            let upload = self
                .uploads
                .lock()
                .await
                .remove(upload_id)
                .ok_or_else(|| Error::Api {
                    message: format!("unknown upload id: {upload_id}"),
                })?;
            if upload.path != path {
                return Err(Error::Api {
                    message: format!("upload path mismatch: {} != {path}", upload.path),
                });
            }
            if parts.len() as u64 != upload.part_count {
                return Err(Error::Api {
                    message: format!(
                        "finalize with {} parts, expected {}",
                        parts.len(),
                        upload.part_count
                    ),
                });
            }

            let mut assembled = Vec::new();
            for (i, part) in parts.iter().enumerate() {
                if part.part_number != i as u64 + 1 {
                    return Err(Error::Api {
                        message: format!(
                            "parts out of order: got {} at position {i}",
                            part.part_number
                        ),
                    });
                }
                let (etag, bytes) =
                    upload
                        .parts
                        .get(&part.part_number)
                        .ok_or_else(|| Error::Api {
                            message: format!("part {} never uploaded", part.part_number),
                        })?;
                if *etag != part.etag {
                    return Err(Error::Api {
                        message: format!("etag mismatch for part {}", part.part_number),
                    });
                }
                assembled.extend_from_slice(bytes);
            }

            self.nodes
                .lock()
                .await
                .insert(path.to_string(), MemNode::Object(assembled));
            self.finalized.lock().await.push((path.to_string(), parts));
            Ok(())
        })
    }

    fn signed_url<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            match self.nodes.lock().await.get(path) {
                Some(MemNode::Object(_)) => Ok(format!("mem://get/{path}")),
                _ => Err(Error::Api {
                    message: format!("no object at {path}"),
                }),
            }
        })
    }

    fn signed_urls_recursive<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, String>>> + Send + 'a>> {
        Box::pin(async move {
            let prefix = format!("{path}/");
            let nodes = self.nodes.lock().await;
            let mut out = HashMap::new();
            for (key, node) in nodes.iter() {
                if let (Some(rel), MemNode::Object(_)) = (key.strip_prefix(&prefix), node) {
                    out.insert(rel.to_string(), format!("mem://get/{key}"));
                }
            }
            Ok(out)
        })
    }

    fn put_part<'a>(
        &'a self,
        url: &'a str,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            if self
                .fail_puts
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Transient {
                    message: "injected put failure".to_string(),
                });
            }

            let rest = url.strip_prefix("mem://part/").ok_or_else(|| Error::Api {
                message: format!("bad part url: {url}"),
            })?;
            let (upload_id, part_no) = rest.rsplit_once('/').ok_or_else(|| Error::Api {
                message: format!("bad part url: {url}"),
            })?;
            let part_no: u64 = part_no.parse().map_err(|_| Error::Api {
                message: format!("bad part number in url: {url}"),
            })?;

            let etag = format!("etag-{part_no}-{}", bytes.len());
            let mut uploads = self.uploads.lock().await;
            let upload = uploads.get_mut(upload_id).ok_or_else(|| Error::Api {
                message: format!("unknown upload id: {upload_id}"),
            })?;
            upload.parts.insert(part_no, (etag.clone(), bytes));
            Ok(etag)
        })
    }

    fn get_range<'a>(
        &'a self,
        url: &'a str,
        offset: u64,
        len: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<RangeBody>> + Send + 'a>> {
        Box::pin(async move {
            let path = url.strip_prefix("mem://get/").ok_or_else(|| Error::Api {
                message: format!("bad signed url: {url}"),
            })?;
            let nodes = self.nodes.lock().await;
            let Some(MemNode::Object(bytes)) = nodes.get(path) else {
                return Err(Error::Api {
                    message: format!("no object at {path}"),
                });
            };

            if !self.serve_ranges.load(Ordering::Relaxed) || len.is_none() {
                return Ok(RangeBody {
                    bytes: bytes.clone(),
                    total_size: None,
                });
            }

            let total = bytes.len() as u64;
            let start = offset.min(total) as usize;
            let end = len
                .map(|l| offset.saturating_add(l).min(total))
                .unwrap_or(total) as usize;
            Ok(RangeBody {
                bytes: bytes[start..end].to_vec(),
                total_size: Some(total),
            })
        })
    }
}
