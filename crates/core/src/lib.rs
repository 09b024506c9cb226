mod api;
mod chunk;
mod download;
mod error;
mod path;
mod plan;
mod pool;
mod progress;
mod resolve;
mod throttle;
mod transfer;
mod upload;

pub use api::{
    CompletedPart, HttpTransferApi, HttpTransferApiConfig, InMemoryApi, NodeInfo, NodeKind,
    RangeBody, ResolveResponse, RetryPolicy, StartUploadResponse, TransferApi,
};
pub use chunk::{
    ChunkPlan, DEFAULT_PART_BYTES, MAX_PARTS, MIN_PART_BYTES, Sniffed, plan_parts, sniff_bytes,
    sniff_content_type,
};
pub use download::{DownloadRequest, run_download, run_download_with};
pub use error::{Error, Result};
pub use path::RemotePath;
pub use plan::{
    DownloadJob, DownloadPlan, UploadJob, UploadPlan, plan_download, plan_upload,
};
pub use pool::{MAX_WORKERS, default_worker_count, drain_queue};
pub use progress::{ProgressMode, ProgressSnapshot, ProgressTracker, Slot, SlotSnapshot};
pub use resolve::{ResolvedPaths, resolve_remote};
pub use throttle::{LatencyFeed, Throttle, delay_for, ema_update, spawn_feedback};
pub use transfer::{TransferOptions, TransferSettings, TransferSummary};
pub use upload::{UploadRequest, run_upload, run_upload_with};
