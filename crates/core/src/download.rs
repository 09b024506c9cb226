use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;

use futures_util::StreamExt;
use futures_util::stream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::TransferApi;
use crate::chunk::MIN_PART_BYTES;
use crate::path::RemotePath;
use crate::plan::{DownloadJob, plan_download};
use crate::pool::drain_queue;
use crate::progress::{ProgressMode, ProgressTracker, Slot};
use crate::throttle::{LatencyFeed, Throttle, spawn_feedback};
use crate::transfer::{
    PART_STREAMS, TransferOptions, TransferSettings, TransferSummary, write_file_range,
};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub source: RemotePath,
    pub dest: PathBuf,
    pub force: bool,
    pub settings: TransferSettings,
}

pub async fn run_download<A: TransferApi>(
    api: &A,
    request: DownloadRequest,
) -> Result<TransferSummary> {
    run_download_with(api, request, TransferOptions::default()).await
}

/// Interrupted or failed downloads leave whatever bytes already landed on
/// disk; partial files are never cleaned up implicitly.
pub async fn run_download_with<A: TransferApi>(
    api: &A,
    request: DownloadRequest,
    options: TransferOptions<'_>,
) -> Result<TransferSummary> {
    let started = Instant::now();
    debug!(
        event = "phase.start",
        phase = "plan",
        source = %request.source,
        dest = %request.dest.display(),
        "phase.start"
    );
    let plan = plan_download(api, &request.source, &request.dest, request.force).await?;

    let fallback_tracker;
    let tracker = match options.tracker {
        Some(tracker) => tracker,
        None => {
            fallback_tracker = ProgressTracker::new(ProgressMode::None, 0);
            &fallback_tracker
        }
    };
    tracker.set_planned(plan.jobs.len() as u64, 0);

    debug!(
        event = "phase.start",
        phase = "transfer",
        jobs = plan.jobs.len(),
        "phase.start"
    );
    let abort = options
        .cancel
        .map(|c| c.child_token())
        .unwrap_or_default();
    let (throttle, feed, feedback) = spawn_feedback();

    let ctx = DownloadCtx {
        api,
        throttle: &throttle,
        feed: &feed,
        tracker,
        abort: &abort,
        part_bytes: request.settings.part_bytes.max(MIN_PART_BYTES),
    };
    let result = drain_queue(plan.jobs, request.settings.workers, &abort, |job| {
        download_file(&ctx, job)
    })
    .await;

    feed.close();
    let _ = feedback.await;

    result?;
    if let Some(cancel) = options.cancel
        && cancel.is_cancelled()
    {
        return Err(Error::Cancelled);
    }

    let summary = TransferSummary {
        num_files: tracker.files_done(),
        total_bytes: tracker.bytes_done(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    debug!(
        event = "phase.finish",
        phase = "transfer",
        num_files = summary.num_files,
        total_bytes = summary.total_bytes,
        duration_ms = summary.elapsed_ms,
        "phase.finish"
    );
    Ok(summary)
}

struct DownloadCtx<'a, A> {
    api: &'a A,
    throttle: &'a Throttle,
    feed: &'a LatencyFeed,
    tracker: &'a ProgressTracker,
    abort: &'a CancellationToken,
    part_bytes: u64,
}

/// Fetch one object: a probe ranged GET, then parallel ranged GETs writing
/// into disjoint offsets of the pre-sized destination file.
async fn download_file<A: TransferApi>(ctx: &DownloadCtx<'_, A>, job: DownloadJob) -> Result<()> {
    let delay = ctx.throttle.delay();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let started = Instant::now();
    let first = ctx
        .api
        .get_range(&job.signed_url, 0, Some(ctx.part_bytes))
        .await?;
    ctx.feed.record(started.elapsed());

    let file = File::create(&job.local_dest)?;

    let Some(total) = first.total_size else {
        // The server ignored the range; the body is the whole object.
        let len = first.bytes.len() as u64;
        write_file_range(&file, 0, &first.bytes)?;
        ctx.tracker.add_bytes(None, len);
        ctx.tracker.increment_files(1);
        return Ok(());
    };

    if first.bytes.len() as u64 != ctx.part_bytes.min(total) {
        return Err(Error::Protocol {
            message: format!(
                "ranged response returned {} bytes, expected {} for {}",
                first.bytes.len(),
                ctx.part_bytes.min(total),
                job.local_dest.display()
            ),
        });
    }

    file.set_len(total)?;
    write_file_range(&file, 0, &first.bytes)?;

    let part_count = total.div_ceil(ctx.part_bytes).max(1);
    let label = job
        .local_dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let slot = ctx.tracker.acquire_slot(&label, total).await;
    if let Some(slot) = &slot {
        ctx.tracker.set_usage(slot, part_count);
        ctx.tracker.decrement_usage(slot);
    }
    ctx.tracker.add_bytes(slot.as_ref(), first.bytes.len() as u64);

    let result = download_remaining(ctx, &job, &file, total, slot.as_ref()).await;
    if let Some(slot) = slot {
        ctx.tracker.release_slot(slot);
    }
    result?;

    ctx.tracker.increment_files(1);
    debug!(
        event = "download.file_done",
        dest = %job.local_dest.display(),
        bytes = total,
        parts = part_count,
        "download.file_done"
    );
    Ok(())
}

async fn download_remaining<A: TransferApi>(
    ctx: &DownloadCtx<'_, A>,
    job: &DownloadJob,
    file: &File,
    total: u64,
    slot: Option<&Slot>,
) -> Result<()> {
    let offsets: Vec<u64> = (1u64..)
        .map(|i| i * ctx.part_bytes)
        .take_while(|offset| *offset < total)
        .collect();

    let mut inflight = stream::iter(offsets)
        .map(|offset| async move {
            if ctx.abort.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let len = ctx.part_bytes.min(total - offset);
            let body = ctx.api.get_range(&job.signed_url, offset, Some(len)).await?;
            if body.bytes.len() as u64 != len {
                return Err(Error::Protocol {
                    message: format!(
                        "ranged response returned {} bytes, expected {len} for {}",
                        body.bytes.len(),
                        job.local_dest.display()
                    ),
                });
            }
            write_file_range(file, offset, &body.bytes)?;
            Ok(len)
        })
        .buffer_unordered(PART_STREAMS);

    while let Some(part) = inflight.next().await {
        let len = part?;
        ctx.tracker.add_bytes(slot, len);
        if let Some(slot) = slot {
            ctx.tracker.decrement_usage(slot);
        }
    }
    Ok(())
}
