use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;

use futures_util::StreamExt;
use futures_util::stream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{CompletedPart, TransferApi};
use crate::chunk::{ChunkPlan, MIN_PART_BYTES, plan_parts, sniff_content_type};
use crate::path::RemotePath;
use crate::plan::{UploadJob, plan_upload};
use crate::pool::drain_queue;
use crate::progress::{ProgressMode, ProgressTracker, Slot};
use crate::throttle::{LatencyFeed, Throttle, spawn_feedback};
use crate::transfer::{
    PART_STREAMS, TransferOptions, TransferSettings, TransferSummary, read_file_range,
};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub source: PathBuf,
    pub dest: RemotePath,
    pub settings: TransferSettings,
}

pub async fn run_upload<A: TransferApi>(
    api: &A,
    request: UploadRequest,
) -> Result<TransferSummary> {
    run_upload_with(api, request, TransferOptions::default()).await
}

pub async fn run_upload_with<A: TransferApi>(
    api: &A,
    request: UploadRequest,
    options: TransferOptions<'_>,
) -> Result<TransferSummary> {
    let started = Instant::now();
    debug!(
        event = "phase.start",
        phase = "plan",
        source = %request.source.display(),
        dest = %request.dest,
        "phase.start"
    );
    let plan = plan_upload(api, &request.source, &request.dest).await?;

    let fallback_tracker;
    let tracker = match options.tracker {
        Some(tracker) => tracker,
        None => {
            fallback_tracker = ProgressTracker::new(ProgressMode::None, 0);
            &fallback_tracker
        }
    };
    tracker.set_planned(plan.jobs.len() as u64, plan.total_bytes);

    debug!(
        event = "phase.start",
        phase = "transfer",
        jobs = plan.jobs.len(),
        total_bytes = plan.total_bytes,
        "phase.start"
    );
    let abort = options
        .cancel
        .map(|c| c.child_token())
        .unwrap_or_default();
    let (throttle, feed, feedback) = spawn_feedback();

    let ctx = UploadCtx {
        api,
        throttle: &throttle,
        feed: &feed,
        tracker,
        abort: &abort,
        part_bytes: request.settings.part_bytes.max(MIN_PART_BYTES),
    };
    let result = drain_queue(plan.jobs, request.settings.workers, &abort, |job| {
        upload_file(&ctx, job)
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

struct UploadCtx<'a, A> {
    api: &'a A,
    throttle: &'a Throttle,
    feed: &'a LatencyFeed,
    tracker: &'a ProgressTracker,
    abort: &'a CancellationToken,
    part_bytes: u64,
}

/// Drive one file through start -> parts -> finalize.
async fn upload_file<A: TransferApi>(ctx: &UploadCtx<'_, A>, job: UploadJob) -> Result<()> {
    let content_type = sniff_content_type(&job.local_path)?;
    let plan = plan_parts(job.size, ctx.part_bytes);

    let delay = ctx.throttle.delay();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let started = Instant::now();
    let response = ctx
        .api
        .start_upload(&job.remote_key, content_type, plan.part_count)
        .await?;
    ctx.feed.record(started.elapsed());

    let Some(upload_id) = response.upload_id else {
        // Zero-byte object: the server stored it directly, no chunk phase
        // and no finalize.
        if job.size > 0 {
            return Err(Error::Protocol {
                message: format!(
                    "server omitted upload id for {} byte file {}",
                    job.size, job.remote_key
                ),
            });
        }
        if response.version_id.is_none() {
            return Err(Error::Protocol {
                message: format!("empty-file response missing version id for {}", job.remote_key),
            });
        }
        ctx.tracker.increment_files(1);
        return Ok(());
    };

    if response.part_urls.len() as u64 != plan.part_count {
        return Err(Error::Protocol {
            message: format!(
                "expected {} part urls, got {} for {}",
                plan.part_count,
                response.part_urls.len(),
                job.remote_key
            ),
        });
    }

    let label = job
        .local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| job.remote_key.clone());
    let slot = ctx.tracker.acquire_slot(&label, job.size).await;
    if let Some(slot) = &slot {
        ctx.tracker.set_usage(slot, plan.part_count);
    }

    let parts = upload_parts(ctx, &job, plan, &response.part_urls, slot.as_ref()).await;
    if let Some(slot) = slot {
        ctx.tracker.release_slot(slot);
    }
    let parts = parts?;

    ctx.api.end_upload(&job.remote_key, &upload_id, parts).await?;
    ctx.tracker.increment_files(1);
    debug!(
        event = "upload.file_done",
        remote_key = %job.remote_key,
        bytes = job.size,
        parts = plan.part_count,
        "upload.file_done"
    );
    Ok(())
}

/// Upload every part with bounded fan-out. Finalize input is only built
/// once all parts have landed; part numbers are 1-based and contiguous.
async fn upload_parts<A: TransferApi>(
    ctx: &UploadCtx<'_, A>,
    job: &UploadJob,
    plan: ChunkPlan,
    part_urls: &[String],
    slot: Option<&Slot>,
) -> Result<Vec<CompletedPart>> {
    let file = File::open(&job.local_path)?;
    let file = &file;

    let mut completed: Vec<Option<CompletedPart>> = vec![None; plan.part_count as usize];
    let mut inflight = stream::iter(0..plan.part_count)
        .map(|index| {
            let url = &part_urls[index as usize];
            async move {
                if ctx.abort.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let (offset, len) = plan.part_range(index, job.size);
                let bytes = read_file_range(file, offset, len as usize)?;
                let etag = ctx.api.put_part(url, bytes).await?;
                Ok((index, etag, len))
            }
        })
        .buffer_unordered(PART_STREAMS);

    while let Some(part) = inflight.next().await {
        let (index, etag, len) = part?;
        completed[index as usize] = Some(CompletedPart {
            etag,
            part_number: index + 1,
        });
        ctx.tracker.add_bytes(slot, len);
        if let Some(slot) = slot {
            ctx.tracker.decrement_usage(slot);
        }
    }

    completed
        .into_iter()
        .enumerate()
        .map(|(i, part)| {
            part.ok_or_else(|| Error::Protocol {
                message: format!("part {} never completed for {}", i + 1, job.remote_key),
            })
        })
        .collect()
}
