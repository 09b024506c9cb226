use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::api::{NodeKind, TransferApi};
use crate::path::RemotePath;
use crate::resolve::resolve_remote;
use crate::{Error, Result};

/// One file to upload: where it lives locally and the remote key it lands at.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub local_path: PathBuf,
    pub remote_key: String,
    pub size: u64,
}

/// One object to download: its presigned URL and the local destination.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub signed_url: String,
    pub local_dest: PathBuf,
}

#[derive(Debug, Default)]
pub struct UploadPlan {
    pub jobs: Vec<UploadJob>,
    pub total_bytes: u64,
    pub files_skipped: u64,
}

#[derive(Debug, Default)]
pub struct DownloadPlan {
    pub jobs: Vec<DownloadJob>,
    pub files_skipped: u64,
}

fn is_dir_like(kind: NodeKind) -> bool {
    matches!(kind, NodeKind::Dir | NodeKind::AccountRoot | NodeKind::Mount)
}

fn path_to_utf8(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| Error::NonUtf8Path {
        path: path.to_path_buf(),
    })
}

fn source_basename(source: &Path) -> Result<&str> {
    let name = source.file_name().ok_or_else(|| Error::InvalidArgument {
        message: format!("source has no basename: {}", source.display()),
    })?;
    name.to_str().ok_or_else(|| Error::NonUtf8Path {
        path: source.to_path_buf(),
    })
}

/// Expand `(source, dest)` into one upload job per regular file.
///
/// The destination is resolved in a single batched call before any local
/// I/O. POSIX `cp` naming applies: copying into an existing directory node
/// appends the source basename, otherwise the destination is the new name.
/// Files that vanish between enumeration and stat are skipped with a
/// warning; the rest of the plan proceeds.
pub async fn plan_upload<A: TransferApi>(
    api: &A,
    source: &Path,
    dest: &RemotePath,
) -> Result<UploadPlan> {
    let resolved = resolve_remote(api, std::slice::from_ref(dest), true).await?;
    let node = resolved.node(dest)?;

    let source_meta = std::fs::metadata(source)?;
    let mut plan = UploadPlan::default();

    if source_meta.is_file() {
        if !node.exists && dest.had_trailing_slash() {
            return Err(Error::InvalidArgument {
                message: format!("destination {dest}/ does not exist"),
            });
        }
        let remote_key = if node.exists && is_dir_like(node.kind) {
            dest.join(source_basename(source)?)
        } else {
            dest.clone()
        };
        plan.total_bytes = source_meta.len();
        plan.jobs.push(UploadJob {
            local_path: source.to_path_buf(),
            remote_key: remote_key.as_str().to_string(),
            size: source_meta.len(),
        });
        return Ok(plan);
    }

    if node.exists && !is_dir_like(node.kind) {
        return Err(Error::InvalidArgument {
            message: format!("cannot copy directory onto object {dest}"),
        });
    }
    if !node.exists && dest.had_trailing_slash() {
        return Err(Error::InvalidArgument {
            message: format!("destination {dest}/ does not exist"),
        });
    }

    let prefix = if node.exists {
        dest.join(source_basename(source)?)
    } else {
        dest.clone()
    };

    for entry in WalkDir::new(source).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    event = "plan.entry_skipped",
                    path = %e.path().map(|p| p.display().to_string()).unwrap_or_default(),
                    error = %e,
                    "plan.entry_skipped"
                );
                plan.files_skipped += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        // The file can vanish between enumeration and stat; skip it and
        // keep going.
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(
                    event = "plan.entry_skipped",
                    path = %entry.path().display(),
                    error = %e,
                    "plan.entry_skipped"
                );
                plan.files_skipped += 1;
                continue;
            }
        };

        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| Error::InvalidArgument {
                message: format!("walk escaped source root: {}", entry.path().display()),
            })?;
        let remote_key = prefix.join(path_to_utf8(rel)?);

        plan.total_bytes += metadata.len();
        plan.jobs.push(UploadJob {
            local_path: entry.path().to_path_buf(),
            remote_key: remote_key.as_str().to_string(),
            size: metadata.len(),
        });
    }

    debug!(
        event = "plan.upload",
        jobs = plan.jobs.len(),
        total_bytes = plan.total_bytes,
        skipped = plan.files_skipped,
        "plan.upload"
    );
    Ok(plan)
}

/// Expand `(source, dest)` into one download job per remote object.
///
/// A directory source is listed with one recursive signed-URL call. Parent
/// directories are created eagerly. A destination that already exists as
/// something other than a plain file fails that job only; a plain-file
/// collision is refused outright unless `force` is set, and a conflicting
/// root destination aborts planning before any I/O.
pub async fn plan_download<A: TransferApi>(
    api: &A,
    source: &RemotePath,
    dest: &Path,
    force: bool,
) -> Result<DownloadPlan> {
    let resolved = resolve_remote(api, std::slice::from_ref(source), false).await?;
    let node = resolved.node(source)?;
    let mut plan = DownloadPlan::default();

    if !is_dir_like(node.kind) {
        let local_dest = if dest.is_dir() {
            dest.join(source.name())
        } else {
            dest.to_path_buf()
        };
        if classify_local_dest(&local_dest, force)? != DestState::Writable {
            return Err(Error::Conflict { path: local_dest });
        }
        if let Some(parent) = local_dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        plan.jobs.push(DownloadJob {
            signed_url: api.signed_url(source.as_str()).await?,
            local_dest,
        });
        return Ok(plan);
    }

    let root = if dest.is_dir() {
        dest.join(source.name())
    } else if dest.exists() {
        return Err(Error::Conflict {
            path: dest.to_path_buf(),
        });
    } else {
        dest.to_path_buf()
    };

    let urls = api.signed_urls_recursive(source.as_str()).await?;
    let mut entries: Vec<(String, String)> = urls.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    for (rel, signed_url) in entries {
        let local_dest = root.join(&rel);
        match classify_local_dest(&local_dest, force)? {
            DestState::Writable => {}
            // Refusing a plain-file overwrite applies to the whole
            // invocation; a non-file in the way only loses that one job.
            DestState::PlainFile => {
                return Err(Error::Conflict { path: local_dest });
            }
            DestState::NotAFile => {
                warn!(
                    event = "plan.dest_skipped",
                    path = %local_dest.display(),
                    "plan.dest_skipped"
                );
                plan.files_skipped += 1;
                continue;
            }
        }
        if let Some(parent) = local_dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        plan.jobs.push(DownloadJob {
            signed_url,
            local_dest,
        });
    }

    debug!(
        event = "plan.download",
        jobs = plan.jobs.len(),
        skipped = plan.files_skipped,
        "plan.download"
    );
    Ok(plan)
}

#[derive(Debug, PartialEq, Eq)]
enum DestState {
    Writable,
    PlainFile,
    NotAFile,
}

fn classify_local_dest(local_dest: &Path, force: bool) -> Result<DestState> {
    match std::fs::symlink_metadata(local_dest) {
        Ok(meta) if meta.is_file() => {
            if force {
                Ok(DestState::Writable)
            } else {
                Ok(DestState::PlainFile)
            }
        }
        Ok(_) => Ok(DestState::NotAFile),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DestState::Writable),
        Err(e) => Err(e.into()),
    }
}
