use std::path::PathBuf;
use std::sync::atomic::Ordering;

use ldata_core::{
    Error, InMemoryApi, ProgressMode, ProgressTracker, RemotePath, TransferOptions,
    TransferSettings, UploadRequest, run_upload, run_upload_with,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const MIB: u64 = 1024 * 1024;

fn write_file(path: PathBuf, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

fn settings(part_mib: u64, workers: usize) -> TransferSettings {
    TransferSettings {
        part_bytes: part_mib * MIB,
        workers,
    }
}

async fn api_with_data_dir() -> InMemoryApi {
    InMemoryApi::new()
        .with_dir("latch://acct")
        .await
        .with_dir("latch://acct/data")
        .await
}

#[tokio::test]
async fn single_small_file_uploads_in_one_part() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("reads.txt");
    write_file(source.clone(), &[b'a'; 1024]);

    let api = api_with_data_dir().await;
    let summary = run_upload(
        &api,
        UploadRequest {
            source,
            dest: RemotePath::parse("latch://acct/data").unwrap(),
            settings: settings(5, 4),
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.num_files, 1);
    assert_eq!(summary.total_bytes, 1024);
    assert_eq!(api.start_calls.load(Ordering::Relaxed), 1);
    assert_eq!(api.finalize_calls.load(Ordering::Relaxed), 1);

    let finalized = api.finalized().await;
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].0, "latch://acct/data/reads.txt");
    assert_eq!(finalized[0].1.len(), 1);
    assert_eq!(finalized[0].1[0].part_number, 1);

    let stored = api.object("latch://acct/data/reads.txt").await.unwrap();
    assert_eq!(stored, vec![b'a'; 1024]);
}

#[tokio::test]
async fn zero_byte_file_skips_chunks_and_finalize() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("empty.bin");
    write_file(source.clone(), &[]);

    let api = api_with_data_dir().await;
    let summary = run_upload(
        &api,
        UploadRequest {
            source,
            dest: RemotePath::parse("latch://acct/data/empty.bin").unwrap(),
            settings: settings(5, 2),
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.num_files, 1);
    assert_eq!(summary.total_bytes, 0);
    assert_eq!(api.start_calls.load(Ordering::Relaxed), 1);
    assert_eq!(api.finalize_calls.load(Ordering::Relaxed), 0);
    assert_eq!(
        api.object("latch://acct/data/empty.bin").await.unwrap(),
        Vec::<u8>::new()
    );
}

#[tokio::test]
async fn multipart_upload_finalizes_with_contiguous_parts() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("big.bin");
    // 11 MiB with a distinct byte per 5 MiB part, so reassembly order shows.
    let mut bytes = Vec::with_capacity(11 * MIB as usize);
    for part in 0..3u8 {
        let len = if part == 2 { MIB } else { 5 * MIB };
        bytes.extend(std::iter::repeat_n(part + 1, len as usize));
    }
    write_file(source.clone(), &bytes);

    let api = api_with_data_dir().await;
    let summary = run_upload(
        &api,
        UploadRequest {
            source,
            dest: RemotePath::parse("latch://acct/data").unwrap(),
            settings: settings(5, 4),
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.num_files, 1);
    assert_eq!(summary.total_bytes, 11 * MIB);

    let finalized = api.finalized().await;
    assert_eq!(finalized.len(), 1);
    let part_numbers: Vec<u64> = finalized[0].1.iter().map(|p| p.part_number).collect();
    assert_eq!(part_numbers, vec![1, 2, 3]);

    let stored = api.object("latch://acct/data/big.bin").await.unwrap();
    assert_eq!(stored, bytes);
}

#[tokio::test]
async fn directory_upload_appends_basename_to_existing_dir() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("run42");
    write_file(source.join("a.txt"), b"aaa");
    write_file(source.join("nested/b.txt"), b"bbb");

    let api = api_with_data_dir().await;
    run_upload(
        &api,
        UploadRequest {
            source,
            dest: RemotePath::parse("latch://acct/data").unwrap(),
            settings: settings(5, 2),
        },
    )
    .await
    .unwrap();

    assert!(api.object("latch://acct/data/run42/a.txt").await.is_some());
    assert!(
        api.object("latch://acct/data/run42/nested/b.txt")
            .await
            .is_some()
    );
}

#[tokio::test]
async fn directory_upload_to_fresh_name_keeps_dest_as_root() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("run42");
    write_file(source.join("a.txt"), b"aaa");

    let api = api_with_data_dir().await;
    run_upload(
        &api,
        UploadRequest {
            source,
            dest: RemotePath::parse("latch://acct/data/renamed").unwrap(),
            settings: settings(5, 2),
        },
    )
    .await
    .unwrap();

    assert!(api.object("latch://acct/data/renamed/a.txt").await.is_some());
}

#[cfg(unix)]
#[tokio::test]
async fn vanished_file_is_skipped_and_the_rest_transfer() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("run42");
    write_file(source.join("a.txt"), b"aaa");
    write_file(source.join("b.txt"), b"bbb");
    // A dangling symlink stats like a file deleted between enumeration and
    // stat: the walk sees the name, the metadata call fails.
    std::os::unix::fs::symlink(temp.path().join("gone"), source.join("c.txt")).unwrap();

    let api = api_with_data_dir().await;
    let summary = run_upload(
        &api,
        UploadRequest {
            source,
            dest: RemotePath::parse("latch://acct/data").unwrap(),
            settings: settings(5, 2),
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.num_files, 2);
    assert!(api.object("latch://acct/data/run42/a.txt").await.is_some());
    assert!(api.object("latch://acct/data/run42/b.txt").await.is_some());
}

#[tokio::test]
async fn every_job_finalizes_exactly_once_across_worker_counts() {
    for workers in [1usize, 4, 16] {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("many");
        for i in 0..20u8 {
            write_file(source.join(format!("f{i}.txt")), &[i; 64]);
        }

        let api = api_with_data_dir().await;
        let tracker = ProgressTracker::new(ProgressMode::Total, 0);
        let summary = run_upload_with(
            &api,
            UploadRequest {
                source,
                dest: RemotePath::parse("latch://acct/data").unwrap(),
                settings: settings(5, workers),
            },
            TransferOptions {
                cancel: None,
                tracker: Some(&tracker),
            },
        )
        .await
        .unwrap();

        assert_eq!(summary.num_files, 20, "workers={workers}");
        assert_eq!(tracker.files_done(), 20, "workers={workers}");
        assert_eq!(api.start_calls.load(Ordering::Relaxed), 20);
        assert_eq!(api.finalize_calls.load(Ordering::Relaxed), 20);
    }
}

#[tokio::test]
async fn part_failure_aborts_the_whole_pool() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("many");
    for i in 0..50u8 {
        write_file(source.join(format!("f{i}.txt")), &[i; 256]);
    }

    let api = api_with_data_dir().await;
    api.fail_next_puts(1);
    let err = run_upload(
        &api,
        UploadRequest {
            source,
            dest: RemotePath::parse("latch://acct/data").unwrap(),
            settings: settings(5, 4),
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Transient { .. }));
    assert!(api.finalize_calls.load(Ordering::Relaxed) < 50);
}

#[tokio::test]
async fn cancelled_before_start_uploads_nothing() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a.txt");
    write_file(source.clone(), b"abc");

    let api = api_with_data_dir().await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = run_upload_with(
        &api,
        UploadRequest {
            source,
            dest: RemotePath::parse("latch://acct/data").unwrap(),
            settings: settings(5, 2),
        },
        TransferOptions {
            cancel: Some(&cancel),
            tracker: None,
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(api.finalize_calls.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn upload_to_missing_deep_destination_is_ambiguous() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a.txt");
    write_file(source.clone(), b"abc");

    let api = InMemoryApi::new().with_dir("latch://acct").await;
    let err = run_upload(
        &api,
        UploadRequest {
            source,
            dest: RemotePath::parse("latch://acct/no/such/dir").unwrap(),
            settings: settings(5, 2),
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::AmbiguousPath { .. }));
}
