use std::sync::atomic::Ordering;

use ldata_core::{Error, InMemoryApi, NodeKind, RemotePath, resolve_remote};

#[tokio::test]
async fn resolve_is_idempotent() {
    let api = InMemoryApi::new()
        .with_dir("latch://acct")
        .await
        .with_dir("latch://acct/data")
        .await
        .with_object("latch://acct/data/a.txt", b"aaa".to_vec())
        .await;

    let paths = [
        RemotePath::parse("latch://acct/data").unwrap(),
        RemotePath::parse("latch://acct/data/a.txt").unwrap(),
    ];

    let first = resolve_remote(&api, &paths, false).await.unwrap();
    let second = resolve_remote(&api, &paths, false).await.unwrap();

    assert_eq!(api.resolve_calls.load(Ordering::Relaxed), 2);
    assert_eq!(first.account_id, second.account_id);
    for path in &paths {
        let a = first.node(path).unwrap();
        let b = second.node(path).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.exists, b.exists);
    }

    let dir = first.node(&paths[0]).unwrap();
    assert_eq!(dir.kind, NodeKind::Dir);
    let object = first.node(&paths[1]).unwrap();
    assert_eq!(object.kind, NodeKind::Object);
}

#[tokio::test]
async fn one_batched_call_covers_many_paths() {
    let api = InMemoryApi::new()
        .with_dir("latch://acct")
        .await
        .with_object("latch://acct/a", vec![1])
        .await
        .with_object("latch://acct/b", vec![2])
        .await
        .with_object("latch://acct/c", vec![3])
        .await;

    let paths: Vec<RemotePath> = ["latch://acct/a", "latch://acct/b", "latch://acct/c"]
        .iter()
        .map(|p| RemotePath::parse(p).unwrap())
        .collect();
    resolve_remote(&api, &paths, false).await.unwrap();
    assert_eq!(api.resolve_calls.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn creatable_child_needs_allow_parent() {
    let api = InMemoryApi::new().with_dir("latch://acct").await;
    let fresh = [RemotePath::parse("latch://acct/new.txt").unwrap()];

    let resolved = resolve_remote(&api, &fresh, true).await.unwrap();
    let node = resolved.node(&fresh[0]).unwrap();
    assert!(!node.exists);
    assert!(node.is_direct_parent);

    let err = resolve_remote(&api, &fresh, false).await.unwrap_err();
    assert!(matches!(err, Error::PathNotFound { .. }));
}

#[tokio::test]
async fn multi_segment_remainder_is_ambiguous() {
    let api = InMemoryApi::new().with_dir("latch://acct").await;
    let deep = [RemotePath::parse("latch://acct/missing/leaf.txt").unwrap()];

    let err = resolve_remote(&api, &deep, true).await.unwrap_err();
    match err {
        Error::AmbiguousPath { remainder, .. } => assert_eq!(remainder, "missing/leaf.txt"),
        other => panic!("expected AmbiguousPath, got {other}"),
    }
}

#[tokio::test]
async fn not_found_carries_account_id() {
    let api = InMemoryApi::new().with_dir("latch://acct").await;
    let missing = [RemotePath::parse("latch://acct/nope").unwrap()];

    let err = resolve_remote(&api, &missing, false).await.unwrap_err();
    match err {
        Error::PathNotFound { account_id, path } => {
            assert_eq!(account_id, "acc_mem");
            assert_eq!(path, "latch://acct/nope");
        }
        other => panic!("expected PathNotFound, got {other}"),
    }
}
