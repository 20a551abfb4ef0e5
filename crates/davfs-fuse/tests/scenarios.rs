//! End-to-end filesystem behaviour against the in-memory store.

mod common;

use bytes::Bytes;
use common::{checked_children, Harness};
use davfs_client::{StoreOp, StoreOpKind};
use davfs_fuse::{FsError, OpenFlags, SetAttrRequest};
use std::sync::Arc;

#[tokio::test]
async fn test_create_write_read_round() {
    let h = Harness::new();
    let a = h.mkdir_p("/a").await;

    let file = h.fs.create(&a, "b.txt", OpenFlags::default()).await.unwrap();
    assert_eq!(h.fs.write(&file, 0, b"hi").await.unwrap(), 2);
    assert_eq!(h.fs.read(&file, 0, 2).await.unwrap(), Bytes::from_static(b"hi"));
    assert_eq!(h.fs.getattr(&file).await.unwrap().size, 2);
    assert_eq!(h.store.contents("/a/b.txt"), Some(b"hi".to_vec()));
}

#[tokio::test]
async fn test_create_links_child_exactly_once() {
    let h = Harness::new();
    let root = h.root();
    let first = h.fs.create(&root, "f", OpenFlags::default()).await.unwrap();
    let second = h.fs.create(&root, "f", OpenFlags::default()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(checked_children(&root), vec!["f"]);

    let dir = h.fs.mkdir(&root, "d").await.unwrap();
    assert_eq!(checked_children(&root), vec!["d", "f"]);
    assert_eq!(dir.name(), "d");
}

#[tokio::test]
async fn test_rename_directory_into_sibling() {
    let h = Harness::new();
    let a = h.mkdir_p("/a").await;
    h.fs.mkdir(&a, "sub").await.unwrap();
    let sub2 = h.fs.mkdir(&a, "sub2").await.unwrap();

    h.fs.rename(&a, "sub", &sub2, "sub").await.unwrap();

    assert!(matches!(
        h.resolve("/a/sub").await,
        Err(FsError::NotFound { .. })
    ));
    let moved = h.resolve("/a/sub2/sub").await.unwrap();
    assert!(moved.is_dir());
    assert_eq!(h.path_of(&moved), "/a/sub2/sub");
    assert_eq!(checked_children(&a), vec!["sub2"]);
    assert!(h.store.exists("/a/sub2/sub"));
}

#[tokio::test]
async fn test_remove_non_empty_directory() {
    let h = Harness::new();
    let a = h.mkdir_p("/a").await;
    let d = h.fs.mkdir(&a, "d").await.unwrap();
    h.fs.create(&d, "inner", OpenFlags::default()).await.unwrap();

    let err = h.fs.remove(&a, "d", true).await.unwrap_err();
    assert!(matches!(err, FsError::NotEmpty { .. }));
    assert_eq!(err.to_errno(), libc::ENOTEMPTY);
    assert!(h.store.ops_of(StoreOpKind::Delete).is_empty());

    h.fs.remove(&d, "inner", false).await.unwrap();
    h.fs.remove(&a, "d", true).await.unwrap();
    assert!(!h.store.exists("/a/d"));
    assert!(d.is_deleted());
    assert!(checked_children(&a).is_empty());
}

#[tokio::test]
async fn test_move_paths_carry_separator_only_for_directories() {
    let h = Harness::new();
    let root = h.root();
    h.fs.mkdir(&root, "dir").await.unwrap();
    h.fs.create(&root, "file", OpenFlags::default()).await.unwrap();
    h.store.clear_journal();

    h.fs.rename(&root, "dir", &root, "dir2").await.unwrap();
    h.fs.rename(&root, "file", &root, "file2").await.unwrap();

    assert_eq!(
        h.store.ops_of(StoreOpKind::Move),
        vec![
            StoreOp::Move {
                from: "/dir/".into(),
                to: "/dir2/".into()
            },
            StoreOp::Move {
                from: "/file".into(),
                to: "/file2".into()
            },
        ]
    );
}

#[tokio::test]
async fn test_rename_onto_existing_tombstones_displaced() {
    let h = Harness::new();
    let root = h.root();
    let x = h.fs.create(&root, "x", OpenFlags::default()).await.unwrap();
    h.fs.write(&x, 0, b"from x").await.unwrap();
    let y = h.fs.create(&root, "y", OpenFlags::default()).await.unwrap();

    h.fs.rename(&root, "x", &root, "y").await.unwrap();

    assert!(y.is_deleted());
    assert!(matches!(h.fs.read(&y, 0, 6).await, Err(FsError::Stale { .. })));
    assert!(Arc::ptr_eq(&root.child("y").unwrap(), &x));
    assert_eq!(x.name(), "y");
    assert_eq!(checked_children(&root), vec!["y"]);
    assert_eq!(h.fs.read(&x, 0, 6).await.unwrap(), Bytes::from_static(b"from x"));
}

#[tokio::test]
async fn test_rename_carries_materialized_descendants() {
    let h = Harness::new();
    let inner = h.mkdir_p("/left/inner").await;
    let right = h.mkdir_p("/right").await;
    let file = h.fs.create(&inner, "f", OpenFlags::default()).await.unwrap();
    let left = h.resolve("/left").await.unwrap();

    h.fs.rename(&left, "inner", &right, "moved").await.unwrap();

    assert_eq!(h.path_of(&file), "/right/moved/f");
    assert_eq!(h.path_of(&inner), "/right/moved");
    assert!(checked_children(&left).is_empty());
    h.fs.write(&file, 0, b"ok").await.unwrap();
    assert_eq!(h.store.contents("/right/moved/f"), Some(b"ok".to_vec()));
}

#[tokio::test]
async fn test_rename_missing_source_leaves_tree() {
    let h = Harness::new();
    let root = h.root();
    h.fs.mkdir(&root, "d").await.unwrap();
    let err = h.fs.rename(&root, "ghost", &root, "d2").await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);
    assert_eq!(checked_children(&root), vec!["d"]);
    assert!(h.store.ops_of(StoreOpKind::Move).is_empty());
}

#[tokio::test]
async fn test_truncate_traffic() {
    let h = Harness::new();
    let root = h.root();
    let f = h.fs.create(&root, "f", OpenFlags::default()).await.unwrap();
    h.store.clear_journal();

    let zero = SetAttrRequest {
        size: Some(0),
        ..SetAttrRequest::default()
    };
    h.fs.setattr(&f, &zero).await.unwrap();
    assert!(h.store.journal().is_empty());

    let grow = SetAttrRequest {
        size: Some(8),
        ..SetAttrRequest::default()
    };
    h.fs.setattr(&f, &grow).await.unwrap();
    assert_eq!(h.store.contents("/f"), Some(vec![0; 8]));

    let shrink = SetAttrRequest {
        size: Some(3),
        ..SetAttrRequest::default()
    };
    let err = h.fs.setattr(&f, &shrink).await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ERANGE);
    assert_eq!(h.store.contents("/f"), Some(vec![0; 8]));

    h.fs.setattr(&f, &zero).await.unwrap();
    assert_eq!(h.store.contents("/f"), Some(Vec::new()));
    assert_eq!(h.store.ops_of(StoreOpKind::WriteWhole).len(), 1);
}

#[tokio::test]
async fn test_stale_node_after_remote_kind_change() {
    let h = Harness::new();
    let root = h.root();
    let f = h.fs.create(&root, "thing", OpenFlags::default()).await.unwrap();
    h.store.insert_collection("/thing");

    let err = h.fs.getattr(&f).await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ESTALE);
    assert!(matches!(h.fs.write(&f, 0, b"x").await, Err(FsError::Stale { .. })));

    let fresh = h.resolve("/thing").await.unwrap();
    assert!(fresh.is_dir());
    assert!(!Arc::ptr_eq(&fresh, &f));
}

#[tokio::test]
async fn test_exclusive_create() {
    let h = Harness::new();
    let root = h.root();
    let flags = OpenFlags {
        create: true,
        exclusive: true,
        write: true,
        ..OpenFlags::default()
    };
    h.fs.create(&root, "once", flags).await.unwrap();
    let err = h.fs.create(&root, "once", flags).await.unwrap_err();
    assert_eq!(err.to_errno(), libc::EEXIST);
}

#[tokio::test]
async fn test_readdir_lists_remote_entries() {
    let h = Harness::new();
    h.store.insert_file("/docs/a.txt", b"a");
    h.store.insert_file("/docs/b.txt", b"bb");
    h.store.insert_collection("/docs/sub");
    let docs = h.resolve("/docs").await.unwrap();

    let mut names: Vec<String> = h
        .fs
        .read_dir(&docs)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
    assert!(checked_children(&docs).is_empty());
}

#[tokio::test]
async fn test_released_directory_follows_rename() {
    let h = Harness::new();
    let root = h.root();
    let d = h.fs.mkdir(&root, "d").await.unwrap();
    h.fs.release(&d).await;

    h.fs.rename(&root, "d", &root, "e").await.unwrap();
    assert_eq!(h.path_of(&d), "/e");

    let file = h.fs.create(&d, "x", OpenFlags::default()).await.unwrap();
    h.fs.write(&file, 0, b"ok").await.unwrap();
    assert!(!h.store.exists("/d"));
    assert_eq!(h.store.contents("/e/x"), Some(b"ok".to_vec()));
}

#[tokio::test]
async fn test_held_handle_after_unlink_is_stale() {
    let h = Harness::new();
    let root = h.root();
    let f = h.fs.create(&root, "f", OpenFlags::default()).await.unwrap();
    h.fs.write(&f, 0, b"data").await.unwrap();
    h.fs.release(&f).await;

    h.fs.remove(&root, "f", false).await.unwrap();
    assert!(matches!(h.fs.write(&f, 4, b"zz").await, Err(FsError::Stale { .. })));
    assert!(matches!(h.fs.getattr(&f).await, Err(FsError::Stale { .. })));
    assert!(!h.store.exists("/f"));
}
