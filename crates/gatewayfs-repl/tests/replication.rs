//! Cross-gateway replay: two or more gateways exchanging messages.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{attrs, dir_oid, file_oid, gw, TestGateway};
use gatewayfs_repl::{
    BlockLoader, BlockRef, BlockStamp, BlockVersion, CreateDir, CreateFile, CreateVolume,
    GatewayMessage, GatewayOp, MemoryKvs, ObjectId, Rename, SetAttributes, UnlinkFile,
    UpdateFile,
};

fn msg(id: u64, from: &str, op: GatewayOp) -> GatewayMessage {
    GatewayMessage {
        id,
        gateway: gw(from),
        volume: "vol".to_string(),
        timestamp: id,
        op,
    }
}

fn create_file(parent: ObjectId, oid: ObjectId, name: &str) -> GatewayOp {
    GatewayOp::CreateFile(CreateFile {
        parent,
        oid,
        name: name.to_string(),
        attrs: attrs(),
        block_size: 4096,
    })
}

/// Both gateways create the volume's root locally from the same message.
async fn pair() -> (Arc<MemoryKvs>, TestGateway, TestGateway, ObjectId) {
    let kvs = Arc::new(MemoryKvs::new());
    let ny = TestGateway::new("ny", kvs.clone());
    let sb = TestGateway::new("sb", kvs.clone());
    let root = dir_oid(1, "ny");
    ny.registry.create("vol", root, attrs()).unwrap();
    sb.deliver(&[msg(
        1,
        "ny",
        GatewayOp::CreateVolume(CreateVolume {
            root,
            attrs: attrs(),
        }),
    )])
    .await;
    (kvs, ny, sb, root)
}

#[tokio::test]
async fn test_concurrent_same_name_create_is_suffixed() {
    let (_kvs, ny, sb, root) = pair().await;
    let ny_doc = file_oid(10, "ny");
    let sb_doc = file_oid(10, "sb");

    // Both create doc.txt before hearing from the other.
    ny.volume("vol")
        .create_child_file(root, "doc.txt", ny_doc, attrs(), 4096)
        .unwrap();
    sb.volume("vol")
        .create_child_file(root, "doc.txt", sb_doc, attrs(), 4096)
        .unwrap();

    ny.deliver(&[msg(2, "sb", create_file(root, sb_doc, "doc.txt"))])
        .await;
    sb.deliver(&[msg(2, "ny", create_file(root, ny_doc, "doc.txt"))])
        .await;

    let on_ny = ny.volume("vol");
    assert_eq!(on_ny.lookup(root, "doc.txt").unwrap(), Some(ny_doc));
    assert_eq!(on_ny.lookup(root, "doc.txt__gw__sb").unwrap(), Some(sb_doc));
    assert!(on_ny.file(sb_doc).unwrap().unwrap().attrs.is_suffixed_name());
    assert!(!on_ny.file(ny_doc).unwrap().unwrap().attrs.is_suffixed_name());

    let on_sb = sb.volume("vol");
    assert_eq!(on_sb.lookup(root, "doc.txt").unwrap(), Some(sb_doc));
    assert!(on_sb.file(ny_doc).unwrap().unwrap().attrs.is_suffixed_name());

    assert_eq!(ny.handler.resolver().stats().create_file_conflicts, 1);
    assert_eq!(sb.handler.resolver().stats().create_file_conflicts, 1);
    assert!(ny.failures.lock().is_empty());
}

#[tokio::test]
async fn test_nested_creates_replay_in_dependency_order() {
    let (_kvs, _ny, sb, root) = pair().await;

    // A chain root/d1/d2/.../d20 plus a file at the bottom, all delivered
    // at once. Each create must wait for its parent's.
    let mut messages = Vec::new();
    let mut parent = root;
    for i in 0..20u128 {
        let oid = dir_oid(100 + i, "ny");
        messages.push(msg(
            10 + i as u64,
            "ny",
            GatewayOp::CreateDir(CreateDir {
                parent,
                oid,
                name: format!("d{}", i),
                attrs: attrs(),
            }),
        ));
        parent = oid;
    }
    let leaf = file_oid(500, "ny");
    messages.push(msg(99, "ny", create_file(parent, leaf, "leaf")));
    sb.deliver(&messages).await;

    let volume = sb.volume("vol");
    let mut dir = root;
    for i in 0..20 {
        dir = volume
            .lookup(dir, &format!("d{}", i))
            .unwrap()
            .unwrap_or_else(|| panic!("d{} missing", i));
    }
    assert_eq!(volume.lookup(dir, "leaf").unwrap(), Some(leaf));
    assert_eq!(sb.handler.stats().processed, 22);
}

#[tokio::test]
async fn test_remote_rename_and_unlink() {
    let (_kvs, _ny, sb, root) = pair().await;
    let d = dir_oid(2, "ny");
    let x = file_oid(3, "ny");
    sb.deliver(&[
        msg(
            2,
            "ny",
            GatewayOp::CreateDir(CreateDir {
                parent: root,
                oid: d,
                name: "d".to_string(),
                attrs: attrs(),
            }),
        ),
        msg(3, "ny", create_file(root, x, "x")),
        msg(
            4,
            "ny",
            GatewayOp::Rename(Rename {
                src_dir: root,
                src_name: "x".to_string(),
                src_oid: x,
                dst_dir: d,
                dst_name: "y".to_string(),
            }),
        ),
    ])
    .await;

    let volume = sb.volume("vol");
    assert_eq!(volume.lookup(d, "y").unwrap(), Some(x));
    assert_eq!(volume.lookup(root, "x").unwrap(), None);

    sb.deliver(&[msg(
        5,
        "ny",
        GatewayOp::UnlinkFile(UnlinkFile {
            parent: d,
            name: "y".to_string(),
            oid: x,
        }),
    )])
    .await;
    assert!(!volume.exists(x).unwrap());
    assert!(sb.failures.lock().is_empty());
}

#[tokio::test]
async fn test_attribute_change_keeps_suffix_hint() {
    let (_kvs, ny, _sb, root) = pair().await;
    let mine = file_oid(4, "ny");
    let theirs = file_oid(4, "sb");
    ny.volume("vol")
        .create_child_file(root, "a", mine, attrs(), 4096)
        .unwrap();
    ny.deliver(&[
        msg(2, "sb", create_file(root, theirs, "a")),
        msg(
            3,
            "sb",
            GatewayOp::SetAttributes(SetAttributes {
                oid: theirs,
                attrs: gatewayfs_repl::ObjectAttributes {
                    mode: 0o600,
                    ..Default::default()
                },
            }),
        ),
    ])
    .await;

    let file = ny.volume("vol").file(theirs).unwrap().unwrap();
    assert_eq!(file.attrs.mode, 0o600);
    assert!(file.attrs.is_suffixed_name());
}

#[tokio::test]
async fn test_concurrent_writes_converge_on_both_gateways() {
    let (kvs, ny, sb, root) = pair().await;
    let f = file_oid(7, "ny");
    ny.volume("vol")
        .create_child_file(root, "f", f, attrs(), 4096)
        .unwrap();
    sb.deliver(&[msg(2, "ny", create_file(root, f, "f"))]).await;

    // Each gateway writes block 0 locally; sb's write is later.
    let loader = BlockLoader::new(kvs.clone());
    let ny_v = BlockVersion {
        version: 1,
        gateway: gw("ny"),
    };
    let sb_v = BlockVersion {
        version: 1,
        gateway: gw("sb"),
    };
    for (version, ts) in [(ny_v, 100), (sb_v, 200)] {
        let block = BlockRef {
            file: f,
            index: 0,
            version,
        };
        let stamp = BlockStamp {
            timestamp: ts,
            gateway: version.gateway,
        };
        loader.store(&block, stamp, b"contents").unwrap();
    }
    for (gateway, version) in [(&ny, ny_v), (&sb, sb_v)] {
        gateway
            .volume("vol")
            .modify_file(f, |file| {
                file.blocks = BTreeMap::from([(0, version)]);
                Ok(())
            })
            .unwrap();
    }

    let write = || UpdateFile {
        file: f,
        offset: 0,
        length: 4096,
        new_versions: vec![1],
        new_attrs: attrs(),
    };
    ny.deliver(&[msg(3, "sb", GatewayOp::UpdateFile(write()))])
        .await;
    sb.deliver(&[msg(3, "ny", GatewayOp::UpdateFile(write()))])
        .await;

    let on_ny = ny.volume("vol").file(f).unwrap().unwrap();
    let on_sb = sb.volume("vol").file(f).unwrap().unwrap();
    assert_eq!(on_ny.blocks, BTreeMap::from([(0, sb_v)]));
    assert_eq!(on_sb.blocks, BTreeMap::from([(0, sb_v)]));
    assert_eq!(on_ny.attrs.size, 4096);
}

#[tokio::test]
async fn test_own_messages_are_dropped() {
    let (_kvs, ny, _sb, root) = pair().await;
    let before = ny.handler.stats();
    ny.deliver(&[msg(2, "ny", create_file(root, file_oid(9, "ny"), "echo"))])
        .await;
    assert_eq!(ny.handler.stats().received, before.received);
    assert!(ny.volume("vol").lookup(root, "echo").unwrap().is_none());
}

#[tokio::test]
async fn test_replayed_namespace_reaches_coordination_store() {
    let (_kvs, _ny, sb, root) = pair().await;
    let d = dir_oid(2, "ny");
    sb.deliver(&[msg(
        2,
        "ny",
        GatewayOp::CreateDir(CreateDir {
            parent: root,
            oid: d,
            name: "d".to_string(),
            attrs: attrs(),
        }),
    )])
    .await;
    sb.client.flush().await.unwrap();

    let reopened = gatewayfs_repl::Volume::open(sb.client.clone(), sb.id, "vol")
        .unwrap()
        .unwrap();
    assert_eq!(reopened.lookup(root, "d").unwrap(), Some(d));
}
