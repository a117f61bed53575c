//! Plain object migration, ACK tracking, retransmission and resilvering.

use tessera_fs::{content_path, marker_present, ContentKind, Marker};
use tessera_types::Bucket;

use crate::tests::helpers::*;

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn test_object_migrates_to_hrw_owner() {
    let c = cluster(4, test_config(8)).await;
    let bck = Bucket::ais("plain");
    let data = test_data(32 << 10, 30);

    let order = c.hrw_order(&bck, "obj1");
    let main = &order[0];
    let holder = &order[2];

    // The object sits on a non-owner, at that node's correct mountpath.
    let uname = bck.uname("obj1");
    let idx = hrw_mpath_idx(c.node(holder), &uname);
    write_plain_object(c.node(holder), idx, &bck, "obj1", &data).await;

    for res in c.run_all(&[]).await {
        res.unwrap();
    }

    let migrated = read_fragment(c.node(main), &bck, "obj1", ContentKind::Object)
        .await
        .expect("owner must hold the object after rebalance");
    assert_eq!(migrated, data);

    // The ack triggered source deletion (a spawned task — give it a beat).
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(
        read_fragment(c.node(holder), &bck, "obj1", ContentKind::Object)
            .await
            .is_none(),
        "acknowledged source must be deleted"
    );
    assert_eq!(c.node(holder).mgr.lom_acks_pending(), 0);
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn test_object_on_owner_stays_put() {
    let c = cluster(4, test_config(8)).await;
    let bck = Bucket::ais("plain");
    let data = test_data(8 << 10, 31);

    let order = c.hrw_order(&bck, "obj1");
    let uname = bck.uname("obj1");
    let idx = hrw_mpath_idx(c.node(&order[0]), &uname);
    write_plain_object(c.node(&order[0]), idx, &bck, "obj1", &data).await;

    let before = tree_digest(c.node(&order[0])).await;
    for res in c.run_all(&[]).await {
        res.unwrap();
    }
    assert_eq!(tree_digest(c.node(&order[0])).await, before);
}

/// Lost ACKs: the retransmitter's HEAD probe sees the object landed and
/// clears the entry without resending; the source stays (no ACK, no
/// deletion) so neighbor reads keep working.
#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn test_lost_acks_resolved_by_head_probe() {
    let c = cluster(4, test_config(8)).await;
    c.net.set_drop_acks(true);

    let bck = Bucket::ais("plain");
    let data = test_data(16 << 10, 32);
    let order = c.hrw_order(&bck, "obj1");
    let holder = &order[1];

    let uname = bck.uname("obj1");
    let idx = hrw_mpath_idx(c.node(holder), &uname);
    write_plain_object(c.node(holder), idx, &bck, "obj1", &data).await;

    for res in c.run_all(&[]).await {
        res.unwrap();
    }

    let migrated = read_fragment(c.node(&order[0]), &bck, "obj1", ContentKind::Object)
        .await
        .expect("owner must hold the object");
    assert_eq!(migrated, data);

    assert_eq!(
        c.node(holder).mgr.lom_acks_pending(),
        0,
        "HEAD probe must clear the pending entry"
    );
    assert!(
        read_fragment(c.node(holder), &bck, "obj1", ContentKind::Object)
            .await
            .is_some(),
        "without an ACK the source must not be deleted"
    );
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn test_resilver_copies_to_correct_mountpath() {
    let c = cluster(2, test_config(8)).await;
    let bck = Bucket::ais("plain");
    let data = test_data(4 << 10, 33);

    let node = &c.nodes[0];
    let uname = bck.uname("obj1");
    let right = hrw_mpath_idx(node, &uname);
    let wrong = 1 - right;
    write_plain_object(node, wrong, &bck, "obj1", &data).await;

    node.mgr.run_resilver().await.unwrap();

    let correct_path = content_path(&node.mpaths[right], ContentKind::Object, &bck, "obj1");
    assert_eq!(tokio::fs::read(&correct_path).await.unwrap(), data);

    // The source copy is kept; space reclamation happens elsewhere.
    let wrong_path = content_path(&node.mpaths[wrong], ContentKind::Object, &bck, "obj1");
    assert!(wrong_path.exists(), "resilver must not delete the source");

    assert!(!marker_present(&node.conf_dir, Marker::Resilver).await);
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn test_resilver_skips_correctly_placed() {
    let c = cluster(2, test_config(8)).await;
    let bck = Bucket::ais("plain");
    let data = test_data(4 << 10, 34);

    let node = &c.nodes[0];
    let uname = bck.uname("obj1");
    let right = hrw_mpath_idx(node, &uname);
    write_plain_object(node, right, &bck, "obj1", &data).await;

    let before = tree_digest(node).await;
    node.mgr.run_resilver().await.unwrap();
    assert_eq!(tree_digest(node).await, before);
}
