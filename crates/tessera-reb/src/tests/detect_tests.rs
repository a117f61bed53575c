//! Merge, classification and broken-list determinism.

use std::sync::Arc;

use tessera_fs::ContentKind;
use tessera_types::{Bucket, TargetId};

use crate::ct::{CtRecord, RebCt};
use crate::manager::RunCtx;
use crate::tests::helpers::*;

fn run_ctx(c: &TestCluster) -> RunCtx {
    RunCtx {
        smap: c.smap.clone(),
        config: Arc::new(test_config(8)),
        reb_id: 1,
    }
}

/// Copy every node's walked inventory into every other node, as the
/// exchange would.
async fn walk_and_exchange(c: &TestCluster, buckets: &[Bucket]) {
    let ctx = run_ctx(c);
    for n in &c.nodes {
        n.mgr.run_ec_walk(&ctx, buckets).await.unwrap();
    }
    for src in &c.nodes {
        let records: Vec<CtRecord> = src
            .mgr
            .ec
            .cts
            .lock()
            .unwrap()
            .get(&src.id)
            .unwrap()
            .iter()
            .map(|ct| ct.rec.clone())
            .collect();
        for dst in &c.nodes {
            if dst.id == src.id {
                continue;
            }
            dst.mgr.ec.cts.lock().unwrap().insert(
                src.id.clone(),
                records.iter().cloned().map(RebCt::remote).collect(),
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn test_broken_list_identical_across_targets() {
    let c = cluster(4, test_config(8)).await;
    let bck_a = Bucket::ais("alpha");
    let bck_r = Bucket::remote("remote");

    // A mix of damage across two provider classes.
    for i in 0..6 {
        let name = format!("obj-{i}");
        let data = test_data(4 << 10, 40 + i);
        let order = put_ec_object(&c, &bck_a, &name, &data, 2, 1).await;
        if i % 2 == 0 {
            delete_fragment(c.node(&order[0]), &bck_a, &name, ContentKind::Object, true).await;
        } else {
            delete_fragment(c.node(&order[2]), &bck_a, &name, ContentKind::Slice, true).await;
        }
    }
    for i in 0..3 {
        let name = format!("robj-{i}");
        let data = test_data(4 << 10, 50 + i);
        let order = put_ec_object(&c, &bck_r, &name, &data, 2, 1).await;
        delete_fragment(c.node(&order[0]), &bck_r, &name, ContentKind::Object, true).await;
    }

    walk_and_exchange(&c, &[bck_a.clone(), bck_r.clone()]).await;

    let ctx = run_ctx(&c);
    let mut lists = Vec::new();
    for n in &c.nodes {
        n.mgr.check_cts(&ctx).await.unwrap();
        let uids: Vec<String> = n
            .mgr
            .ec
            .broken
            .read()
            .unwrap()
            .iter()
            .map(|o| o.uid.clone())
            .collect();
        lists.push(uids);
    }

    for w in lists.windows(2) {
        assert_eq!(w[0], w[1], "broken lists must be identical sequences");
    }
    // Native buckets come first in the deterministic order.
    let first_remote = lists[0].iter().position(|u| u.starts_with("remote/"));
    if let Some(pos) = first_remote {
        assert!(
            lists[0][pos..].iter().all(|u| u.starts_with("remote/")),
            "native bucket objects must sort before remote ones"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn test_classification_flags() {
    let c = cluster(4, test_config(8)).await;
    let bck = Bucket::ais("flags");
    let data = test_data(8 << 10, 70);
    let order = put_ec_object(&c, &bck, "obj1", &data, 2, 1).await;

    // Main loses the full object.
    delete_fragment(c.node(&order[0]), &bck, "obj1", ContentKind::Object, true).await;
    walk_and_exchange(&c, &[bck.clone()]).await;

    let ctx = run_ctx(&c);
    let main = c.node(&order[0]);
    let global = main.mgr.merge_cts(&ctx);
    let draft = &global.ais["flags"].objs["obj1"];
    let obj = main.mgr.calc_local_props(&ctx, draft).unwrap();

    assert!(obj.is_main);
    assert!(!obj.main_has_any, "main holds nothing after deletion");
    assert!(!obj.full_obj_found, "no full object anywhere");
    assert!(!obj.has_ct);
    assert!(obj.has_all_slices, "all three slices survive");
    assert_eq!(obj.found_ct, 3);
    assert_eq!(obj.required_ct(), 4);
    assert_eq!(obj.main_daemon, order[0]);
    assert_eq!(obj.hrw_targets[0], order[0]);
    assert_eq!(obj.sender.as_ref(), Some(&order[1]));
    assert_eq!(obj.ct_exist, vec![false, true, true, true]);
    assert_eq!(obj.slice_size, tessera_erasure::slice_size(8 << 10, 2));

    // A slice holder derives the mirror view of the same facts.
    let holder = c.node(&order[1]);
    let global = holder.mgr.merge_cts(&ctx);
    let draft = &global.ais["flags"].objs["obj1"];
    let obj = holder.mgr.calc_local_props(&ctx, draft).unwrap();
    assert!(!obj.is_main);
    assert!(obj.has_ct);
    assert_eq!(obj.found_ct, 3);
    assert_eq!(obj.sender.as_ref(), Some(&order[1]));
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn test_duplicate_slice_resolved_by_hrw() {
    let c = cluster(4, test_config(8)).await;
    let bck = Bucket::ais("dup");
    let data = test_data(4 << 10, 60);
    let ctx = run_ctx(&c);

    let uname = bck.uname("obj1");
    let order = c.smap.hrw_targets(&uname, c.smap.len());
    // Two non-main targets both claim slice 1 of the same generation.
    let a = order[1].clone();
    let b = order[2].clone();
    let meta = make_meta(&data, 2, 1, 1);

    let rec = |tid: &TargetId| CtRecord {
        bucket: bck.clone(),
        obj_name: "obj1".into(),
        daemon_id: tid.clone(),
        obj_hash: meta.obj_cksum.clone(),
        obj_size: data.len() as u64,
        slice_id: 1,
        data_slices: 2,
        parity_slices: 1,
    };

    let observer = &c.nodes[0].mgr;
    {
        let mut cts = observer.ec.cts.lock().unwrap();
        cts.insert(a.clone(), vec![RebCt::remote(rec(&a))]);
        cts.insert(b.clone(), vec![RebCt::remote(rec(&b))]);
    }

    let global = observer.merge_cts(&ctx);
    let draft = &global.ais["dup"].objs["obj1"];
    let group = &draft.groups[&meta.obj_cksum];
    assert_eq!(group.len(), 1, "duplicate slice must collapse to one entry");

    // The survivor is whichever of the two HRW ranks earlier.
    let winner = order.iter().find(|t| **t == a || **t == b).unwrap();
    assert_eq!(&group[0].rec.daemon_id, winner);
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn test_slice_on_main_is_skipped() {
    let c = cluster(4, test_config(8)).await;
    let bck = Bucket::ais("orphan");
    let data = test_data(4 << 10, 61);
    let ctx = run_ctx(&c);

    let uname = bck.uname("obj1");
    let main = c.smap.main_target(&uname).unwrap();
    let meta = make_meta(&data, 2, 1, 1);

    let observer = &c.nodes[0].mgr;
    observer.ec.cts.lock().unwrap().insert(
        main.clone(),
        vec![RebCt::remote(CtRecord {
            bucket: bck.clone(),
            obj_name: "obj1".into(),
            daemon_id: main.clone(),
            obj_hash: meta.obj_cksum.clone(),
            obj_size: data.len() as u64,
            slice_id: 1,
            data_slices: 2,
            parity_slices: 1,
        })],
    );

    let global = observer.merge_cts(&ctx);
    assert!(
        global.ais.get("orphan").map_or(true, |b| b.objs.is_empty()),
        "a slice reported by the main target must be ignored"
    );
}

#[tokio::test(flavor = "multi_thread")]
#[ntest::timeout(60000)]
async fn test_misplaced_local_fragment_recorded() {
    let c = cluster(2, test_config(8)).await;
    let bck = Bucket::ais("mis");
    let data = test_data(4 << 10, 62);

    // Find a node and write its slice on the wrong mountpath.
    let order = c.hrw_order(&bck, "obj1");
    let holder = c.node(&order[1]);
    let uname = bck.uname("obj1");
    let right = hrw_mpath_idx(holder, &uname);
    let wrong = 1 - right;
    let slices = tessera_erasure::encode(&data, 2, 1).unwrap();
    write_fragment_on(
        &holder.mpaths[wrong],
        &bck,
        "obj1",
        &make_meta(&data, 2, 1, 1),
        &slices[0],
    )
    .await;

    let ctx = run_ctx(&c);
    holder.mgr.run_ec_walk(&ctx, &[bck.clone()]).await.unwrap();

    {
        let cts = holder.mgr.ec.cts.lock().unwrap();
        let walked = &cts[&holder.id];
        assert_eq!(walked.len(), 1);
        assert!(walked[0].is_misplaced(), "real path differs from HRW path");
    }

    holder.mgr.merge_cts(&ctx);
    assert_eq!(
        holder.mgr.ec.local_actions.lock().unwrap().len(),
        1,
        "misplaced fragment must be queued for resilvering"
    );
}
