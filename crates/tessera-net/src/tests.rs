//! Transport tests: framing round-trips and real-socket bundle delivery.

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::*;
use tessera_types::{Bucket, ObjAttrs, RebStatus, Stage, TargetId};

fn push_hdr(obj: &str) -> DataHdr {
    DataHdr {
        bucket: Bucket::ais("bck"),
        obj_name: obj.to_string(),
        attrs: ObjAttrs {
            size: 4,
            ..ObjAttrs::default()
        },
        opaque: Opaque::ObjPush {
            daemon_id: TargetId::new("t1"),
            reb_id: 1,
        },
    }
}

#[tokio::test]
async fn test_frame_roundtrip() {
    let (mut a, mut b) = tokio::io::duplex(1 << 16);

    let hdr = push_hdr("obj1");
    write_frame(&mut a, &hdr, b"abcd").await.unwrap();

    let (got_hdr, payload) = read_frame(&mut b).await.unwrap();
    assert_eq!(got_hdr, hdr);
    assert_eq!(payload.as_ref(), b"abcd");
}

#[tokio::test]
async fn test_frame_empty_payload() {
    let (mut a, mut b) = tokio::io::duplex(1 << 16);
    let hdr = DataHdr {
        opaque: Opaque::ObjAck {
            daemon_id: TargetId::new("t2"),
        },
        ..push_hdr("obj1")
    };
    write_frame(&mut a, &hdr, b"").await.unwrap();
    let (got_hdr, payload) = read_frame(&mut b).await.unwrap();
    assert_eq!(got_hdr, hdr);
    assert!(payload.is_empty());
}

#[tokio::test]
async fn test_frame_rejects_oversized_header_claim() {
    let (mut a, mut b) = tokio::io::duplex(64);
    use tokio::io::AsyncWriteExt;
    // Forge a header-length prefix far above the limit.
    a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
    let err = read_frame(&mut b).await.unwrap_err();
    assert!(matches!(err, NetError::FrameTooLarge { .. }));
}

#[tokio::test]
async fn test_ctrl_roundtrip() {
    let (mut a, mut b) = tokio::io::duplex(1 << 16);
    let req = CtrlRequest::HeadObject {
        bucket: Bucket::ais("b"),
        obj_name: "o".into(),
    };
    write_ctrl(&mut a, &req).await.unwrap();
    let got: CtrlRequest = read_ctrl(&mut b).await.unwrap();
    assert_eq!(got, req);
}

struct ChannelHandler {
    data_tx: mpsc::UnboundedSender<(DataHdr, Bytes)>,
    ack_tx: mpsc::UnboundedSender<DataHdr>,
}

#[async_trait::async_trait]
impl InboundHandler for ChannelHandler {
    async fn on_data(&self, hdr: DataHdr, payload: Bytes) {
        let _ = self.data_tx.send((hdr, payload));
    }

    async fn on_ack(&self, hdr: DataHdr) {
        let _ = self.ack_tx.send(hdr);
    }

    async fn on_ctrl(&self, req: CtrlRequest) -> CtrlResponse {
        match req {
            CtrlRequest::RebStatus => CtrlResponse::RebStatus(RebStatus {
                stage: Stage::Traverse,
                ..RebStatus::default()
            }),
            CtrlRequest::HeadObject { .. } => CtrlResponse::Head { exists: true },
            CtrlRequest::FetchCt { .. } => CtrlResponse::FetchCt {
                meta: None,
                payload: Vec::new(),
            },
            CtrlRequest::FetchNamespace => CtrlResponse::Namespace { payload: None },
        }
    }
}

async fn spawn_server() -> (
    std::net::SocketAddr,
    mpsc::UnboundedReceiver<(DataHdr, Bytes)>,
    mpsc::UnboundedReceiver<DataHdr>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();
    tokio::spawn(serve(listener, Arc::new(ChannelHandler { data_tx, ack_tx })));
    (addr, data_rx, ack_rx)
}

#[tokio::test]
async fn test_bundle_delivers_in_order() {
    let (addr, mut data_rx, _ack_rx) = spawn_server().await;
    let bundle = StreamBundle::new(BundleKind::Data, std::time::Duration::from_secs(5));
    let peer = TargetId::new("receiver");

    for i in 0..10u8 {
        let hdr = push_hdr(&format!("obj-{i}"));
        bundle.send(&peer, addr, &hdr, &[i]).await.unwrap();
    }

    for i in 0..10u8 {
        let (hdr, payload) = data_rx.recv().await.unwrap();
        assert_eq!(hdr.obj_name, format!("obj-{i}"));
        assert_eq!(payload.as_ref(), &[i]);
    }
}

#[tokio::test]
async fn test_ack_bundle_routes_to_ack_handler() {
    let (addr, mut data_rx, mut ack_rx) = spawn_server().await;
    let bundle = StreamBundle::new(BundleKind::Ack, std::time::Duration::from_secs(5));
    let peer = TargetId::new("receiver");

    let hdr = DataHdr {
        opaque: Opaque::EcAck {
            daemon_id: TargetId::new("t3"),
            slice_id: 2,
        },
        ..push_hdr("obj")
    };
    bundle.send(&peer, addr, &hdr, b"").await.unwrap();

    let got = ack_rx.recv().await.unwrap();
    assert_eq!(got, hdr);
    assert!(data_rx.try_recv().is_err(), "ack must not reach data handler");
}

#[tokio::test]
async fn test_ctrl_client_request_response() {
    let (addr, _d, _a) = spawn_server().await;
    let client = CtrlClient::new(std::time::Duration::from_secs(5));

    match client.request(addr, &CtrlRequest::RebStatus).await.unwrap() {
        CtrlResponse::RebStatus(st) => assert_eq!(st.stage, Stage::Traverse),
        other => panic!("unexpected response: {other:?}"),
    }

    match client
        .request(
            addr,
            &CtrlRequest::HeadObject {
                bucket: Bucket::ais("b"),
                obj_name: "o".into(),
            },
        )
        .await
        .unwrap()
    {
        CtrlResponse::Head { exists } => assert!(exists),
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn test_send_to_dead_peer_fails() {
    // Bind and immediately drop to get a (very likely) unused port.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let bundle = StreamBundle::new(BundleKind::Data, std::time::Duration::from_millis(500));
    let res = bundle
        .send(&TargetId::new("ghost"), addr, &push_hdr("o"), b"x")
        .await;
    assert!(res.is_err());
}
