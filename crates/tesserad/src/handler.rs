//! Bridges between the rebalance engine's trait seams and the TCP
//! transport: outbound bundles, the control client, and inbound dispatch.

use std::sync::Arc;

use bytes::Bytes;
use tessera_cluster::SmapOwner;
use tessera_net::{
    BundleKind, CtrlClient, CtrlRequest, CtrlResponse, DataHdr, InboundHandler, StreamBundle,
};
use tessera_reb::{PeerClient, RebError, RebManager, RebTransport};
use tessera_types::{Bucket, EcMetadata, RebStatus, TargetId};
use tracing::warn;

/// Outbound stream bundles, resolving peers through the cluster map.
pub struct NodeTransport {
    data: StreamBundle,
    ack: StreamBundle,
    smap: Arc<SmapOwner>,
}

impl NodeTransport {
    pub fn new(smap: Arc<SmapOwner>, connect_timeout: std::time::Duration) -> Self {
        Self {
            data: StreamBundle::new(BundleKind::Data, connect_timeout),
            ack: StreamBundle::new(BundleKind::Ack, connect_timeout),
            smap,
        }
    }

    fn data_addr(&self, to: &TargetId) -> Result<std::net::SocketAddr, RebError> {
        self.smap
            .get()
            .get(to)
            .map(|t| t.data_addr)
            .ok_or_else(|| RebError::Net(format!("{to} not in cluster map")))
    }

    /// Drop pooled connections (cluster map change).
    pub async fn resync(&self) {
        self.data.close().await;
        self.ack.close().await;
    }
}

#[async_trait::async_trait]
impl RebTransport for NodeTransport {
    async fn send_data(
        &self,
        to: &TargetId,
        hdr: DataHdr,
        payload: Bytes,
    ) -> Result<(), RebError> {
        let addr = self.data_addr(to)?;
        self.data.send(to, addr, &hdr, &payload).await?;
        Ok(())
    }

    async fn send_ack(&self, to: &TargetId, hdr: DataHdr) -> Result<(), RebError> {
        let addr = self.data_addr(to)?;
        self.ack.send(to, addr, &hdr, b"").await?;
        Ok(())
    }
}

/// Control-plane client, resolving peers through the cluster map.
pub struct NodePeerClient {
    ctrl: CtrlClient,
    smap: Arc<SmapOwner>,
}

impl NodePeerClient {
    pub fn new(smap: Arc<SmapOwner>, timeout: std::time::Duration) -> Self {
        Self {
            ctrl: CtrlClient::new(timeout),
            smap,
        }
    }

    async fn request(&self, to: &TargetId, req: CtrlRequest) -> Result<CtrlResponse, RebError> {
        let addr = self
            .smap
            .get()
            .get(to)
            .map(|t| t.ctrl_addr)
            .ok_or_else(|| RebError::Net(format!("{to} not in cluster map")))?;
        Ok(self.ctrl.request(addr, &req).await?)
    }
}

#[async_trait::async_trait]
impl PeerClient for NodePeerClient {
    async fn reb_status(&self, to: &TargetId) -> Result<RebStatus, RebError> {
        match self.request(to, CtrlRequest::RebStatus).await? {
            CtrlResponse::RebStatus(st) => Ok(st),
            other => Err(RebError::Net(format!("unexpected response: {other:?}"))),
        }
    }

    async fn head_object(
        &self,
        to: &TargetId,
        bucket: &Bucket,
        obj_name: &str,
    ) -> Result<bool, RebError> {
        let req = CtrlRequest::HeadObject {
            bucket: bucket.clone(),
            obj_name: obj_name.to_string(),
        };
        match self.request(to, req).await? {
            CtrlResponse::Head { exists } => Ok(exists),
            other => Err(RebError::Net(format!("unexpected response: {other:?}"))),
        }
    }

    async fn fetch_ct(
        &self,
        to: &TargetId,
        bucket: &Bucket,
        obj_name: &str,
        slice_id: u16,
    ) -> Result<Option<(EcMetadata, Bytes)>, RebError> {
        let req = CtrlRequest::FetchCt {
            bucket: bucket.clone(),
            obj_name: obj_name.to_string(),
            slice_id,
        };
        match self.request(to, req).await? {
            CtrlResponse::FetchCt {
                meta: Some(meta),
                payload,
            } => Ok(Some((meta, Bytes::from(payload)))),
            CtrlResponse::FetchCt { meta: None, .. } => Ok(None),
            other => Err(RebError::Net(format!("unexpected response: {other:?}"))),
        }
    }

    async fn fetch_namespace(&self, to: &TargetId) -> Result<Option<Bytes>, RebError> {
        match self.request(to, CtrlRequest::FetchNamespace).await? {
            CtrlResponse::Namespace { payload } => Ok(payload.map(Bytes::from)),
            other => Err(RebError::Net(format!("unexpected response: {other:?}"))),
        }
    }
}

/// Inbound dispatch into the engine.
pub struct NodeInbound {
    mgr: Arc<RebManager>,
}

impl NodeInbound {
    pub fn new(mgr: Arc<RebManager>) -> Arc<Self> {
        Arc::new(Self { mgr })
    }
}

#[async_trait::async_trait]
impl InboundHandler for NodeInbound {
    async fn on_data(&self, hdr: DataHdr, payload: Bytes) {
        self.mgr.recv_data(hdr, payload).await;
    }

    async fn on_ack(&self, hdr: DataHdr) {
        self.mgr.recv_ack(hdr).await;
    }

    async fn on_ctrl(&self, req: CtrlRequest) -> CtrlResponse {
        match req {
            CtrlRequest::RebStatus => CtrlResponse::RebStatus(self.mgr.status()),
            CtrlRequest::HeadObject { bucket, obj_name } => CtrlResponse::Head {
                exists: self.mgr.head_object(&bucket, &obj_name).await,
            },
            CtrlRequest::FetchCt {
                bucket,
                obj_name,
                slice_id,
            } => match self.mgr.fetch_ct(&bucket, &obj_name, slice_id).await {
                Some((meta, payload)) => CtrlResponse::FetchCt {
                    meta: Some(meta),
                    payload: payload.to_vec(),
                },
                None => {
                    warn!(bucket = %bucket, obj = %obj_name, slice_id, "fragment fetch miss");
                    CtrlResponse::FetchCt {
                        meta: None,
                        payload: Vec::new(),
                    }
                }
            },
            CtrlRequest::FetchNamespace => CtrlResponse::Namespace {
                payload: self.mgr.namespace_payload().map(|b| b.to_vec()),
            },
        }
    }
}
