//! Stream bundles, the inbound listener and the control-plane client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::NetError;
use crate::frame::{read_ctrl, read_frame, write_ctrl, write_frame};
use crate::message::{BundleKind, CtrlRequest, CtrlResponse, DataHdr};
use tessera_types::TargetId;

/// One outbound stream bundle: a pooled, persistent connection per peer.
///
/// Frames written to the same peer go over the same connection in call
/// order, which gives the per-bundle ordering guarantee. A failed send
/// drops the pooled connection; the next send reconnects. Bundles must be
/// resynced (closed) by the owner when the cluster map changes.
pub struct StreamBundle {
    kind: BundleKind,
    connect_timeout: Duration,
    conns: Mutex<HashMap<TargetId, Arc<Mutex<TcpStream>>>>,
}

impl StreamBundle {
    /// A new empty bundle.
    pub fn new(kind: BundleKind, connect_timeout: Duration) -> Self {
        Self {
            kind,
            connect_timeout,
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Which bundle this is.
    pub fn kind(&self) -> BundleKind {
        self.kind
    }

    async fn conn(&self, to: &TargetId, addr: SocketAddr) -> Result<Arc<Mutex<TcpStream>>, NetError> {
        {
            let conns = self.conns.lock().await;
            if let Some(c) = conns.get(to) {
                return Ok(c.clone());
            }
        }

        debug!(peer = %to, %addr, bundle = self.kind.name(), "connecting");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetError::ConnectTimeout(addr))??;
        stream.set_nodelay(true)?;

        let conn = Arc::new(Mutex::new(stream));
        {
            let mut s = conn.lock().await;
            s.write_all(&[self.kind.tag()]).await?;
        }

        let mut conns = self.conns.lock().await;
        Ok(conns.entry(to.clone()).or_insert(conn).clone())
    }

    /// Send one frame to `to`.
    ///
    /// Either the whole frame is handed to the connection or an error is
    /// returned and the pooled connection is discarded.
    pub async fn send(
        &self,
        to: &TargetId,
        addr: SocketAddr,
        hdr: &DataHdr,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let conn = self.conn(to, addr).await?;
        let res = {
            let mut stream = conn.lock().await;
            write_frame(&mut *stream, hdr, payload).await
        };
        if res.is_err() {
            self.conns.lock().await.remove(to);
        }
        res
    }

    /// Drop every pooled connection.
    pub async fn close(&self) {
        self.conns.lock().await.clear();
    }
}

/// Receiver of everything that arrives on a node's listener.
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync {
    /// A data-bundle frame arrived.
    async fn on_data(&self, hdr: DataHdr, payload: Bytes);
    /// An ack-bundle frame arrived.
    async fn on_ack(&self, hdr: DataHdr);
    /// A control request arrived; produce its response.
    async fn on_ctrl(&self, req: CtrlRequest) -> CtrlResponse;
}

/// Accept loop: dispatches every inbound connection by its bundle tag.
///
/// Runs until the listener is closed; spawn it as a background task.
pub async fn serve(listener: TcpListener, handler: Arc<dyn InboundHandler>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(stream, handler).await {
                debug!(%peer, error = %e, "connection closed");
            }
        });
    }
}

async fn handle_conn(
    mut stream: TcpStream,
    handler: Arc<dyn InboundHandler>,
) -> Result<(), NetError> {
    use tokio::io::AsyncReadExt;

    let mut tag = [0u8; 1];
    stream.read_exact(&mut tag).await?;
    let kind = BundleKind::from_tag(tag[0]).ok_or(NetError::BadBundleTag(tag[0]))?;

    match kind {
        BundleKind::Data => loop {
            let (hdr, payload) = read_frame(&mut stream).await?;
            handler.on_data(hdr, payload).await;
        },
        BundleKind::Ack => loop {
            let (hdr, _) = read_frame(&mut stream).await?;
            handler.on_ack(hdr).await;
        },
        BundleKind::Ctrl => loop {
            let req: CtrlRequest = read_ctrl(&mut stream).await?;
            let resp = handler.on_ctrl(req).await;
            write_ctrl(&mut stream, &resp).await?;
        },
    }
}

/// Control-plane client: one short-lived connection per request.
pub struct CtrlClient {
    timeout: Duration,
}

impl CtrlClient {
    /// A client with the given per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Issue one request and await its response.
    pub async fn request(
        &self,
        addr: SocketAddr,
        req: &CtrlRequest,
    ) -> Result<CtrlResponse, NetError> {
        tokio::time::timeout(self.timeout, self.request_inner(addr, req))
            .await
            .map_err(|_| NetError::ConnectTimeout(addr))?
    }

    async fn request_inner(
        &self,
        addr: SocketAddr,
        req: &CtrlRequest,
    ) -> Result<CtrlResponse, NetError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        stream.write_all(&[BundleKind::Ctrl.tag()]).await?;
        write_ctrl(&mut stream, req).await?;
        read_ctrl(&mut stream).await
    }
}
