//! Websocket transport: the listener, outbound dials, and the per-socket
//! read/write pump.
//!
//! Every socket starts with a `NODE_STATUS` handshake; peers on a
//! different origin hash are dropped on the spot.  Frames after that are
//! forwarded to the node's inbound queue.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::*;

use crate::errors::P2pError;
use crate::message::{Handshake, MessageType, WireMessage};
use crate::registry::{PeerId, PeerRegistry};

/// Messages surfaced to the node's dispatch loop.
#[derive(Debug)]
pub struct Inbound {
    pub peer: PeerId,
    pub msg: WireMessage,
}

/// Everything a socket task needs to know about us.
#[derive(Clone)]
pub struct LocalIdentity {
    pub node_id: String,
    pub origin_hash: String,
    pub p2p_port: u16,
}

impl LocalIdentity {
    fn handshake(&self, head_id: u64) -> WireMessage {
        WireMessage::new(
            MessageType::NodeStatus,
            Handshake {
                node_id: self.node_id.clone(),
                origin_hash: self.origin_hash.clone(),
                head_id,
                p2p_port: self.p2p_port,
            },
        )
    }
}

/// Accept loop for inbound peers.
pub async fn listen_task(
    bind: String,
    registry: Arc<PeerRegistry>,
    identity: LocalIdentity,
    inbound_tx: mpsc::Sender<Inbound>,
    head_id: impl Fn() -> u64 + Clone + Send + Sync + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&bind).await?;
    info!(%bind, "p2p listening");

    loop {
        let (stream, addr) = listener.accept().await?;
        if registry.at_capacity() {
            debug!(%addr, "at peer capacity, refusing inbound");
            continue;
        }
        let registry = registry.clone();
        let identity = identity.clone();
        let inbound_tx = inbound_tx.clone();
        let head_id = head_id.clone();
        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(ws) => {
                    let cur_head = head_id();
                    run_socket(ws, addr.to_string(), false, registry, identity, inbound_tx, cur_head)
                        .await;
                }
                Err(e) => debug!(%addr, err = %e, "ws accept failed"),
            }
        });
    }
}

/// Dials a peer and runs its socket.  Returns once connected; the socket
/// lives on its own task.
pub async fn connect_to_peer(
    url: String,
    registry: Arc<PeerRegistry>,
    identity: LocalIdentity,
    inbound_tx: mpsc::Sender<Inbound>,
    head_id: u64,
) -> Result<(), P2pError> {
    if registry.at_capacity() {
        return Err(P2pError::PeerLimit);
    }
    let (ws, _) = connect_async(&url).await?;
    info!(peer = %url, "connected to peer");
    tokio::spawn(async move {
        run_socket(ws, url, true, registry, identity, inbound_tx, head_id).await;
    });
    Ok(())
}

enum Socket {
    Plain(WebSocketStream<TcpStream>),
    Tls(WebSocketStream<MaybeTlsStream<TcpStream>>),
}

async fn run_socket(
    ws: impl Into<Socket>,
    addr: String,
    outbound: bool,
    registry: Arc<PeerRegistry>,
    identity: LocalIdentity,
    inbound_tx: mpsc::Sender<Inbound>,
    head_id: u64,
) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let peer_id = registry.register(addr.clone(), outbound, out_tx);

    // Handshake goes out first on every socket.
    registry.send_json(peer_id, &identity.handshake(head_id));

    let res = match ws.into() {
        Socket::Plain(ws) => {
            pump(ws, peer_id, &addr, &registry, &identity, &inbound_tx, &mut out_rx).await
        }
        Socket::Tls(ws) => {
            pump(ws, peer_id, &addr, &registry, &identity, &inbound_tx, &mut out_rx).await
        }
    };

    if let Err(e) = res {
        debug!(peer = %addr, err = %e, "peer socket closed");
    }
    registry.remove(peer_id);
}

impl From<WebSocketStream<TcpStream>> for Socket {
    fn from(ws: WebSocketStream<TcpStream>) -> Self {
        Socket::Plain(ws)
    }
}

impl From<WebSocketStream<MaybeTlsStream<TcpStream>>> for Socket {
    fn from(ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Socket::Tls(ws)
    }
}

/// The socket pump: outbound strings drain to the sink, inbound text
/// frames parse and dispatch.  Returns when either side closes.
async fn pump<S>(
    ws: WebSocketStream<S>,
    peer_id: PeerId,
    addr: &str,
    registry: &PeerRegistry,
    identity: &LocalIdentity,
    inbound_tx: &mpsc::Sender<Inbound>,
    out_rx: &mut mpsc::UnboundedReceiver<String>,
) -> Result<(), P2pError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                let Some(raw) = outgoing else {
                    return Ok(());
                };
                sink.send(Message::Text(raw)).await?;
            }

            incoming = stream.next() => {
                let Some(frame) = incoming else {
                    return Ok(());
                };
                let frame = frame?;
                let Ok(text) = frame.to_text() else {
                    continue;
                };
                if text.is_empty() {
                    continue;
                }
                let msg: WireMessage = match serde_json::from_str(text) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(peer = %addr, err = %e, "malformed frame");
                        continue;
                    }
                };
                registry.note_seen(peer_id);

                match msg.t {
                    MessageType::NodeStatus => {
                        let hs: Handshake = match serde_json::from_value(msg.d.clone()) {
                            Ok(h) => h,
                            Err(_) => continue,
                        };
                        if hs.origin_hash != identity.origin_hash {
                            warn!(peer = %addr, "origin hash mismatch, dropping peer");
                            return Err(P2pError::OriginMismatch);
                        }
                        registry.note_handshake(peer_id, hs.node_id, hs.p2p_port);
                    }
                    MessageType::KeepAlive => {
                        // note_seen above is the whole point; no reply
                        // needed, both sides ping on their own timers.
                    }
                    _ => {
                        if inbound_tx.send(Inbound { peer: peer_id, msg }).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}
