use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use mesh_protocol::packets::ControlPacket;
use mesh_protocol::MAX_DATAGRAM;

use crate::context::MeshContext;
use crate::manager::{Command, DisconnectReason};

/// Control-plane receiver: one loop over the shared control socket,
/// dispatching handshakes, heartbeats, adverts, and goodbyes. Parsing
/// happens here; anything that mutates membership goes to the manager.
pub async fn run(ctx: Arc<MeshContext>, cancel: CancellationToken) {
    let socket = Arc::clone(&ctx.control_socket);
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = socket.recv_from(&mut buf) => match result {
                Ok((len, src)) => handle_datagram(&ctx, &buf[..len], src).await,
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::WouldBlock {
                        continue;
                    }
                    error!(error = %e, "Control socket receive error");
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    }

    debug!("Control plane stopped");
}

async fn handle_datagram(ctx: &Arc<MeshContext>, data: &[u8], src: SocketAddr) {
    let packet = match ControlPacket::decode(data) {
        Ok(packet) => packet,
        Err(e) => {
            ctx.malformed.fetch_add(1, Ordering::Relaxed);
            debug!(from = %src, error = %e, len = data.len(), "Dropping malformed control datagram");
            return;
        }
    };

    match packet {
        ControlPacket::HelloRequest(hello) => {
            trace!(from = %src, peer = ?hello.node.id, "Hello request");
            let _ = ctx
                .commands_tx
                .send(Command::InboundHello { hello, src })
                .await;
        }

        ControlPacket::HelloResponse(hello) => {
            let waiter = ctx.pending_hellos.lock().unwrap().remove(&hello.node.id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(hello);
                }
                None => {
                    // Retransmitted response for a handshake that already
                    // completed; nothing to do.
                    trace!(from = %src, peer = ?hello.node.id, "Unsolicited hello response");
                }
            }
        }

        ControlPacket::Heartbeat(hb) => {
            if let Some(conn) = ctx.pool.get(hb.node) {
                conn.record_heartbeat(hb.sequence);
            } else {
                trace!(from = %src, peer = ?hb.node, "Heartbeat from unknown peer");
            }
        }

        ControlPacket::Advert(advert) => {
            let _ = ctx
                .commands_tx
                .send(Command::AdvertReceived { advert, src })
                .await;
        }

        ControlPacket::Bye(bye) => {
            debug!(peer = ?bye.node, "Peer said goodbye");
            let _ = ctx
                .commands_tx
                .send(Command::Teardown {
                    node: bye.node,
                    reason: DisconnectReason::PeerBye,
                })
                .await;
        }
    }
}
