use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use mesh_protocol::packets::MidiPacket;
use mesh_protocol::MAX_DATAGRAM;

use crate::context::MeshContext;
use crate::router::MidiRouter;

/// Data-plane receiver: decodes MIDI packets off the shared data socket,
/// runs them through the owning connection's reorder buffer, and hands
/// in-order deliveries to the router. Malformed datagrams and packets
/// from unknown sources are counted and dropped, never fatal.
pub async fn run(ctx: Arc<MeshContext>, router: Arc<MidiRouter>, cancel: CancellationToken) {
    let socket = Arc::clone(&ctx.data_socket);
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = socket.recv_from(&mut buf) => match result {
                Ok((len, src)) => {
                    let packet = match MidiPacket::decode(&buf[..len]) {
                        Ok(packet) => packet,
                        Err(e) => {
                            ctx.malformed.fetch_add(1, Ordering::Relaxed);
                            debug!(from = %src, error = %e, len = len, "Dropping malformed data datagram");
                            continue;
                        }
                    };

                    // Reorder streams belong to the *sending* connection:
                    // a relayed packet still carries its original source
                    // node id but its sequence numbers come from the hop
                    // that sent it here.
                    let Some(conn) = ctx.pool.get_connected_by_data_addr(src) else {
                        router.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!(from = %src, source = ?packet.source, "Data from unknown sender, dropping");
                        continue;
                    };

                    for delivered in conn.accept_data(packet, Instant::now()) {
                        router.handle_packet(delivered);
                    }
                }
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::WouldBlock {
                        continue;
                    }
                    error!(error = %e, "Data socket receive error");
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    }

    debug!("Data plane stopped");
}
