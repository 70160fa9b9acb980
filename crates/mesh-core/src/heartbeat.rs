use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mesh_protocol::now_us;
use mesh_protocol::packets::HeartbeatPacket;

use crate::context::MeshContext;
use crate::manager::{Command, DisconnectReason};
use crate::router::MidiRouter;

/// Heartbeat monitor: the system's sole failure detector.
///
/// Every interval it sends a heartbeat on each live connection, evicts
/// peers whose last received heartbeat is older than the miss threshold,
/// and flushes reorder gaps that have outlived the skip timeout.
pub async fn run(ctx: Arc<MeshContext>, router: Arc<MidiRouter>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(ctx.config.heartbeat_interval());
    let timeout = ctx.config.heartbeat_timeout();
    let mut buf = [0u8; HeartbeatPacket::SIZE];

    debug!(
        interval_ms = ctx.config.mesh.heartbeat_interval_ms,
        timeout_ms = timeout.as_millis() as u64,
        "Heartbeat monitor started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                sweep(&ctx, &router, Instant::now(), timeout, &mut buf).await;
            }
        }
    }

    debug!("Heartbeat monitor stopped");
}

/// One monitor pass. Separated from the timer loop so liveness math is
/// testable with an explicit `now`.
pub(crate) async fn sweep(
    ctx: &Arc<MeshContext>,
    router: &Arc<MidiRouter>,
    now: Instant,
    timeout: Duration,
    buf: &mut [u8; HeartbeatPacket::SIZE],
) {
    for conn in ctx.pool.list_active() {
        let elapsed = conn.heartbeat_rx_elapsed(now);
        if elapsed > timeout {
            warn!(
                peer = ?conn.peer.id,
                silent_ms = elapsed.as_millis() as u64,
                "Peer heartbeat timed out, evicting"
            );
            let _ = ctx
                .commands_tx
                .send(Command::Teardown {
                    node: conn.peer.id,
                    reason: DisconnectReason::HeartbeatTimeout,
                })
                .await;
            continue;
        }

        let hb = HeartbeatPacket {
            node: ctx.local_id(),
            sequence: conn.next_heartbeat_seq(),
            timestamp_us: now_us(),
        };
        hb.encode(buf);
        ctx.send_control(buf, conn.peer.control_addr).await;
        conn.mark_heartbeat_sent();

        // A reorder gap older than the skip timeout will never fill
        for packet in conn.flush_reorder(now) {
            router.handle_packet(packet);
        }
    }
}
