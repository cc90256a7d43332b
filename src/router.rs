use crate::link::{builtin_service_reply, PacketListener};
use crate::packet::ServicePort;
use crate::queues::ServiceQueueSet;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RouterStats {
    pub connections_accepted: u32,
    pub packets_queued: u32,
    pub packets_dropped: u32,
    pub builtin_delegated: u32,
}

/// Demultiplexes inbound traffic on the primary listening socket: packets
/// for a registered service go to that service's bounded queue, everything
/// else is delegated to the transport's built-in handler. The router never
/// synthesizes a reply for queued traffic; that is the consumer's job.
#[derive(Debug)]
pub struct Router {
    queues: ServiceQueueSet,
    stats: RouterStats,
    started: Instant,
}

impl Router {
    pub fn new(queues: ServiceQueueSet) -> Self {
        Self {
            queues,
            stats: RouterStats::default(),
            started: Instant::now(),
        }
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Counters as one JSON object, for the per-connection stats line.
    pub fn stats_json(&self) -> String {
        serde_json::to_string(&self.stats).unwrap_or_default()
    }

    pub async fn run(mut self, listener: PacketListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "telecommand router listening");
        }
        loop {
            let mut conn = match listener.accept().await {
                Ok(Some(conn)) => conn,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "router accept failed");
                    continue;
                }
            };
            self.stats.connections_accepted += 1;
            debug!(peer = %conn.peer_addr(), "router connection up");

            // Drain the connection; each packet's ownership moves exactly
            // once, into a queue, the built-in handler, or the drop below.
            while let Some(packet) = conn.read_packet().await {
                match ServicePort::from_number(packet.dst_port()) {
                    Some(port) if self.queues.is_registered(port) => {
                        match self.queues.enqueue(port, packet).await {
                            Ok(()) => self.stats.packets_queued += 1,
                            Err(e) => {
                                // Best-effort delivery: report and release,
                                // never retry.
                                warn!(?port, error = %e, "failed to queue packet, released");
                                self.stats.packets_dropped += 1;
                            }
                        }
                    }
                    _ => {
                        self.stats.builtin_delegated += 1;
                        let uptime_secs = self.started.elapsed().as_secs() as u32;
                        builtin_service_reply(&mut conn, packet, uptime_secs).await;
                    }
                }
            }
            info!(peer = %conn.peer_addr(), stats = %self.stats_json(), "router connection exhausted");
        }
    }
}
