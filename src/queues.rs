use crate::packet::{CmdPacket, ServicePort};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::timeout;

/// Packets buffered per service before the router starts shedding.
pub const SERVICE_QUEUE_DEPTH: usize = 16;
/// Bounded wait for both enqueue and dequeue.
pub const QUEUE_WAIT_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    Full,
    Closed,
    Unregistered,
}

impl core::fmt::Display for QueueError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            QueueError::Full => write!(f, "Service queue full"),
            QueueError::Closed => write!(f, "Service queue consumer gone"),
            QueueError::Unregistered => write!(f, "No queue registered for port"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Sender half of the per-service FIFOs, held by the router. One bounded
/// queue per port that needs asynchronous processing; the queue primitive
/// itself provides all required mutual exclusion.
#[derive(Debug, Clone)]
pub struct ServiceQueueSet {
    housekeeping_tx: mpsc::Sender<CmdPacket>,
    time_management_tx: mpsc::Sender<CmdPacket>,
}

/// Receiver half, one consumer task per service.
#[derive(Debug)]
pub struct ServiceConsumer {
    port: ServicePort,
    rx: mpsc::Receiver<CmdPacket>,
}

#[derive(Debug)]
pub struct ServiceConsumers {
    pub housekeeping: ServiceConsumer,
    pub time_management: ServiceConsumer,
}

/// Build the fixed queue set. Sized once at process start.
pub fn service_queues(depth: usize) -> (ServiceQueueSet, ServiceConsumers) {
    let (housekeeping_tx, housekeeping_rx) = mpsc::channel(depth);
    let (time_management_tx, time_management_rx) = mpsc::channel(depth);
    (
        ServiceQueueSet {
            housekeeping_tx,
            time_management_tx,
        },
        ServiceConsumers {
            housekeeping: ServiceConsumer {
                port: ServicePort::Housekeeping,
                rx: housekeeping_rx,
            },
            time_management: ServiceConsumer {
                port: ServicePort::TimeManagement,
                rx: time_management_rx,
            },
        },
    )
}

impl ServiceQueueSet {
    pub fn is_registered(&self, port: ServicePort) -> bool {
        self.queue_for(port).is_some()
    }

    /// Bounded-timeout enqueue. On failure the packet has already been
    /// released; delivery is best-effort and never retried here.
    pub async fn enqueue(&self, port: ServicePort, packet: CmdPacket) -> Result<(), QueueError> {
        let tx = self.queue_for(port).ok_or(QueueError::Unregistered)?;
        match tx
            .send_timeout(packet, Duration::from_millis(QUEUE_WAIT_MS))
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(QueueError::Full),
            Err(SendTimeoutError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    fn queue_for(&self, port: ServicePort) -> Option<&mpsc::Sender<CmdPacket>> {
        match port {
            ServicePort::Housekeeping => Some(&self.housekeeping_tx),
            ServicePort::TimeManagement => Some(&self.time_management_tx),
            // The general service runs its own accept loop; nothing is
            // queued for it.
            ServicePort::General => None,
        }
    }
}

impl ServiceConsumer {
    pub fn port(&self) -> ServicePort {
        self.port
    }

    /// Bounded-timeout dequeue; `None` when nothing arrived in time.
    pub async fn dequeue(&mut self, wait: Duration) -> Option<CmdPacket> {
        timeout(wait, self.rx.recv()).await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn hk_packet(tag: u8) -> CmdPacket {
        CmdPacket::request(ServicePort::Housekeeping.number(), 0, &[tag]).unwrap()
    }

    #[tokio::test]
    async fn test_fifo_order_within_queue() {
        let (set, mut consumers) = service_queues(4);
        for tag in 0..3 {
            set.enqueue(ServicePort::Housekeeping, hk_packet(tag))
                .await
                .unwrap();
        }
        for tag in 0..3 {
            let packet = consumers
                .housekeeping
                .dequeue(Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(packet.in_data(), &[tag]);
        }
    }

    #[tokio::test]
    async fn test_full_queue_fails_within_bounded_wait() {
        let (set, _consumers) = service_queues(2);
        set.enqueue(ServicePort::Housekeeping, hk_packet(0)).await.unwrap();
        set.enqueue(ServicePort::Housekeeping, hk_packet(1)).await.unwrap();

        let start = Instant::now();
        let err = set
            .enqueue(ServicePort::Housekeeping, hk_packet(2))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();
        assert_eq!(err, QueueError::Full);
        // The full wait is honored, then shedding happens promptly; a
        // small scheduling margin on top of the configured window.
        assert!(elapsed >= Duration::from_millis(QUEUE_WAIT_MS), "waited {elapsed:?}");
        assert!(elapsed < Duration::from_millis(5 * QUEUE_WAIT_MS), "blocked {elapsed:?}");
    }

    #[tokio::test]
    async fn test_closed_queue_reported() {
        let (set, consumers) = service_queues(2);
        drop(consumers);
        let err = set
            .enqueue(ServicePort::TimeManagement, hk_packet(0))
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::Closed);
    }

    #[tokio::test]
    async fn test_general_port_has_no_queue() {
        let (set, _consumers) = service_queues(2);
        assert!(!set.is_registered(ServicePort::General));
        let err = set
            .enqueue(ServicePort::General, hk_packet(0))
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::Unregistered);
    }

    #[tokio::test]
    async fn test_empty_dequeue_times_out() {
        let (_set, mut consumers) = service_queues(2);
        let start = Instant::now();
        assert!(consumers
            .time_management
            .dequeue(Duration::from_millis(QUEUE_WAIT_MS))
            .await
            .is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(QUEUE_WAIT_MS), "returned early {elapsed:?}");
        assert!(elapsed < Duration::from_millis(5 * QUEUE_WAIT_MS), "blocked {elapsed:?}");
    }
}
