use std::time::Duration;
use tcbus::bridge::SimScheduler;
use tcbus::general::GeneralService;
use tcbus::link::PacketListener;
use tcbus::queues::{service_queues, ServiceConsumer, SERVICE_QUEUE_DEPTH};
use tcbus::router::Router;
use tracing::info;

const DEFAULT_ROUTER_PORT: u16 = 4800;
const DEFAULT_GENERAL_PORT: u16 = 4811;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("🛰️  Telecommand Dispatch Node");
    println!("=============================");

    let (queue_set, consumers) = service_queues(SERVICE_QUEUE_DEPTH);

    let router_listener = PacketListener::bind(("127.0.0.1", DEFAULT_ROUTER_PORT)).await?;
    let general_listener = PacketListener::bind(("127.0.0.1", DEFAULT_GENERAL_PORT)).await?;

    // Router and interpreter run as independent scheduled units, each with
    // its own accept loop.
    tokio::spawn(Router::new(queue_set).run(router_listener));
    tokio::spawn(GeneralService::new(SimScheduler::with_flight_tasks()).run(general_listener));

    // The real housekeeping and time-management services live outside this
    // core; these consumers drain their queues and log what arrives.
    tokio::spawn(drain_service_queue(consumers.housekeeping));
    tokio::spawn(drain_service_queue(consumers.time_management));

    println!("📡 Router on port {DEFAULT_ROUTER_PORT}, general service on port {DEFAULT_GENERAL_PORT}");
    println!("   Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    println!("🚀 Telecommand node stopped");
    Ok(())
}

async fn drain_service_queue(mut consumer: ServiceConsumer) {
    loop {
        if let Some(packet) = consumer.dequeue(Duration::from_millis(500)).await {
            info!(
                port = ?consumer.port(),
                len = packet.len(),
                subservice = ?packet.subservice(),
                "service packet dequeued"
            );
        }
    }
}
