use clap::Parser;
use common::{EnvelopeBuilder, Result, SenderConfig};
use device::logging::setup_logger;
use device::transport::TransportChoice;
use device::{
    open_store, CycleOutcome, FanOut, HttpRenewer, LogSink, RetryPolicy, SendCycle, SendStats,
    SimulatedSensor,
};
use log::{error, info, warn};
use std::sync::Arc;

const BANNER: &str = r#"
╔═══════════════════════════════════════════════════════════════════╗
║                                                                   ║
║    ██████╗ ███████╗██╗   ██╗██╗ ██████╗███████╗                   ║
║    ██╔══██╗██╔════╝██║   ██║██║██╔════╝██╔════╝                   ║
║    ██║  ██║█████╗  ██║   ██║██║██║     █████╗                     ║
║    ██║  ██║██╔══╝  ╚██╗ ██╔╝██║██║     ██╔══╝                     ║
║    ██████╔╝███████╗ ╚████╔╝ ██║╚██████╗███████╗                   ║
║    ╚═════╝ ╚══════╝  ╚═══╝  ╚═╝ ╚═════╝╚══════╝                   ║
║                                                                   ║
║    Sensor Ingest Device v0.1.0                                    ║
╚═══════════════════════════════════════════════════════════════════╝
"#;

/// Sends one simulated reading and exits.
#[derive(Parser)]
struct Args {
    #[arg(long, value_enum, default_value = "http")]
    transport: TransportChoice,

    /// Overrides DEVICE_ID.
    #[arg(long)]
    device_id: Option<String>,

    /// Overrides INGEST_ENDPOINT.
    #[arg(long)]
    endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logger();
    println!("{}", BANNER);

    let args = Args::parse();
    let mut config = SenderConfig::load()?;
    if let Some(device_id) = args.device_id {
        config.device_id = device_id;
    }
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }

    info!("Device ID: {}", config.device_id);
    info!("Endpoint: {}", config.endpoint);
    info!("Codec: {}", config.codec.as_str());
    info!("Timestamp unit: {}", config.timestamp_unit.as_str());
    info!("Secret store: {:?}", config.store);

    let store = open_store(&config.store, &config.device_id).await?;
    let builder = Arc::new(EnvelopeBuilder::from_kind(config.codec));
    let renewer = Arc::new(HttpRenewer::new(&config.endpoint, config.http_timeout)?);
    let stats = Arc::new(SendStats::new());
    let events = Arc::new(FanOut::new().with(Arc::new(LogSink)).with(stats.clone()));

    let cycle = SendCycle::new(Arc::from(store), builder, renewer, events)
        .with_retry(RetryPolicy::from_config(&config));
    let reading = SimulatedSensor::new(config.timestamp_unit).read()?;
    let transports = args.transport.build(&config)?;

    let mut failed = 0;
    for transport in &transports {
        match cycle.run(&config.device_id, &reading, transport.as_ref()).await {
            CycleOutcome::Delivered { rotated: true, .. } => {
                warn!("[{}] Secret was renewed; the store now holds the new secret", transport.kind());
            }
            CycleOutcome::Delivered { .. } => {}
            CycleOutcome::Failed(reason) => {
                error!("[{}] {}", transport.kind(), reason);
                failed += 1;
            }
        }
        transport.close().await;
    }

    stats.summary().print_report();

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
