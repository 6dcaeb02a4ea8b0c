use clap::Parser;
use common::{EnvelopeBuilder, Result, SenderConfig};
use device::logging::setup_logger;
use device::transport::TransportChoice;
use device::{
    open_store, FanOut, HttpRenewer, LogSink, RealtimeSender, RetryPolicy, SendCycle, SendStats,
    SimulatedSensor,
};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const BANNER: &str = r#"
╔═══════════════════════════════════════════════════════════════════╗
║                                                                   ║
║    Sensor Ingest Realtime Sender v0.1.0                           ║
║    Continuous HTTP / MQTT delivery with secret rotation           ║
║                                                                   ║
╚═══════════════════════════════════════════════════════════════════╝
"#;

#[derive(Parser)]
struct Args {
    #[arg(long, value_enum, default_value = "both")]
    transport: TransportChoice,

    /// Seconds between readings. Overrides SEND_INTERVAL_SECS.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    interval_secs: Option<u64>,

    /// Stop after this many ticks instead of waiting for Ctrl-C.
    #[arg(long)]
    max_cycles: Option<u64>,

    #[arg(long)]
    device_id: Option<String>,

    #[arg(long)]
    endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logger();
    println!("{}", BANNER);

    let args = Args::parse();
    let mut config = SenderConfig::load()?;
    if let Some(secs) = args.interval_secs {
        config.interval = Duration::from_secs(secs);
    }
    if let Some(device_id) = args.device_id {
        config.device_id = device_id;
    }
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }

    info!("Device ID: {}", config.device_id);
    info!("Endpoint: {}", config.endpoint);
    info!("MQTT broker: {}:{} topic {}", config.mqtt.host, config.mqtt.port, config.mqtt.topic);

    let store = open_store(&config.store, &config.device_id).await?;
    let builder = Arc::new(EnvelopeBuilder::from_kind(config.codec));
    let renewer = Arc::new(HttpRenewer::new(&config.endpoint, config.http_timeout)?);
    let stats = Arc::new(SendStats::new());
    let events = Arc::new(FanOut::new().with(Arc::new(LogSink)).with(stats.clone()));

    let cycle = SendCycle::new(Arc::from(store), builder, renewer, events)
        .with_retry(RetryPolicy::from_config(&config));
    let mut sender = RealtimeSender::new(
        cycle,
        SimulatedSensor::new(config.timestamp_unit),
        config.device_id.clone(),
        config.interval,
        stats,
    )?
    .with_max_cycles(args.max_cycles);
    for transport in args.transport.build(&config)? {
        sender = sender.with_transport(transport);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, finishing the current cycle");
        }
        if let Err(e) = shutdown_tx.send(true) {
            error!("Failed to send shutdown signal: {}", e);
        }
    });

    let summary = sender.run(shutdown_rx).await;
    summary.print_report();

    Ok(())
}
