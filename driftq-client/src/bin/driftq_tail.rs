//! Consume a driftq topic and write message bodies to stdout.

use std::io::Write;

use async_trait::async_trait;
use clap::Parser;
use driftq::protocol::Message;
use driftq_client::{DriftqClientError, Handler, HandlerError, Reader};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "driftq-tail")]
#[command(about = "Consume a driftq topic and write message bodies to stdout")]
struct Args {
    #[arg(long)]
    topic: String,

    #[arg(long, default_value = "driftq-tail")]
    channel: String,

    #[arg(long, default_value = "200")]
    max_in_flight: i64,

    /// Broker TCP address (may be given multiple times)
    #[arg(long = "broker-tcp-address")]
    broker_tcp_address: Vec<String>,

    /// Lookup directory HTTP address (may be given multiple times)
    #[arg(long = "lookup-http-address")]
    lookup_http_address: Vec<String>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

struct TailHandler;

#[async_trait]
impl Handler for TailHandler {
    async fn handle_message(&self, message: &Message) -> Result<(), HandlerError> {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&message.body)?;
        stdout.write_all(b"\n")?;
        Ok(())
    }

    fn log_failed_message(&self, message: &Message) {
        warn!(id = %message.id, attempts = message.attempts, "giving up on message");
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> driftq_client::Result<()> {
    if args.max_in_flight <= 0 {
        return Err(DriftqClientError::invalid_config(
            "--max-in-flight must be positive",
        ));
    }
    if args.broker_tcp_address.is_empty() && args.lookup_http_address.is_empty() {
        return Err(DriftqClientError::invalid_config(
            "--broker-tcp-address or --lookup-http-address required",
        ));
    }
    if !args.broker_tcp_address.is_empty() && !args.lookup_http_address.is_empty() {
        return Err(DriftqClientError::invalid_config(
            "use --broker-tcp-address or --lookup-http-address, not both",
        ));
    }

    let reader = Reader::new(&args.topic, &args.channel)?;
    reader.set_max_in_flight(args.max_in_flight);
    reader.add_handler(TailHandler);

    for addr in &args.broker_tcp_address {
        reader.connect_to_broker(addr).await?;
    }
    for addr in &args.lookup_http_address {
        reader.connect_to_lookup(addr)?;
    }

    info!(
        topic = %args.topic,
        channel = %args.channel,
        max_in_flight = args.max_in_flight,
        "consuming"
    );

    tokio::select! {
        _ = reader.wait() => {}
        _ = signal::ctrl_c() => {
            info!("interrupt received, shutting down gracefully");
            reader.stop();
            reader.wait().await;
        }
    }

    info!("driftq-tail shut down");
    Ok(())
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            eprintln!("invalid log level {:?}, defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
