//! Simple consumer example for the driftq client

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use driftq::protocol::Message;
use driftq_client::{Handler, HandlerError, Reader, ReaderConfig, Result};

struct CountingHandler {
    seen: Arc<AtomicU64>,
}

#[async_trait]
impl Handler for CountingHandler {
    async fn handle_message(&self, message: &Message) -> std::result::Result<(), HandlerError> {
        let n = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        println!(
            "message {}: id={} attempts={} body={}",
            n,
            message.id,
            message.attempts,
            String::from_utf8_lossy(&message.body)
        );
        Ok(())
    }

    fn log_failed_message(&self, message: &Message) {
        eprintln!("giving up on {}", message.id);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("driftq simple consumer example");
    println!("==============================");

    let seen = Arc::new(AtomicU64::new(0));

    let config = ReaderConfig::builder().max_in_flight(10).build();
    let reader = Reader::with_config("example-topic", "example-channel", config)?;
    reader.add_handler(CountingHandler {
        seen: Arc::clone(&seen),
    });

    reader.connect_to_broker("127.0.0.1:4150").await?;
    println!("connected; consuming example-topic/example-channel (ctrl-c to stop)");

    tokio::select! {
        _ = reader.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("stopping...");
            reader.stop();
            reader.wait().await;
        }
    }

    println!("consumed {} messages", seen.load(Ordering::SeqCst));
    Ok(())
}
