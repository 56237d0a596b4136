//! Local detection service answering every frame with a canned box

use std::time::Duration;

use argus::detection::{MockDetector, MockOptions};
use argus::pipeline::StopFlag;
use clap::Parser;
use color_eyre::Result;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Mock object-detection service", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8888")]
    listen: String,

    /// Class label reported for every frame
    #[arg(long, default_value = "person")]
    class_name: String,

    #[arg(long, default_value_t = 0.9)]
    confidence: f32,

    /// Simulated inference time in milliseconds
    #[arg(long, default_value_t = 50)]
    delay_ms: u64,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mock_detector=info,argus=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    let options = MockOptions {
        class_name: args.class_name,
        confidence: args.confidence,
        delay: Duration::from_millis(args.delay_ms),
        ..MockOptions::default()
    };

    let detector = MockDetector::bind(&args.listen, options)?;
    info!("Mock detector bound to {}", detector.local_addr()?);
    detector.serve(StopFlag::new());
    Ok(())
}
