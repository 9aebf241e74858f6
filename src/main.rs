//! camrelay: relay a reconnecting camera stream to a paced sink

use std::path::PathBuf;
use std::time::Duration;

use camrelay::capture::{Source, TestPatternSource};
#[cfg(not(feature = "gstreamer-pipeline"))]
use camrelay::sink::LogSink;
use camrelay::sink::Sink;
use camrelay::utils::{redact_credentials, SourceKind};
use camrelay::{Config, Relay};
use color_eyre::Result;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camrelay=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camrelay launching...");

    // Load configuration
    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    info!(
        "Relaying {} ({}x{} {:?})",
        redact_credentials(&config.source.address),
        config.output.width,
        config.output.height,
        config.output.format
    );

    let sink = build_sink(&config)?;
    match SourceKind::detect(&config.source.address) {
        SourceKind::TestPattern => {
            let source = TestPatternSource::new(&config.output, config.pipeline.fps)?
                .with_address_options(&config.source.address);
            run(config, source, sink).await
        }
        #[cfg(feature = "gstreamer-pipeline")]
        SourceKind::Network => {
            let source = camrelay::capture::GstSource::new(&config.source, &config.output)?;
            run(config, source, sink).await
        }
        #[cfg(not(feature = "gstreamer-pipeline"))]
        SourceKind::Network => Err(color_eyre::eyre::eyre!(
            "network sources need the `gstreamer-pipeline` feature"
        )),
    }
}

#[cfg(feature = "gstreamer-pipeline")]
fn build_sink(config: &Config) -> Result<Box<dyn Sink>> {
    if config.output.sink_pipeline.is_some() {
        let sink = camrelay::sink::GstSink::new(&config.output, config.pipeline.fps)?;
        return Ok(Box::new(sink));
    }
    let sink = camrelay::sink::RtspServerSink::new(&config.output, config.pipeline.fps)?;
    info!("Republishing at {}", sink.url());
    Ok(Box::new(sink))
}

#[cfg(not(feature = "gstreamer-pipeline"))]
fn build_sink(config: &Config) -> Result<Box<dyn Sink>> {
    if config.output.sink_pipeline.is_some() {
        tracing::warn!("sink_pipeline ignored without the `gstreamer-pipeline` feature");
    }
    Ok(Box::new(LogSink::new(config.output.log_every)))
}

async fn run<S: Source>(config: Config, source: S, sink: Box<dyn Sink>) -> Result<()> {
    let relay = Relay::start(&config, source, sink)?;

    let mut report = tokio::time::interval(Duration::from_secs(10));
    report.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                let stats = relay.stats();
                info!(
                    state = %stats.source_state,
                    occupancy = stats.buffer.occupancy,
                    forwarded = stats.pacer.frames_forwarded,
                    evicted = stats.buffer.frames_evicted,
                    rejected = stats.pacer.frames_rejected,
                    restarts = stats.source_restarts,
                    "relay stats"
                );
            }
        }
    }

    info!("Interrupt received");
    // Joins worker threads, keep it off the async runtime
    tokio::task::spawn_blocking(move || relay.shutdown()).await??;

    info!("camrelay shutting down");
    Ok(())
}
