//! puff-record: records the synthetic test pattern and a tone into an MP4 file
//!
//! Usage: `puff-record [settings.json] [seconds]`

use anyhow::Context;
use puff_recorder::capture::{TestPatternSource, ToneSource};
use puff_recorder::{
    list_streams, ErrorResponse, PipelineConfig, Recorder, RecorderBackend, RecorderSettings, RecordingEvent,
    StreamSet,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    puff_recorder::init_tracing();

    let mut args = std::env::args().skip(1);
    let settings = match args.next() {
        Some(path) => RecorderSettings::load(Path::new(&path))
            .with_context(|| format!("failed to load settings from {}", path))?,
        None => RecorderSettings::default(),
    };
    let seconds: f64 = match args.next() {
        Some(value) => value
            .parse()
            .with_context(|| format!("invalid duration: {}", value))?,
        None => 3.0,
    };

    tracing::info!("Starting puff-record v{}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::new(640, 360).with_stream_set(StreamSet::VideoAndAudio);
    let backend = RecorderBackend::default()
        .with_mirror(Box::new(TestPatternSource::new(30)))
        .with_audio(Box::new(ToneSource::new(440.0)));
    let recorder = Arc::new(Recorder::create(config.clone(), settings, backend)?);

    let mut events = recorder.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RecordingEvent::Stopped) => break,
                Ok(event) => tracing::info!("Event: {:?}", event),
                Err(RecvError::Lagged(skipped)) => tracing::warn!("Event log lagged by {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    recorder.start_record(config.stream_set)?;
    tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;

    let stopper = recorder.clone();
    let result = tokio::task::spawn_blocking(move || stopper.end_record()).await?;
    let _ = event_log.await;

    match result {
        Ok(Some(output)) => {
            println!("{}", serde_json::to_string_pretty(&output)?);

            match list_streams(&output.path) {
                Ok(streams) => {
                    for stream in streams {
                        println!(
                            "{} stream: codec={} packets={}",
                            stream.codec_type,
                            stream.codec_name.as_deref().unwrap_or("unknown"),
                            stream.packets()
                        );
                    }
                }
                Err(e) => tracing::warn!("Could not list streams of {:?}: {}", output.path, e),
            }
        }
        Ok(None) => tracing::warn!("Recorder was not recording"),
        Err(e) => {
            let response = ErrorResponse::from(e);
            eprintln!("{}", serde_json::to_string_pretty(&response)?);
            std::process::exit(1);
        }
    }

    Ok(())
}
