//! Logging system demonstration
//!
//! Publishes the events of a short, simulated sync pass on an [`EventBus`] and
//! mirrors them into the log.
//!
//! Run with:
//! ```bash
//! # Pretty format (default in debug)
//! cargo run --example logging_demo
//!
//! # JSON format
//! cargo run --example logging_demo -- json
//!
//! # Compact format with a custom filter
//! cargo run --example logging_demo -- compact "core_runtime=trace"
//! ```

use core_library::{AssetKind, SongId};
use core_runtime::events::{EventBus, PassEvent, SongEvent, SongOutcome, SongPhase};
use core_runtime::logging::{
    init_logging, redact_url, spawn_event_logger, strip_path, LogFormat, LogLevel, LoggingConfig,
};
use std::env;
use std::time::Duration;
use tracing::{info, instrument};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let format = match args.get(1).map(String::as_str) {
        Some("json") => LogFormat::Json,
        Some("compact") => LogFormat::Compact,
        Some("pretty") => LogFormat::Pretty,
        _ => LogFormat::default(),
    };

    let mut config = LoggingConfig::default()
        .with_format(format)
        .with_level(LogLevel::Debug)
        .with_spans(true);
    if let Some(filter) = args.get(2) {
        config = config.with_filter(filter.clone());
    }
    init_logging(config)?;
    info!(format = ?format, "Logging initialized");

    let bus = EventBus::new(64);
    let logger = spawn_event_logger(&bus);

    simulated_pass(&bus).await?;

    drop(bus);
    logger.await?;
    Ok(())
}

#[instrument(skip(bus))]
async fn simulated_pass(bus: &EventBus) -> Result<(), Box<dyn std::error::Error>> {
    let pass_id = "demo-pass".to_string();
    bus.pass(PassEvent::Started {
        pass_id: pass_id.clone(),
        root: "/srv/karaoke".to_string(),
    });
    bus.pass(PassEvent::Planned {
        pass_id: pass_id.clone(),
        creates: 1,
        updates: 0,
        removes: 0,
        skips: 3,
        deferred_removals: 0,
    });

    let song = SongId::new(4711)?;
    let cover_url = "https://usdb.example/cover?id=4711&sid=session-cookie";
    info!(url = %redact_url(cover_url), "Fetching cover");
    bus.song(SongEvent::new(song, SongPhase::Fetching).with_asset(AssetKind::Cover));
    tokio::time::sleep(Duration::from_millis(10)).await;
    bus.song(
        SongEvent::new(song, SongPhase::Staged)
            .with_asset(AssetKind::Cover)
            .with_outcome(SongOutcome::AssetFailed {
                error: "NetworkError (HTTP 404)".to_string(),
            }),
    );

    info!(
        file = %strip_path("/srv/karaoke/Band - Track/Band - Track.txt"),
        "Committing notes"
    );
    bus.song(SongEvent::new(song, SongPhase::Finished).with_outcome(SongOutcome::Created));

    bus.pass(PassEvent::Finished {
        pass_id,
        created: 1,
        updated: 0,
        removed: 0,
        skipped: 3,
        failed: 1,
        cancelled: 0,
    });
    Ok(())
}
