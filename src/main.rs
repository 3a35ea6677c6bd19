//! Application entry point: one conversation turn from a recorded file.
//!
//! # Usage
//!
//! ```text
//! voice-relay <utterance.wav> [output-dir]
//! ```
//!
//! # Startup sequence
//!
//! 1. Initialise logging (`RUST_LOG`, default `info`).
//! 2. Load [`AppConfig`] from disk (returns default on first run).
//! 3. Create the [`tokio`] runtime.
//! 4. Start the shared services (queue scheduler, pool reaper, cache sweeper).
//! 5. Build a session over the HTTP backends; reply clips are written to
//!    `output-dir` in playback order.
//! 6. Run the turn, printing lifecycle events as they arrive.
//! 7. Shut the services down.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use voice_relay::{
    backend::FilePlayer,
    config::{AppConfig, AppPaths},
    pipeline::ConversationEvent,
    services::Services,
};

fn main() -> Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let Some(input) = args.next().map(PathBuf::from) else {
        bail!("usage: voice-relay <utterance.wav> [output-dir]");
    };
    let output_dir = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| AppPaths::new().output_dir);

    // 2. Configuration
    let config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });

    let audio = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;

    // 3. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(async move {
        // 4. Services
        let services = Services::start(&config);

        // 5. Session
        let player = Arc::new(FilePlayer::new(&output_dir, "mp3"));
        let session = services.session(&config, player);

        let health = session.health_check().await;
        if !health.is_healthy() {
            log::warn!("Backends not fully reachable: {health:?}");
        }

        // 6. Turn
        let mut events = session.subscribe();
        let printer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ConversationEvent::Message { role, content } => println!("{role}: {content}"),
                    ConversationEvent::SpeechStart { seq, text } => println!("  ▶ [{seq}] {text}"),
                    ConversationEvent::Error { message } => eprintln!("error: {message}"),
                    ConversationEvent::TurnEnd { .. } => break,
                    other => log::debug!("{other:?}"),
                }
            }
        });

        let result = session.run_turn(audio.into()).await;
        let _ = printer.await;

        // 7. Shutdown
        drop(session);
        services.shutdown().await;

        let outcome = result?;
        println!(
            "{} sentence(s) written to {} ({:?})",
            outcome.spoken.len(),
            output_dir.display(),
            outcome.kind
        );
        Ok::<_, anyhow::Error>(())
    })
}
