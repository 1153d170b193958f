// src/main.rs

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{Local, NaiveDateTime, Utc};
use clap::Parser;
use crossbeam::channel::{Receiver, Sender, bounded, tick, unbounded};
use log::{error, info};

use stream_archiver::archive::{FsStorage, HourlyLayout, RotationController, Shutdown};
use stream_archiver::broadcast::{
    BroadcastSession, HttpStreamOpener, chunk_channel, quit_signal, run_fetcher,
};
use stream_archiver::config::{Cli, Config};
use stream_archiver::error::ArchiverResult;

fn main() -> anyhow::Result<()> {
    // ------------------------------------------------------------
    // Config
    // ------------------------------------------------------------
    let cfg = Cli::parse().resolve()?;

    let default_level = if cfg.quiet { "info" } else { "debug" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    info!("[archiver] starting archiver");

    // ------------------------------------------------------------
    // Graceful shutdown
    // ------------------------------------------------------------
    let (stop_tx, stop_rx) = unbounded::<Shutdown>();
    {
        let stop = stop_tx.clone();
        ctrlc::set_handler(move || {
            info!("[archiver] shutdown requested");
            let _ = stop.send(Shutdown::Now);
        })?;
    }

    // ------------------------------------------------------------
    // Fetcher
    // ------------------------------------------------------------
    let (chunk_tx, chunk_rx) = chunk_channel(cfg.archive.channel_capacity);
    let (quit_tx, quit_rx) = quit_signal();
    let session = BroadcastSession::new(cfg.stream.url.clone(), chunk_tx, quit_rx)
        .with_retry(cfg.stream.max_retries, cfg.stream.retry_backoff())
        .with_chunk_size(cfg.stream.chunk_size);
    let fetcher = start_fetcher(&cfg, session, stop_tx);

    // ------------------------------------------------------------
    // Archive rotation
    // ------------------------------------------------------------
    let utc = cfg.archive.utc;
    let clock = move || -> NaiveDateTime {
        if utc {
            Utc::now().naive_utc()
        } else {
            Local::now().naive_local()
        }
    };

    let layout = HourlyLayout::new(
        cfg.archive.dest.clone(),
        cfg.archive.file_prefix.clone(),
        cfg.archive.extension.clone(),
    );
    let controller = RotationController::start(
        chunk_rx,
        Arc::new(FsStorage),
        Box::new(layout),
        clock(),
    )
    .with_context(|| {
        format!(
            "cannot write archives under {}",
            cfg.archive.dest.display()
        )
    })?;

    // ------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------
    info!("[archiver] running – Ctrl+C to stop");
    let ticks = tick(Duration::from_secs(1));
    controller.run(&ticks, &stop_rx, clock);

    // ------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------
    drop(quit_tx);

    // a fetcher stuck in a network read is left to process exit
    if let Ok(Err(e)) = fetcher.try_recv() {
        error!("[archiver] stream fetcher gave up: {}", e);
        return Err(e.into());
    }

    info!("[archiver] shutdown complete");
    Ok(())
}

fn start_fetcher(
    cfg: &Config,
    mut session: BroadcastSession,
    stop: Sender<Shutdown>,
) -> Receiver<ArchiverResult<()>> {
    let (done_tx, done_rx) = bounded(1);
    let mut opener = HttpStreamOpener::new(cfg.stream.connect_timeout(), cfg.stream.read_timeout());

    info!(
        "[archiver] fetching {} (max_retries={})",
        session.url(),
        session.max_retries()
    );

    std::thread::spawn(move || {
        let result = run_fetcher(&mut session, &mut opener);
        if let Err(e) = &result {
            error!("[fetcher] fatal: {}", e);
        }
        // the writer drains until the last chunk sender is gone
        drop(session);
        // result first, so it is waiting once the stop is seen
        let _ = done_tx.send(result);
        let _ = stop.send(Shutdown::Drain);
    });

    done_rx
}
