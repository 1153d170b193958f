// src/broadcast/fetcher.rs

use std::io::Read;

use bytes::Bytes;
use crossbeam::channel::select;
use log::{debug, error, info, warn};

use super::{BroadcastSession, FetchEvent, StreamOpener};
use crate::error::{ArchiverError, ArchiverResult};

/// Streams the broadcast into the session's chunk channel.
///
/// Returns `Ok(())` when the quit signal fires or every receiver is gone,
/// and `RetryBudgetExhausted` once `max_retries` consecutive attempts failed.
/// The budget is checked before every connection attempt, including the first.
pub fn run_fetcher<O>(session: &mut BroadcastSession, opener: &mut O) -> ArchiverResult<()>
where
    O: StreamOpener + ?Sized,
{
    loop {
        if session.retry.exhausted() {
            error!(
                "[fetcher] too many error recovery retries ({}) for {}",
                session.retry.count(),
                session.url()
            );
            session.emit(FetchEvent::Exhausted {
                retries: session.retry.count(),
            });
            return Err(ArchiverError::RetryBudgetExhausted {
                url: session.url().to_string(),
                retries: session.retry.count(),
            });
        }

        match stream_broadcast(session, opener) {
            Ok(()) => {
                session.emit(FetchEvent::Stopped);
                return Ok(());
            }
            Err(err) => {
                warn!("[fetcher] {}", err);
                session.increment_retry();
            }
        }

        if session.quit_fired() {
            info!("[fetcher] stopping stream from quit signal");
            session.emit(FetchEvent::Stopped);
            return Ok(());
        }
    }
}

/// One connection: open, then pump chunks until quit or an error.
fn stream_broadcast<O>(session: &mut BroadcastSession, opener: &mut O) -> ArchiverResult<()>
where
    O: StreamOpener + ?Sized,
{
    info!("[fetcher] streaming broadcast from {}", session.url());
    session.emit(FetchEvent::Connecting);

    let mut stream = opener
        .open(session.url())
        .map_err(|e| ArchiverError::open(session.url(), e))?;

    let result = pump(session, &mut stream);
    drop(stream);
    if result.is_err() {
        debug!("[fetcher] closed connection to {}", session.url());
    }
    result
}

fn pump(session: &mut BroadcastSession, stream: &mut dyn Read) -> ArchiverResult<()> {
    loop {
        // read_exact fails on a short read, so no partial chunk ever leaves here
        let mut buf = vec![0u8; session.chunk_size()];
        stream
            .read_exact(&mut buf)
            .map_err(|e| ArchiverError::read(session.url(), e))?;

        session.reset_retry_count();

        let chunk = Bytes::from(buf);
        select! {
            recv(session.quit) -> _ => {
                info!("[fetcher] stopping stream from quit signal");
                return Ok(());
            }
            send(session.chunks, chunk) -> res => {
                if res.is_err() {
                    info!("[fetcher] no archive writer left, stopping stream");
                    return Ok(());
                }
            }
        }
    }
}
