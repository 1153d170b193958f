// src/broadcast/http.rs

use std::io::{self, Read};
use std::time::Duration;

use log::debug;

use super::StreamOpener;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens the upstream broadcast over HTTP with a shared ureq agent.
///
/// No read timeout unless one is configured: a hung read blocks the fetcher.
pub struct HttpStreamOpener {
    agent: ureq::Agent,
}

impl HttpStreamOpener {
    pub fn new(connect_timeout: Duration, read_timeout: Option<Duration>) -> Self {
        let mut builder = ureq::AgentBuilder::new().timeout_connect(connect_timeout);
        if let Some(timeout) = read_timeout {
            builder = builder.timeout_read(timeout);
        }
        Self {
            agent: builder.build(),
        }
    }
}

impl Default for HttpStreamOpener {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, None)
    }
}

impl StreamOpener for HttpStreamOpener {
    fn open(&mut self, url: &str) -> io::Result<Box<dyn Read + Send>> {
        let response = self.agent.get(url).call().map_err(|e| match e {
            ureq::Error::Status(code, response) => io::Error::other(format!(
                "http status {} {}",
                code,
                response.status_text()
            )),
            ureq::Error::Transport(transport) => io::Error::other(transport.to_string()),
        })?;

        debug!(
            "[http] connected to {} ({} {})",
            url,
            response.status(),
            response.content_type()
        );

        Ok(Box::new(response.into_reader()))
    }
}
