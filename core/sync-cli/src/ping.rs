//! `tasksync ping`: connect, send `ping`, wait for `pong`.

use crate::identity::resolve_device_id;
use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use tasksync_core::{handler, load_config, ConnectionState, LineTransport, SyncError, SyncSession};
use tasksync_protocol::events;
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum PingError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Timed out after {timeout_ms} ms waiting to {stage}")]
    Timeout { stage: &'static str, timeout_ms: u64 },

    #[error("Could not connect to {endpoint}")]
    Unreachable { endpoint: String },

    #[error("Connection dropped before pong")]
    Dropped,
}

#[derive(Debug, Clone)]
pub struct PingOptions {
    pub user: String,
    pub endpoint: Option<String>,
    pub config: Option<PathBuf>,
    pub timeout_ms: u64,
}

/// Returns the round-trip time from sending `ping` to receiving `pong`.
pub fn run(options: &PingOptions) -> Result<Duration, PingError> {
    let mut config = load_config(options.config.as_deref())?;
    if let Some(endpoint) = &options.endpoint {
        config.connection.endpoint = endpoint.clone();
    }
    let endpoint = config.connection.endpoint.clone();
    let timeout = Duration::from_millis(options.timeout_ms);

    let device_id = resolve_device_id(None);
    let mut session = SyncSession::new(config, Box::new(LineTransport::new()), device_id)?;
    let pongs = Rc::new(Cell::new(0u32));
    {
        let pongs = Rc::clone(&pongs);
        session.dispatcher().subscribe(
            events::PONG,
            handler(move |_| {
                pongs.set(pongs.get() + 1);
                Ok(())
            }),
        );
    }

    session.start(&options.user, Vec::new())?;
    let deadline = Instant::now() + timeout;
    while !session.is_connected() {
        session.pump();
        if session.state() == ConnectionState::Failed {
            return Err(PingError::Unreachable { endpoint });
        }
        if Instant::now() >= deadline {
            session.shutdown();
            return Err(PingError::Timeout {
                stage: "connect",
                timeout_ms: options.timeout_ms,
            });
        }
        thread::sleep(POLL_INTERVAL);
    }

    let sent_at = Instant::now();
    if !session.ping() {
        session.shutdown();
        return Err(PingError::Dropped);
    }
    let deadline = sent_at + timeout;
    let result = loop {
        session.pump();
        if pongs.get() > 0 {
            break Ok(sent_at.elapsed());
        }
        if !session.is_connected() {
            break Err(PingError::Dropped);
        }
        if Instant::now() >= deadline {
            break Err(PingError::Timeout {
                stage: "receive pong",
                timeout_ms: options.timeout_ms,
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    session.shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    #[test]
    fn ping_round_trip_against_local_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let broker = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut writer = stream;
            let mut line = String::new();
            reader.read_line(&mut line).expect("handshake");
            line.clear();
            reader.read_line(&mut line).expect("ping");
            writer.write_all(b"{\"event\":\"pong\"}\n").expect("pong");
            line
        });

        let temp_dir = tempfile::tempdir().expect("temp dir");
        let options = PingOptions {
            user: "user-1".to_string(),
            endpoint: Some(format!("tcp://127.0.0.1:{}", port)),
            config: Some(temp_dir.path().join("missing.toml")),
            timeout_ms: 5_000,
        };
        run(&options).expect("ping");

        let ping_line = broker.join().expect("broker");
        assert!(ping_line.contains("\"ping\""));
    }
}
