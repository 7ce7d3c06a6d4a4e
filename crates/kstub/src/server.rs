//! TCP serve loop for the simulated machine.

use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use kstub_core::{Engine, EngineError};
use thiserror::Error;
use tracing::{debug, info};

use crate::sim::SimHost;

/// How long one transport poll waits for input; also the simulation tick.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Counters for a finished [`Server::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServeStats {
    pub sessions: usize,
}

/// Serves one debugger connection at a time against a [`SimHost`].
pub struct Server {
    engine: Engine<SimHost>,
    once: bool,
}

impl Server {
    pub const fn new(engine: Engine<SimHost>) -> Self {
        Self {
            engine,
            once: false,
        }
    }

    /// Stop after the first connection ends.
    #[must_use]
    pub const fn once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    pub const fn engine(&self) -> &Engine<SimHost> {
        &self.engine
    }

    /// Bind `addr` and serve. A leading `:` means localhost.
    pub fn run_addr(&self, addr: &str) -> Result<ServeStats, ServeError> {
        let addr = if addr.starts_with(':') {
            format!("127.0.0.1{addr}")
        } else {
            addr.to_string()
        };
        let listener = TcpListener::bind(&addr)?;
        info!(addr = %listener.local_addr()?, "waiting for debugger");
        self.run(&listener)
    }

    /// Accept connections on `listener` until `once` is satisfied or an
    /// error occurs. The engine is reset before each session.
    pub fn run(&self, listener: &TcpListener) -> Result<ServeStats, ServeError> {
        let mut stats = ServeStats::default();
        loop {
            let (stream, peer) = listener.accept()?;
            info!(%peer, "debugger connected");
            self.session(stream)?;
            stats.sessions += 1;
            info!(%peer, "debugger disconnected");
            if self.once {
                return Ok(stats);
            }
        }
    }

    fn session(&self, stream: TcpStream) -> Result<(), ServeError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        self.engine.reset()?;
        let host = self.engine.host();
        host.attach(stream);
        while host.is_connected() {
            self.engine.packet_available()?;
            host.tick(&self.engine)?;
        }
        debug!(halted = %self.engine.halted_mask(), "session ended");
        Ok(())
    }
}
