#![forbid(unsafe_code)]

use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGINT or SIGTERM.
    Shutdown,
    /// SIGUSR1.
    DumpStatus,
}

/// Signal streams the daemon reacts to.
#[derive(Debug)]
pub struct Signals {
    interrupt: Signal,
    terminate: Signal,
    user1: Signal,
}

impl Signals {
    /// Install the handlers. Must be called from within the runtime.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            user1: signal(SignalKind::user_defined1())?,
        })
    }

    /// Wait for the next signal of interest.
    pub async fn recv(&mut self) -> SignalEvent {
        let event = tokio::select! {
            _ = self.interrupt.recv() => SignalEvent::Shutdown,
            _ = self.terminate.recv() => SignalEvent::Shutdown,
            _ = self.user1.recv() => SignalEvent::DumpStatus,
        };
        debug!(?event, "received signal");
        event
    }
}
