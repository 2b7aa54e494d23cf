//! Shutdown coordinator
//!
//! One cancellation token per run, handed to the listener or UDP session
//! at construction. SIGINT/SIGTERM and the `stop` hook both trigger it.
//! Relays already in flight are not cancelled; a second signal forces
//! them down.

use crate::logger::log;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    force: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observed by the forwarding loops
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request a stop. Returns immediately; idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    /// Stop without waiting for in-flight relays. Implies `trigger`.
    pub fn force(&self) {
        self.token.cancel();
        self.force.cancel();
    }

    pub fn is_forced(&self) -> bool {
        self.force.is_cancelled()
    }

    pub async fn forced(&self) {
        self.force.cancelled().await
    }

    /// Install SIGINT/SIGTERM handlers and spawn a task that triggers
    /// shutdown on the first signal and forces it on the second.
    ///
    /// Handlers are in place when this returns, so an early signal is never
    /// left to the default disposition.
    pub fn listen_for_signals(&self) -> std::io::Result<JoinHandle<()>> {
        let mut signals = Signals::install()?;
        let shutdown = self.clone();

        Ok(tokio::spawn(async move {
            tokio::select! {
                name = signals.recv() => {
                    log::info!(signal = name, "Execution stopped by signal");
                    shutdown.trigger();
                }
                _ = shutdown.triggered() => {}
            }
            tokio::select! {
                name = signals.recv() => {
                    log::warn!(signal = name, "Second signal, closing active sessions");
                    shutdown.force();
                }
                _ = shutdown.forced() => {}
            }
        }))
    }
}

#[cfg(unix)]
struct Signals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        }
    }
}

#[cfg(windows)]
struct Signals {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(windows)]
impl Signals {
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        self.ctrl_c.recv().await;
        "ctrl-c"
    }
}
