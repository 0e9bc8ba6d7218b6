//! Signal handling for graceful shutdown and configuration reload.
//!
//! SIGINT and SIGTERM cancel a [`ShutdownToken`]; SIGHUP raises a
//! [`ReloadToken`]. Both are owned handles passed to the daemon loop, which
//! wakes immediately when either fires instead of waiting out its interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Flag {
    set: AtomicBool,
    notify: Notify,
}

impl Flag {
    fn raise(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a raise between the check and the
            // await is not lost.
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// A token that can be shared across tasks to check for shutdown.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    inner: Arc<Flag>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_set()
    }

    /// Request shutdown; every clone observes it.
    pub fn cancel(&self) {
        self.inner.raise();
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.inner.wait().await
    }
}

/// A pending configuration reload request.
#[derive(Clone, Debug, Default)]
pub struct ReloadToken {
    inner: Arc<Flag>,
}

impl ReloadToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.inner.raise();
    }

    /// Consume a pending request, returning whether there was one.
    pub fn take(&self) -> bool {
        self.inner.set.swap(false, Ordering::SeqCst)
    }

    /// Resolves once a reload is pending (without consuming it).
    pub async fn requested(&self) {
        self.inner.wait().await
    }
}

/// Spawn the signal listener task.
///
/// If signal handlers cannot be registered (e.g., in restricted environments),
/// the failure is logged and the daemon keeps running without them.
pub fn spawn_listener(shutdown: ShutdownToken, reload: ReloadToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let register = |kind: SignalKind, name: &str| match signal(kind) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Failed to register {} handler: {}", name, e);
                None
            }
        };

        let (Some(mut int), Some(mut term), Some(mut hup)) = (
            register(SignalKind::interrupt(), "SIGINT"),
            register(SignalKind::terminate(), "SIGTERM"),
            register(SignalKind::hangup(), "SIGHUP"),
        ) else {
            warn!("Signal handlers unavailable - graceful shutdown and reload disabled");
            return;
        };

        loop {
            tokio::select! {
                _ = int.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown...");
                    shutdown.cancel();
                    return;
                }
                _ = term.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown...");
                    shutdown.cancel();
                    return;
                }
                _ = hup.recv() => {
                    info!("Received SIGHUP, scheduling configuration reload");
                    reload.request();
                }
            }
        }
    })
}
