//! Signal Handling for Graceful Shutdown
//!
//! SIGINT, SIGTERM and SIGQUIT never kill the harness outright: they raise a
//! shutdown flag that the suite runner checks between tests and the reload
//! coordinator checks between polls. The run lock guard therefore always gets
//! to release the lock.
//!
//! ## Architecture
//!
//! Signal thread is spawned as a daemon - it will automatically die
//! when the main thread exits.

use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// Shared flag raised once shutdown was requested
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested (called in runner and watcher loops)
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Install signal handlers for graceful shutdown
///
/// Spawns a daemon thread that raises `shutdown` on SIGINT, SIGTERM or
/// SIGQUIT.
pub fn install_signal_handlers(shutdown: &Shutdown) -> io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT])?;
    let shutdown = shutdown.clone();

    // Spawn daemon thread - will die when main exits
    thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGINT => warn!("received SIGINT, finishing the current test"),
                SIGTERM | SIGQUIT => warn!("received signal {}, shutting down", sig),
                _ => continue,
            }
            shutdown.request();
        }
    });

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
