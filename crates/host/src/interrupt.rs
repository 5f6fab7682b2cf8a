//! Operator interrupt.
//!
//! One Ctrl-C listener for the whole process sets a shared flag. Anything
//! that waits (external commands, DNS and HTTP checks, ACME orders) races
//! against it and fails with `Interrupted`, so the caller rolls back. A second
//! Ctrl-C exits immediately.

use sitekeeper_common::{Result, SiteError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

pub const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone)]
pub struct Interrupt {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Interrupted)` once the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(SiteError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Resolves when the flag is set; immediately if it already is.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this only returns once set.
        let _ = rx.wait_for(|set| *set).await;
    }

    /// Runs `fut` unless the flag is set first.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.triggered() => Err(SiteError::Interrupted),
            result = fut => result,
        }
    }

    /// Installs the process-wide Ctrl-C listener.
    pub fn listen_for_ctrl_c(&self) -> JoinHandle<()> {
        let interrupt = self.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    warn!("cannot listen for Ctrl-C");
                    return;
                }
                if interrupt.is_triggered() {
                    warn!("second interrupt, exiting without cleanup");
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
                warn!("interrupt received, rolling back the current step");
                interrupt.trigger();
            }
        })
    }
}
