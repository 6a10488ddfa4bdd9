//! Cooperative scheduler for non-blocking handlers.
//!
//! Each pass calls every handler once, highest priority first. A handler
//! that has nothing to do returns [`Progress::Idle`]; one that can never make
//! progress again returns [`InvalidEventHandler`] and is dropped.

use crate::error::{EngineError, InvalidEventHandler, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Busy,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandlerPriority {
    High,
    Medium,
    Replication,
    Monitor,
}

pub trait EventHandler: Send {
    fn action(&mut self) -> Result<Progress, InvalidEventHandler>;

    fn priority(&self) -> HandlerPriority {
        HandlerPriority::Medium
    }
}

pub struct EventLoop {
    handlers: Mutex<Vec<Box<dyn EventHandler>>>,
    /// Handlers added while a pass is running join on the next pass.
    pending: Mutex<Vec<Box<dyn EventHandler>>>,
    pause: Duration,
    stop_tx: watch::Sender<bool>,
}

impl EventLoop {
    pub fn new(pause: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            handlers: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            pause,
            stop_tx,
        }
    }

    pub fn add_handler(&self, handler: Box<dyn EventHandler>) {
        debug!(priority = ?handler.priority(), "added event handler");
        self.pending.lock().push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len() + self.pending.lock().len()
    }

    /// Runs one pass over every handler. Returns `Busy` if any handler made
    /// progress.
    pub fn run_once(&self) -> Progress {
        let mut handlers = self.handlers.lock();
        let added: Vec<_> = self.pending.lock().drain(..).collect();
        if !added.is_empty() {
            handlers.extend(added);
            handlers.sort_by_key(|h| h.priority());
        }

        let mut progress = Progress::Idle;
        handlers.retain_mut(|handler| match handler.action() {
            Ok(Progress::Busy) => {
                progress = Progress::Busy;
                true
            }
            Ok(Progress::Idle) => true,
            Err(err) => {
                debug!("removing event handler: {err}");
                false
            }
        });
        progress
    }

    /// Runs passes on a tokio task until [`EventLoop::stop`]. Sleeps for the
    /// configured pause after a pass where nothing was busy.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| EngineError::Config("event loop requires a tokio runtime".into()))?;
        self.stop_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();
        let this = self.clone();
        runtime.spawn(async move {
            info!("event loop started");
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                match this.run_once() {
                    Progress::Busy => tokio::task::yield_now().await,
                    Progress::Idle => {
                        tokio::select! {
                            _ = tokio::time::sleep(this.pause) => {}
                            _ = stop_rx.changed() => {}
                        }
                    }
                }
            }
            info!("event loop stopped");
        });
        Ok(())
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}
