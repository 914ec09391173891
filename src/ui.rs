//! The single-threaded UI context.
//!
//! The live widget tree may only be touched from one thread. Hosts with their
//! own event loop implement [`UiContext`] on a handle that posts onto that
//! loop; headless hosts and tests use [`MessageLoop`], which owns a dedicated
//! thread fed by a bounded queue. Jobs run in the order they are posted.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::config::ServerConfig;
use crate::error::UiError;

pub type UiJob = Box<dyn FnOnce() + Send + 'static>;

pub trait UiContext: Send + Sync {
    /// Queue `job` on the UI thread.
    ///
    /// May block while the queue is full. Never call it from inside an async
    /// task; the server only posts from worker threads.
    fn post(&self, job: UiJob) -> Result<(), UiError>;
}

/// Run `f` on the UI context and wait for its result.
pub fn invoke<R, F>(ui: &dyn UiContext, f: F) -> Result<R, UiError>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    ui.post(Box::new(move || {
        let _ = tx.send(f());
    }))?;
    rx.blocking_recv().map_err(|_| UiError::Abandoned)
}

/// Stand-alone UI thread.
pub struct MessageLoop {
    sender: mpsc::Sender<UiJob>,
    thread: Option<JoinHandle<()>>,
}

impl MessageLoop {
    pub fn new(queue_bound: usize) -> std::io::Result<Self> {
        let (sender, mut receiver) = mpsc::channel::<UiJob>(queue_bound.max(1));

        let thread = std::thread::Builder::new()
            .name("uiprobe-ui".to_string())
            .spawn(move || {
                debug!("Message loop started");
                while let Some(job) = receiver.blocking_recv() {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                        error!(panic = ?panic, "UI job panicked");
                    }
                }
                debug!("Message loop exiting");
            })?;

        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }

    /// Loop sized by `ui_queue_bound`.
    pub fn from_config(config: &ServerConfig) -> std::io::Result<Self> {
        Self::new(config.ui_queue_bound)
    }

    /// Whether the caller is running on this loop's thread.
    pub fn is_loop_thread(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| thread.thread().id() == std::thread::current().id())
    }
}

impl UiContext for MessageLoop {
    fn post(&self, job: UiJob) -> Result<(), UiError> {
        self.sender.blocking_send(job).map_err(|_| UiError::Closed)
    }
}

impl Drop for MessageLoop {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        // Replace the sender so the loop sees the channel close once queued jobs ran.
        let (closed, _) = mpsc::channel(1);
        drop(std::mem::replace(&mut self.sender, closed));
        if thread.thread().id() != std::thread::current().id() {
            let _ = thread.join();
        }
    }
}
