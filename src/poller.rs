//! Periodic background tasks for status and position refreshes.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::JaegerError;

pub type PollerFuture = Pin<Box<dyn Future<Output = Result<(), JaegerError>> + Send>>;
type PollerCallback = Box<dyn Fn() -> PollerFuture + Send + Sync>;

/// A named periodic task. Iterations never overlap: the loop sleeps, runs
/// the callback to completion, and only then sleeps again. Per-iteration
/// errors are logged and suppressed.
pub struct Poller {
    name: String,
    delay: Mutex<Duration>,
    callback: PollerCallback,
    /// Fresh per start so a stop permit cannot leak into the next run.
    cancel: Mutex<Arc<Notify>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    pub fn new(
        name: impl Into<String>,
        delay: Duration,
        callback: impl Fn() -> PollerFuture + Send + Sync + 'static,
    ) -> Arc<Poller> {
        Arc::new(Poller {
            name: name.into(),
            delay: Mutex::new(delay),
            callback: Box::new(callback),
            cancel: Mutex::new(Arc::new(Notify::new())),
            task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn running(&self) -> bool {
        self.task
            .lock()
            .unwrap()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn start(self: &Arc<Self>) {
        if self.running() {
            return;
        }

        let cancel = Arc::new(Notify::new());
        *self.cancel.lock().unwrap() = Arc::clone(&cancel);

        let poller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let delay = *poller.delay.lock().unwrap();
                tokio::select! {
                    _ = cancel.notified() => break,
                    _ = tokio::time::sleep(delay) => {
                        if let Err(err) = (poller.callback)().await {
                            warn!(poller = %poller.name, "poller iteration failed: {err}");
                        }
                    }
                }
            }
        });

        *self.task.lock().unwrap() = Some(handle);
    }

    /// Cooperative stop: signals cancellation and joins the task.
    pub async fn stop(&self) {
        self.cancel.lock().unwrap().notify_one();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Starts and stops a set of pollers jointly.
#[derive(Default)]
pub struct PollerList {
    pollers: Mutex<Vec<Arc<Poller>>>,
}

impl PollerList {
    pub fn set(&self, pollers: Vec<Arc<Poller>>) {
        *self.pollers.lock().unwrap() = pollers;
    }

    fn members(&self) -> Vec<Arc<Poller>> {
        self.pollers.lock().unwrap().clone()
    }

    pub fn start(&self) {
        for poller in self.members() {
            poller.start();
        }
    }

    pub async fn stop(&self) {
        for poller in self.members() {
            poller.stop().await;
        }
    }

    /// `true` iff the list is non-empty and every member is active.
    pub fn running(&self) -> bool {
        let members = self.members();
        !members.is_empty() && members.iter().all(|poller| poller.running())
    }
}
