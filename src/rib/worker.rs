//------------ Background Workers --------------------------------------------

// A worker is a thread that runs a job whenever it is nudged, and
// optionally on a fixed interval. Stopping a worker sets its cancel flag,
// which jobs check between atomic steps, and disconnects its shutdown
// channel, which ends the loop once the current job returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, tick, Sender, TrySendError};
use log::{debug, info, warn};

use crate::errors::EngineError;

/// Why a job runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Wake {
    /// Once, when the worker starts.
    Start,
    /// Nudged by a writer.
    Trigger,
    /// The interval passed.
    Tick,
}

pub(crate) struct Worker {
    name: &'static str,
    trigger: Sender<()>,
    shutdown: Option<Sender<()>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Worker({})", self.name)
    }
}

impl Worker {
    pub fn spawn<F>(
        name: &'static str,
        interval: Option<Duration>,
        mut job: F,
    ) -> Result<Self, EngineError>
    where
        F: FnMut(Wake, &AtomicBool) + Send + 'static,
    {
        // One pending nudge is enough, the job looks at the whole state
        // when it runs.
        let (trigger, trigger_rx) = bounded::<()>(1);
        let (shutdown, shutdown_rx) = bounded::<()>(0);
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = cancel.clone();

        let handle = std::thread::Builder::new()
            .name(format!("rib-{}", name))
            .spawn(move || {
                let ticker = match interval {
                    Some(interval) => tick(interval),
                    None => never(),
                };
                info!("{} worker started", name);
                job(Wake::Start, &worker_cancel);
                loop {
                    select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(trigger_rx) -> msg => match msg {
                            Ok(()) => job(Wake::Trigger, &worker_cancel),
                            Err(_) => break,
                        },
                        recv(ticker) -> _ => job(Wake::Tick, &worker_cancel),
                    }
                    if worker_cancel.load(Ordering::Acquire) {
                        break;
                    }
                }
                info!("{} worker stopped", name);
            })?;

        Ok(Self {
            name,
            trigger,
            shutdown: Some(shutdown),
            cancel,
            handle: Some(handle),
        })
    }

    /// Ask the worker to run its job. Never blocks: if a nudge is already
    /// pending, this one is folded into it.
    pub fn nudge(&self) {
        match self.trigger.try_send(()) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                debug!("{} worker is gone, nudge dropped", self.name);
            }
        }
    }

    /// Cancel the current job and wait for the thread to finish.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} worker panicked", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
