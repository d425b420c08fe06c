//! Background thread driving reevaluation cycles.
//!
//! A cycle runs every `reevaluation_interval`, or earlier when the engine
//! signals that the anteroom filled up. The thread holds only a weak
//! reference to the engine and exits once the engine is dropped.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, Receiver, Sender};
use tracing::{debug, error};

use super::engine::EngineShared;
use crate::error::{Error, Result};

const THREAD_NAME: &str = "sievedb-cache-reevaluator";

/// Handle of the reevaluation thread.
#[derive(Debug)]
pub(crate) struct ReevaluationTask {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ReevaluationTask {
    pub(crate) fn spawn(
        shared: Weak<EngineShared>,
        interval: Duration,
        wake: Receiver<()>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run_loop(&shared, interval, &wake, &shutdown_rx))
            .map_err(|e| Error::Internal(format!("failed to spawn {THREAD_NAME}: {e}")))?;

        debug!(
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "Cache reevaluation thread started"
        );
        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for a running cycle to finish.
    pub(crate) fn stop(&mut self) {
        // Disconnecting the channel wakes the loop.
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Cache reevaluation thread panicked");
            }
        }
    }
}

impl Drop for ReevaluationTask {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    shared: &Weak<EngineShared>,
    interval: Duration,
    wake: &Receiver<()>,
    shutdown: &Receiver<()>,
) {
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(wake) -> message => {
                if message.is_err() {
                    break;
                }
            }
            default(interval) => {}
        }

        let Some(shared) = shared.upgrade() else {
            break;
        };
        if let Err(e) = shared.reevaluate() {
            error!(error = %e, "Scheduled cache reevaluation failed");
        }
    }
    debug!("Cache reevaluation thread stopped");
}
