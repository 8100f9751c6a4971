//! Spawns and owns the set of worker tasks for the process's lifetime.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Worker;
use crate::wire::{FromWorker, ToWorker};
use crate::webapp::WebAppClient;

/// Replaces the original's pool of daemonized OS processes with a set of
/// `tokio::spawn` tasks, one per worker, each holding the receiving half of
/// its own [`ToWorker`] channel.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        webapp: WebAppClient,
        to_worker_receivers: Vec<mpsc::Receiver<ToWorker>>,
    ) -> (Self, Vec<mpsc::Receiver<FromWorker>>) {
        let mut handles = Vec::with_capacity(to_worker_receivers.len());
        let mut from_worker_receivers = Vec::with_capacity(to_worker_receivers.len());

        for to_worker_rx in to_worker_receivers {
            let (from_worker_tx, from_worker_rx) = mpsc::channel(256);
            from_worker_receivers.push(from_worker_rx);

            let worker = Worker::new(webapp.clone());
            handles.push(tokio::spawn(worker.run(to_worker_rx, from_worker_tx)));
        }

        (Self { handles }, from_worker_receivers)
    }

    /// Tear down every worker task. Workers carry no state worth draining on
    /// shutdown — any in-flight webapp call is simply cancelled.
    pub fn stop(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}
