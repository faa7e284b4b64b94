//! Background thread running triggered collections.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, unbounded};

use crate::error::GcResult;
use crate::g1::G1Gc;
use crate::task::GcTask;

pub(crate) enum GcThreadMessage {
    Run(GcTask),
    Shutdown,
}

/// Thread executing tasks handed to [`G1Gc::trigger`].
///
/// Tasks run one at a time in request order. Dropping the handle stops the
/// thread after the task in progress.
pub struct GcThread {
    gc: Arc<G1Gc>,
    handle: Option<JoinHandle<()>>,
}

impl GcThread {
    /// Spawn the thread and attach it to `gc`.
    pub fn start(gc: Arc<G1Gc>) -> GcResult<Self> {
        let (tx, rx) = unbounded();
        let worker = gc.clone();
        let handle = std::thread::Builder::new()
            .name("otter-g1-gc".into())
            .spawn(move || run(worker, rx))?;
        gc.attach_task_queue(tx);
        tracing::debug!(target: "otter::gc", "gc thread started");
        Ok(Self {
            gc,
            handle: Some(handle),
        })
    }

    /// Collector served by this thread.
    pub fn gc(&self) -> &Arc<G1Gc> {
        &self.gc
    }

    /// Stop and join the thread.
    pub fn stop(&mut self) {
        if let Some(tx) = self.gc.detach_task_queue() {
            let _ = tx.send(GcThreadMessage::Shutdown);
        }
        self.gc.interrupt_concurrent_marking();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GcThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(gc: Arc<G1Gc>, rx: Receiver<GcThreadMessage>) {
    while let Ok(message) = rx.recv() {
        match message {
            GcThreadMessage::Run(task) => {
                let cause = task.cause;
                let kind = gc.run_gc(task);
                tracing::trace!(target: "otter::gc", %cause, %kind, "task finished");
                gc.task_done();
            }
            GcThreadMessage::Shutdown => break,
        }
    }
    // Tasks still queued are dropped; wake anyone waiting for them.
    while rx.try_recv().is_ok() {
        gc.task_done();
    }
    tracing::debug!(target: "otter::gc", "gc thread stopped");
}
