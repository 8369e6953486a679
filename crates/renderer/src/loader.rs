//! Background asset loading with a render-thread completion queue.
//!
//! A task's work runs on a fixed-size `rayon` pool and must not touch the
//! device: it decodes bytes and returns a value. The value travels back over
//! a channel and the task's completion runs on the render thread during
//! [`AssetLoader::drain`], which is the only place uploads happen.
//!
//! A task bound to a drawable is skipped if the drawable is gone by the time
//! its result is drained. [`AssetLoader::cancel`] skips it explicitly. Work
//! already started still runs to completion; only the completion is dropped.
//!
//! A failed task is logged and counted unless its error is fatal (see
//! [`kiln_core::Error::disposition`]). A fatal error, such as the device
//! running out of memory during an upload, stops the drain and is returned.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use kiln_core::{Error, Result};
use tracing::{debug, error, trace, warn};

use crate::context::RenderContext;
use crate::drawable::{DrawableId, DrawableTable};

/// Runs on the render thread once the task's work has finished.
pub type Completion = Box<dyn FnOnce(&mut RenderContext, &mut DrawableTable) -> Result<()> + Send>;

type Finished = (TaskId, Result<Completion>);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Outcome of one [`AssetLoader::drain`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.applied + self.skipped + self.failed
    }
}

pub struct AssetLoader {
    pool: rayon::ThreadPool,
    sender: Sender<Finished>,
    receiver: Receiver<Finished>,
    /// Tasks whose completion will still run, with their owning drawable.
    pending: HashMap<TaskId, Option<DrawableId>>,
    next_id: u64,
}

impl AssetLoader {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|index| format!("kiln-loader-{index}"))
            .build()
            .map_err(|e| Error::Internal(format!("loader pool: {e}")))?;
        let (sender, receiver) = unbounded();
        debug!("Asset loader started with {} thread(s)", threads.max(1));
        Ok(Self {
            pool,
            sender,
            receiver,
            pending: HashMap::new(),
            next_id: 0,
        })
    }

    /// Run `work` on a worker, then `complete` with its value on the render
    /// thread during a later [`drain`](Self::drain).
    ///
    /// With an `owner`, the completion is skipped if that drawable has been
    /// removed from the table by then.
    pub fn load<T, W, C>(&mut self, owner: Option<DrawableId>, work: W, complete: C) -> TaskId
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T> + Send + 'static,
        C: FnOnce(T, &mut RenderContext, &mut DrawableTable) -> Result<()> + Send + 'static,
    {
        self.next_id += 1;
        let id = TaskId(self.next_id);
        self.pending.insert(id, owner);

        let sender = self.sender.clone();
        self.pool.spawn(move || {
            let result = match catch_unwind(AssertUnwindSafe(work)) {
                Ok(result) => result,
                Err(_) => Err(Error::Internal(format!("loader task {} panicked", id.0))),
            };
            let result = result.map(|value| {
                Box::new(move |ctx: &mut RenderContext, drawables: &mut DrawableTable| {
                    complete(value, ctx, drawables)
                }) as Completion
            });
            if sender.send((id, result)).is_err() {
                trace!("Loader gone before task {} finished", id.0);
            }
        });
        trace!("Task {} queued", id.0);
        id
    }

    /// Skip `task`'s completion. Returns `false` if it already ran or was
    /// cancelled.
    pub fn cancel(&mut self, task: TaskId) -> bool {
        let cancelled = self.pending.remove(&task).is_some();
        if cancelled {
            debug!("Task {} cancelled", task.0);
        }
        cancelled
    }

    pub fn is_pending(&self, task: TaskId) -> bool {
        self.pending.contains_key(&task)
    }

    /// Tasks whose completion has not run yet.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Run the completions of every task that has finished so far.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error a task produced. Completions after it
    /// stay queued.
    pub fn drain(&mut self, ctx: &mut RenderContext, drawables: &mut DrawableTable) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        while let Ok(finished) = self.receiver.try_recv() {
            report.merge(self.complete(finished, ctx, drawables)?);
        }
        if report.total() > 0 {
            debug!(
                "Loader drained: {} applied, {} skipped, {} failed",
                report.applied, report.skipped, report.failed
            );
        }
        Ok(report)
    }

    /// Drain until no task is pending or `timeout` passes.
    ///
    /// # Errors
    ///
    /// As [`drain`](Self::drain).
    pub fn drain_until_idle(
        &mut self,
        ctx: &mut RenderContext,
        drawables: &mut DrawableTable,
        timeout: Duration,
    ) -> Result<DrainReport> {
        let deadline = Instant::now() + timeout;
        let mut report = self.drain(ctx, drawables)?;
        while !self.pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(finished) => report.merge(self.complete(finished, ctx, drawables)?),
                Err(RecvTimeoutError::Timeout) => {
                    warn!("{} loader task(s) still pending after {:?}", self.pending.len(), timeout);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(report)
    }

    fn complete(
        &mut self,
        (id, result): Finished,
        ctx: &mut RenderContext,
        drawables: &mut DrawableTable,
    ) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let Some(owner) = self.pending.remove(&id) else {
            report.skipped += 1;
            return Ok(report);
        };
        if let Some(owner) = owner
            && !drawables.contains(owner)
        {
            debug!("Task {} skipped: drawable {:?} was removed", id.0, owner);
            report.skipped += 1;
            return Ok(report);
        }

        match result.and_then(|completion| completion(ctx, drawables)) {
            Ok(()) => report.applied += 1,
            Err(e) if e.is_fatal() => {
                error!("Loader task {} hit a fatal error: {}", id.0, e);
                return Err(e);
            }
            Err(e) => {
                error!("Loader task {} failed: {}", id.0, e);
                report.failed += 1;
            }
        }
        Ok(report)
    }
}

impl std::fmt::Debug for AssetLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetLoader")
            .field("threads", &self.pool.current_num_threads())
            .field("pending", &self.pending.len())
            .finish()
    }
}
