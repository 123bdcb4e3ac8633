//! `procpool-worker-state` is the controller's in-memory record of one
//! worker: its id, whether it is busy, its current channel, and whether it
//! has been force-quit.
//!
//! Workers live in a [`WorkerTable`], a pool-owned arena addressed by
//! `worker_id` rather than by strong reference. This breaks the natural
//! cycle between a worker and the handle it is currently running: a handle
//! stores a `worker_id` and resolves the actual [`Worker`] through the
//! table on demand, instead of holding a reference back to it directly.
//!
//! Nothing here is thread-safe on purpose: the specification requires the
//! controller to run on a single thread, so a [`WorkerTable`] uses plain
//! interior mutability (no locks) and panics only on the controller's own
//! invariant violations, never on a runtime condition.

#![deny(unused)]
#![deny(warnings)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::missing_crate_level_docs)]
#![deny(rustdoc::invalid_codeblock_attributes)]
#![deny(rustdoc::invalid_rust_codeblocks)]

use procpool_daemon::SpawnedChild;
use procpool_errors::Error;

/// Type-erased back-reference to a worker's outstanding handle.
///
/// The real [`Handle<A, R>`](https://docs.rs/procpool-handle) type lives in
/// `procpool-handle`, which depends on this crate for arena access; to avoid
/// a dependency cycle, this crate never names that type, and this type never
/// holds one either. Per the specification's open question, the type-erased
/// accessor is restricted to metadata-only queries — `call_id`, `worker_id`,
/// and whether the call has been cancelled — kept in sync with the real
/// [`Handle`](https://docs.rs/procpool-handle/latest/procpool_handle/struct.Handle.html)
/// by [`WorkerTable::mark_handle_cancelled`]; the result channel itself is
/// never reachable through this type.
pub struct ErasedHandle {
    call_id: u64,
    worker_id: usize,
    cancelled: bool,
}

impl ErasedHandle {
    /// Record a call's metadata for type-erased, scheduler-only queries.
    pub fn new(call_id: u64, worker_id: usize, cancelled: bool) -> Self {
        Self { call_id, worker_id, cancelled }
    }

    /// The `call_id` the caller supplied when the job was dispatched.
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    /// The id of the worker this handle is pinned to.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Whether `cancel` has been called on this handle.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// The controller's record of one worker.
pub struct Worker {
    id: usize,
    longlived: bool,
    channel: Option<SpawnedChild>,
    busy: bool,
    current_handle: Option<ErasedHandle>,
    force_quit: bool,
}

impl Worker {
    pub(crate) fn new(id: usize, longlived: bool) -> Self {
        Self { id, longlived, channel: None, busy: false, current_handle: None, force_quit: false }
    }

    /// This worker's id, assigned once at pool construction.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether this worker serves many jobs from one persistent child
    /// (`true`), or spawns a fresh child per call (`false`).
    pub fn is_longlived(&self) -> bool {
        self.longlived
    }

    /// Whether this worker currently has an outstanding call.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Whether this worker has been permanently retired.
    pub fn is_force_quit(&self) -> bool {
        self.force_quit
    }

    /// The channel to this worker's current child, if one is connected.
    ///
    /// Present for a long-lived worker from spawn until force-quit; present
    /// for a clone-per-call worker only between `call` and the handle being
    /// consumed.
    pub fn channel(&self) -> Option<&SpawnedChild> {
        self.channel.as_ref()
    }

    /// Mutable access to this worker's channel.
    pub fn channel_mut(&mut self) -> Option<&mut SpawnedChild> {
        self.channel.as_mut()
    }

    /// Attach a channel to this worker (a fresh spawn, for either mode).
    pub fn set_channel(&mut self, channel: SpawnedChild) {
        self.channel = Some(channel);
    }

    /// Detach and return this worker's channel, if any, typically so the
    /// caller can close it without borrowing the worker any further.
    pub fn take_channel(&mut self) -> Option<SpawnedChild> {
        self.channel.take()
    }
}

/// A pool-owned arena of [`Worker`] records, addressed by `worker_id`.
pub struct WorkerTable {
    workers: Vec<Worker>,
}

impl WorkerTable {
    /// Allocate `count` idle worker records with ids `0..count`.
    pub fn new(count: usize, longlived: bool) -> Self {
        Self { workers: (0..count).map(|id| Worker::new(id, longlived)).collect() }
    }

    /// The number of workers in the table.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the table has no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Iterate over every worker id, in creation order.
    pub fn ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.workers.iter().map(Worker::id)
    }

    /// Borrow a worker by id.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range; worker ids are assigned by
    /// [`WorkerTable::new`] and are never expected to be guessed.
    pub fn get(&self, id: usize) -> &Worker {
        &self.workers[id]
    }

    /// Mutably borrow a worker by id. See [`WorkerTable::get`] for panics.
    pub fn get_mut(&mut self, id: usize) -> &mut Worker {
        &mut self.workers[id]
    }

    /// Attach a freshly spawned child's channel to a worker.
    pub fn set_channel(&mut self, id: usize, channel: SpawnedChild) {
        self.get_mut(id).set_channel(channel);
    }

    /// Mark a worker busy.
    ///
    /// Fails with [`Error::WorkerBusy`] if the worker already has an
    /// outstanding call; this is an assertion-class error; it signals a
    /// scheduler bug, never a runtime condition, and must never be used to
    /// decide whether to wait and retry.
    pub fn mark_busy(&mut self, id: usize) -> Result<(), Error> {
        let worker = self.get_mut(id);

        if worker.busy {
            return Err(Error::WorkerBusy(id));
        }

        worker.busy = true;

        Ok(())
    }

    /// Mark a worker free again and drop its current handle.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the worker was not busy; a release build
    /// silently accepts it, since by then the invariant has already been
    /// violated by a bug elsewhere and refusing to recover would only make
    /// things worse.
    pub fn mark_free(&mut self, id: usize) {
        let worker = self.get_mut(id);

        debug_assert!(worker.busy, "mark_free called on worker #{id} that was not busy");

        worker.busy = false;
        worker.current_handle = None;
    }

    /// Store the type-erased handle currently running on a worker.
    pub fn set_handle(&mut self, id: usize, handle: ErasedHandle) {
        self.get_mut(id).current_handle = Some(handle);
    }

    /// Retrieve the type-erased handle currently running on a worker, if
    /// any.
    ///
    /// This is a scheduler-only escape hatch exposing metadata only
    /// (`call_id`, `worker_id`, cancellation); it never reaches the result
    /// channel itself.
    pub fn get_handle(&self, id: usize) -> Option<&ErasedHandle> {
        self.get(id).current_handle.as_ref()
    }

    /// Mark the erased handle currently stored for `worker_id` as
    /// cancelled, if one is present.
    ///
    /// Called from `Handle::cancel` so a scheduler reaching into a worker's
    /// outstanding call through [`WorkerTable::get_handle`] sees the same
    /// cancellation state the real handle already has, instead of the
    /// frozen snapshot taken when [`WorkerTable::set_handle`] was called.
    pub fn mark_handle_cancelled(&mut self, id: usize) {
        if let Some(handle) = self.get_mut(id).current_handle.as_mut() {
            handle.cancelled = true;
        }
    }

    /// Whether a worker is permanently retired.
    pub fn is_force_quit(&self, id: usize) -> bool {
        self.get(id).force_quit
    }

    /// Permanently retire a worker: kill its child (if any), close its
    /// channel, and mark the record terminal.
    ///
    /// Idempotent: force-quitting an already force-quit worker is a no-op.
    pub fn force_quit(&mut self, id: usize) {
        let worker = self.get_mut(id);

        if worker.force_quit {
            return;
        }

        if let Some(mut spawned) = worker.channel.take() {
            if let Err(error) = procpool_daemon::kill(&mut spawned) {
                tracing::warn!(worker_id = id, %error, "failed to kill worker child during force-quit");
            }
        }

        worker.busy = false;
        worker.current_handle = None;
        worker.force_quit = true;

        tracing::debug!(worker_id = id, "worker force-quit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_busy_twice_is_an_error() {
        let mut table = WorkerTable::new(1, true);

        table.mark_busy(0).unwrap();

        assert!(matches!(table.mark_busy(0), Err(Error::WorkerBusy(0))));
    }

    #[test]
    fn mark_free_clears_the_handle() {
        let mut table = WorkerTable::new(1, true);

        table.mark_busy(0).unwrap();
        table.set_handle(0, ErasedHandle::new(1, 0, false));
        table.mark_free(0);

        assert!(!table.get(0).is_busy());
        assert!(table.get_handle(0).is_none());
    }

    #[test]
    fn force_quit_is_idempotent() {
        let mut table = WorkerTable::new(1, true);

        table.force_quit(0);
        table.force_quit(0);

        assert!(table.is_force_quit(0));
        assert!(!table.get(0).is_busy());
    }

    #[test]
    fn erased_handle_exposes_its_metadata() {
        let erased = ErasedHandle::new(7, 3, false);

        assert_eq!(erased.call_id(), 7);
        assert_eq!(erased.worker_id(), 3);
        assert!(!erased.is_cancelled());
    }

    #[test]
    fn mark_handle_cancelled_updates_the_stored_handle() {
        let mut table = WorkerTable::new(1, true);

        table.mark_busy(0).unwrap();
        table.set_handle(0, ErasedHandle::new(1, 0, false));

        table.mark_handle_cancelled(0);

        assert!(table.get_handle(0).unwrap().is_cancelled());
    }

    #[test]
    fn mark_handle_cancelled_on_an_idle_worker_is_a_no_op() {
        let mut table = WorkerTable::new(1, true);

        table.mark_handle_cancelled(0);

        assert!(table.get_handle(0).is_none());
    }
}
