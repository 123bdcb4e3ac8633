//! `procpool-handle` is the future-like handle returned by a call: it pins
//! a worker busy, and lazily reads that worker's result off the channel the
//! first time anyone asks for it.
//!
//! A [`Handle`] does not own its worker, it only knows its `worker_id` and
//! resolves the live [`Worker`](procpool_worker_state::Worker) through a
//! shared [`WorkerTable`], exactly as the data model's pool-owned arena
//! calls for: this is what keeps a worker and its handle from needing a
//! strong reference to each other.

#![deny(unused)]
#![deny(warnings)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::missing_crate_level_docs)]
#![deny(rustdoc::invalid_codeblock_attributes)]
#![deny(rustdoc::invalid_rust_codeblocks)]

use std::{
    cell::{Cell, RefCell},
    io,
    marker::PhantomData,
    os::fd::RawFd,
    rc::Rc,
};

use procpool_errors::{Error, PoolResult, WorkerFailure};
use procpool_worker_state::WorkerTable;
use serde::{de::DeserializeOwned, Serialize};

#[cfg(unix)]
use std::os::fd::AsRawFd;

/// Something [`procpool_select`](https://docs.rs/procpool-select)'s `select`
/// can wait on: either a live file descriptor to poll, or nothing, meaning
/// this waitable is already known ready without polling (cancelled, or its
/// worker has been force-quit).
///
/// Kept here rather than in the multiplexer crate because only the handle
/// knows how to ask its worker table for a channel; the multiplexer only
/// needs to know the answer.
pub trait Waitable {
    /// The fd to poll for readability, or `None` if this waitable is
    /// already ready.
    fn poll_source(&self) -> Option<RawFd>;
}

#[derive(Debug, Clone)]
enum ResultSlot {
    Absent,
    Ready(Vec<u8>),
    Failed(Error),
}

/// A pending call's future: binds a `call_id` and job argument to the
/// worker running it, and reads the result from the channel on first
/// demand.
///
/// Single-consumer: dropping a `Handle` before calling [`Handle::get_result`]
/// leaves its worker busy forever, exactly as the data model warns. Debug
/// builds assert on this in the destructor.
pub struct Handle<A, R> {
    table: Rc<RefCell<WorkerTable>>,
    worker_id: usize,
    call_id: u64,
    job_arg: A,
    pid: u32,
    cancelled: Cell<bool>,
    result: RefCell<ResultSlot>,
    consumed: Cell<bool>,
    _result_type: PhantomData<fn() -> R>,
}

impl<A, R> Handle<A, R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    /// Construct a handle for a call already dispatched to `worker_id`.
    ///
    /// Not part of the public call surface: a [`Handle`] is produced only by
    /// `procpool-pool`'s `call`, which has just written the request this
    /// handle is waiting on.
    pub fn new(table: Rc<RefCell<WorkerTable>>, worker_id: usize, call_id: u64, job_arg: A, pid: u32) -> Self {
        Self {
            table,
            worker_id,
            call_id,
            job_arg,
            pid,
            cancelled: Cell::new(false),
            result: RefCell::new(ResultSlot::Absent),
            consumed: Cell::new(false),
            _result_type: PhantomData,
        }
    }

    /// The `call_id` supplied by the caller, verbatim.
    pub fn get_call_id(&self) -> u64 {
        self.call_id
    }

    /// The original job argument, retained so a scheduler can requeue it.
    pub fn get_job(&self) -> &A {
        &self.job_arg
    }

    /// The id of the worker this handle is pinned to.
    pub fn get_worker(&self) -> usize {
        self.worker_id
    }

    /// Whether [`Handle::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Cancel this call.
    ///
    /// Best-effort: severs the worker's channel (so any in-flight read
    /// fails promptly) and, since a severed channel can never be reused
    /// safely, force-quits the worker. Idempotent.
    ///
    /// Also flips the cancellation flag on the worker's type-erased handle
    /// (see `procpool_worker_state::WorkerTable::mark_handle_cancelled`),
    /// so a scheduler inspecting the call through that escape hatch sees
    /// the same state this handle already knows about.
    pub fn cancel(&self) {
        self.cancelled.set(true);

        let mut table = self.table.borrow_mut();
        table.mark_handle_cancelled(self.worker_id);
        table.force_quit(self.worker_id);
    }

    /// Block until the result is available, then return it.
    ///
    /// Idempotent once resolved: a second call returns the cached outcome
    /// without touching the channel again. On failure the worker has
    /// already been marked force-quit by the time this returns.
    pub fn get_result(&self) -> PoolResult<R> {
        {
            let slot = self.result.borrow();
            match &*slot {
                ResultSlot::Ready(bytes) => {
                    return Ok(procpool_executor::decode(bytes)
                        .expect("a response that decoded once must decode the same way again"));
                }
                ResultSlot::Failed(error) => return Err(error.clone()),
                ResultSlot::Absent => {}
            }
        }

        self.resolve()
    }

    fn resolve(&self) -> PoolResult<R> {
        if self.cancelled.get() && self.table.borrow().get(self.worker_id).channel().is_none() {
            let error = Error::WorkerFailed { worker_id: self.worker_id, pid: self.pid, failure: WorkerFailure::Cancelled };
            *self.result.borrow_mut() = ResultSlot::Failed(error.clone());
            self.consumed.set(true);
            return Err(error);
        }

        let read_result = self.recv();

        let outcome = match read_result {
            Ok(procpool_wire::Response::Ok(bytes)) => {
                self.reap_clone_child();
                self.table.borrow_mut().mark_free(self.worker_id);
                *self.result.borrow_mut() = ResultSlot::Ready(bytes.clone());
                self.consumed.set(true);
                return Ok(procpool_executor::decode(&bytes)
                    .expect("the executor encoded a response of the type the caller expects"));
            }
            Ok(procpool_wire::Response::Failed(message)) => {
                WorkerFailure::EntryPointFailed(message)
            }
            Err(io_error) => self.failure_from_channel_error(io_error),
        };

        let error = Error::WorkerFailed { worker_id: self.worker_id, pid: self.pid, failure: outcome };
        self.retire_after_failure();
        *self.result.borrow_mut() = ResultSlot::Failed(error.clone());
        self.consumed.set(true);

        Err(error)
    }

    /// Reap a clone-per-call worker's channel once its one-shot child has
    /// served its request and exited, returning the record to dormant (no
    /// channel) so the next `call` spawns a fresh clone instead of writing
    /// onto a dead child's stdin.
    ///
    /// A no-op for long-lived workers, whose channel stays attached across
    /// calls.
    fn reap_clone_child(&self) {
        let mut table = self.table.borrow_mut();

        if table.get(self.worker_id).is_longlived() {
            return;
        }

        if let Some(mut spawned) = table.get_mut(self.worker_id).take_channel() {
            let _ = procpool_daemon::kill(&mut spawned);
        }
    }

    /// Retire this handle's worker after an execution failure.
    ///
    /// A long-lived worker's one persistent child just died, so the record
    /// is force-quit permanently. A clone-per-call worker's whole model is
    /// a throwaway child per call, so a failed call is not special: reap
    /// the dead channel and return the worker to idle for its next call to
    /// clone a fresh one.
    fn retire_after_failure(&self) {
        if self.table.borrow().get(self.worker_id).is_longlived() {
            self.table.borrow_mut().force_quit(self.worker_id);
            return;
        }

        self.reap_clone_child();
        self.table.borrow_mut().mark_free(self.worker_id);
    }

    fn recv(&self) -> io::Result<procpool_wire::Response> {
        let mut table = self.table.borrow_mut();
        let worker = table.get_mut(self.worker_id);

        match worker.channel_mut() {
            Some(spawned) => spawned.channel.recv(),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "worker has no channel")),
        }
    }

    fn failure_from_channel_error(&self, _io_error: io::Error) -> WorkerFailure {
        let mut table = self.table.borrow_mut();
        let worker = table.get_mut(self.worker_id);

        match worker.channel_mut() {
            Some(spawned) => match spawned.child.wait() {
                Ok(status) => procpool_daemon::exit_status_to_failure(status),
                Err(_) => WorkerFailure::Quit(-1),
            },
            None => WorkerFailure::Cancelled,
        }
    }
}

impl<A, R> Waitable for Handle<A, R>
where
    R: DeserializeOwned,
{
    fn poll_source(&self) -> Option<RawFd> {
        if self.is_cancelled() || !matches!(*self.result.borrow(), ResultSlot::Absent) {
            return None;
        }

        let table = self.table.borrow();
        let worker = table.get(self.worker_id);

        if worker.is_force_quit() {
            return None;
        }

        #[cfg(unix)]
        {
            worker.channel().map(|spawned| spawned.channel.stdout().as_raw_fd())
        }

        #[cfg(not(unix))]
        {
            None
        }
    }
}

/// Something a pool controller can cancel without knowing its job or
/// result types, so `cancel` can take a batch of handles of different
/// types in one call.
pub trait Cancellable {
    /// Cancel the call this handle is bound to. See [`Handle::cancel`].
    fn cancel(&self);
}

impl<A, R> Cancellable for Handle<A, R> {
    fn cancel(&self) {
        Handle::cancel(self)
    }
}

impl<A, R> Drop for Handle<A, R> {
    fn drop(&mut self) {
        debug_assert!(
            self.consumed.get() || self.cancelled.get(),
            "handle for worker #{} dropped without consuming its result or cancelling it; the worker is now stuck busy",
            self.worker_id,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use procpool_daemon::SpawnedChild;
    use procpool_wire::{EntryState, Response, WorkerParams};
    use procpool_worker_state::WorkerTable;

    use super::*;

    fn table_with_worker() -> Rc<RefCell<WorkerTable>> {
        Rc::new(RefCell::new(WorkerTable::new(1, true)))
    }

    fn attach_cat(table: &Rc<RefCell<WorkerTable>>, worker_id: usize) -> u32 {
        let params = WorkerParams { longlived: true, entry_state: EntryState::default(), controller_fd: None };
        let spawned = procpool_daemon::spawn(Path::new("/bin/cat"), &params).expect("cat should spawn");
        let pid = spawned.pid;
        table.borrow_mut().set_channel(worker_id, spawned);
        table.borrow_mut().mark_busy(worker_id).unwrap();
        pid
    }

    #[test]
    fn get_result_reads_the_response_and_frees_the_worker() {
        let table = table_with_worker();
        let pid = attach_cat(&table, 0);

        // `cat` just echoes whatever we write, so writing the response we
        // expect to read back makes this a loopback test.
        {
            let mut table_ref = table.borrow_mut();
            let spawned = table_ref.get_mut(0).channel_mut().unwrap();
            spawned.channel.send(&Response::Ok(bincode::serialize(&42_i64).unwrap())).unwrap();
        }

        let handle: Handle<i64, i64> = Handle::new(table.clone(), 0, 1, 41, pid);
        let result = handle.get_result().expect("cat echoed a well-formed response");

        assert_eq!(result, 42);
        assert!(!table.borrow().get(0).is_busy());
    }

    #[test]
    fn successful_result_reaps_a_clone_per_call_worker_s_channel() {
        let table = Rc::new(RefCell::new(WorkerTable::new(1, false)));

        let params = WorkerParams { longlived: false, entry_state: EntryState::default(), controller_fd: None };
        let spawned = procpool_daemon::spawn(Path::new("/bin/cat"), &params).expect("cat should spawn");
        let pid = spawned.pid;
        table.borrow_mut().set_channel(0, spawned);
        table.borrow_mut().mark_busy(0).unwrap();

        {
            let mut table_ref = table.borrow_mut();
            let spawned = table_ref.get_mut(0).channel_mut().unwrap();
            spawned.channel.send(&Response::Ok(bincode::serialize(&42_i64).unwrap())).unwrap();
        }

        let handle: Handle<i64, i64> = Handle::new(table.clone(), 0, 1, 41, pid);
        assert_eq!(handle.get_result().unwrap(), 42);

        assert!(!table.borrow().get(0).is_busy());
        assert!(
            table.borrow().get(0).channel().is_none(),
            "a clone-per-call worker's exited child must be reaped, not left dangling, after a successful result"
        );
    }

    #[test]
    fn get_result_is_idempotent_after_success() {
        let table = table_with_worker();
        let pid = attach_cat(&table, 0);

        {
            let mut table_ref = table.borrow_mut();
            let spawned = table_ref.get_mut(0).channel_mut().unwrap();
            spawned.channel.send(&Response::Ok(bincode::serialize(&7_i64).unwrap())).unwrap();
        }

        let handle: Handle<i64, i64> = Handle::new(table.clone(), 0, 1, 0, pid);
        assert_eq!(handle.get_result().unwrap(), 7);
        assert_eq!(handle.get_result().unwrap(), 7);
    }

    #[test]
    fn explicit_failed_response_force_quits_the_worker() {
        let table = table_with_worker();
        let pid = attach_cat(&table, 0);

        {
            let mut table_ref = table.borrow_mut();
            let spawned = table_ref.get_mut(0).channel_mut().unwrap();
            spawned.channel.send(&Response::Failed("boom".to_string())).unwrap();
        }

        let handle: Handle<i64, i64> = Handle::new(table.clone(), 0, 1, 0, pid);
        let error = handle.get_result().unwrap_err();

        assert!(matches!(error, Error::WorkerFailed { failure: WorkerFailure::EntryPointFailed(_), .. }));
        assert!(table.borrow().is_force_quit(0));
    }

    #[test]
    fn dead_child_maps_to_a_worker_failure() {
        let table = table_with_worker();

        // `/bin/true` ignores stdin and exits immediately, closing its
        // stdout; the handshake frame we send is simply never read.
        let params = WorkerParams { longlived: true, entry_state: EntryState::default(), controller_fd: None };
        let spawned: SpawnedChild =
            procpool_daemon::spawn(Path::new("/bin/true"), &params).expect("true should spawn");
        let pid = spawned.pid;
        table.borrow_mut().set_channel(0, spawned);
        table.borrow_mut().mark_busy(0).unwrap();

        let handle: Handle<i64, i64> = Handle::new(table.clone(), 0, 1, 0, pid);
        let error = handle.get_result().unwrap_err();

        assert!(matches!(error, Error::WorkerFailed { .. }));
        assert!(table.borrow().is_force_quit(0));
    }

    #[test]
    fn cancel_marks_cancelled_and_force_quits() {
        let table = table_with_worker();
        let pid = attach_cat(&table, 0);

        let handle: Handle<i64, i64> = Handle::new(table.clone(), 0, 1, 0, pid);
        handle.cancel();

        assert!(handle.is_cancelled());
        assert!(table.borrow().is_force_quit(0));

        let error = handle.get_result().unwrap_err();
        assert!(matches!(error, Error::WorkerFailed { failure: WorkerFailure::Cancelled, .. }));
    }

    #[test]
    fn accessors_return_what_call_supplied() {
        let table = table_with_worker();
        let pid = attach_cat(&table, 0);

        let handle: Handle<i64, i64> = Handle::new(table, 0, 99, 41, pid);

        assert_eq!(handle.get_call_id(), 99);
        assert_eq!(*handle.get_job(), 41);
        assert_eq!(handle.get_worker(), 0);

        handle.cancel();
    }
}
