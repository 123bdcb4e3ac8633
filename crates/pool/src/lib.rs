//! `procpool-pool` is the controller: it builds a fixed-size pool of
//! workers, enforces the busy/free protocol, and implements cancellation
//! and force-quit across the whole pool.
//!
//! Everything here runs on a single thread, as the concurrency model
//! requires: worker-record mutations never need a lock, and the only
//! blocking operations are [`Handle::get_result`](procpool_handle::Handle::get_result)
//! and `procpool-select`'s `select`, both reached through handles this
//! crate hands out, never through the pool itself.

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
    cell::RefCell,
    io,
    path::{Path, PathBuf},
    rc::Rc,
};

use procpool_errors::{Error, PoolResult, SendJobError};
use procpool_handle::{Cancellable, Handle};
use procpool_wire::{EntryState, GcControl, HeapHandle, Mode, Request, WorkerParams};
use procpool_worker_state::{ErasedHandle, WorkerTable};
use serde::{de::DeserializeOwned, Serialize};

/// The pool controller: owns every worker record and the long-lived
/// children it pre-spawned, and knows how to clone a fresh child per call
/// for the workers that were configured that way.
pub struct Pool {
    table: Rc<RefCell<WorkerTable>>,
    executable: PathBuf,
    longlived: bool,
    call_wrapper: Option<String>,
    saved_state: Vec<u8>,
    gc_control: GcControl,
    heap_handle: HeapHandle,
    #[cfg(unix)]
    liveness: RefCell<procpool_daemon::LivenessPipe>,
}

impl Pool {
    /// Allocate `nbr_procs` worker records with ids `0..nbr_procs`.
    ///
    /// For long-lived mode, every worker's child is spawned immediately,
    /// each handed a [`WorkerParams`] built from `saved_state`,
    /// `gc_control`, and `heap_handle`. For clone-per-call mode, every
    /// record starts dormant; a child is spawned the first time `call`
    /// (or `spawn`) reaches that worker.
    pub fn make(
        executable: impl Into<PathBuf>,
        longlived: bool,
        call_wrapper: Option<String>,
        saved_state: Vec<u8>,
        nbr_procs: usize,
        gc_control: GcControl,
        heap_handle: HeapHandle,
    ) -> io::Result<Self> {
        let executable = executable.into();
        let table = WorkerTable::new(nbr_procs, longlived);
        let pool = Self {
            table: Rc::new(RefCell::new(table)),
            executable,
            longlived,
            call_wrapper,
            saved_state,
            gc_control,
            heap_handle,
            #[cfg(unix)]
            liveness: RefCell::new(procpool_daemon::LivenessPipe::new()?),
        };

        if longlived {
            for worker_id in 0..nbr_procs {
                pool.spawn_child(worker_id)?;
            }
        }

        Ok(pool)
    }

    /// The number of workers in this pool.
    pub fn len(&self) -> usize {
        self.table.borrow().len()
    }

    /// Whether this pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.table.borrow().is_empty()
    }

    fn entry_state(&self, worker_id: usize) -> EntryState {
        EntryState {
            saved_state: self.saved_state.clone(),
            gc_control: self.gc_control.clone(),
            heap_handle: self.heap_handle.clone(),
            worker_id,
        }
    }

    #[cfg(unix)]
    fn controller_fd(&self) -> Option<i32> {
        Some(self.liveness.borrow().read_fd())
    }

    #[cfg(not(unix))]
    fn controller_fd(&self) -> Option<i32> {
        None
    }

    fn spawn_child(&self, worker_id: usize) -> io::Result<()> {
        let params = WorkerParams {
            longlived: self.longlived,
            entry_state: self.entry_state(worker_id),
            controller_fd: self.controller_fd(),
        };
        let spawned = procpool_daemon::spawn(&self.executable, &params)?;

        self.table.borrow_mut().set_channel(worker_id, spawned);

        Ok(())
    }

    /// Ensure `worker_id` has a live child, spawning one if it is currently
    /// dormant. Idempotent: a no-op if the worker already has a channel.
    ///
    /// Only meaningful for clone-per-call workers; long-lived workers are
    /// already spawned by [`Pool::make`].
    pub fn spawn(&self, worker_id: usize) -> io::Result<()> {
        if self.table.borrow().get(worker_id).channel().is_some() {
            return Ok(());
        }

        self.spawn_child(worker_id)
    }

    /// Sever `worker_id`'s channel and kill its child, without marking the
    /// worker record terminal.
    ///
    /// Idempotent: closing an already-dormant worker is a no-op. Intended
    /// for clone-per-call workers between calls; a long-lived worker closed
    /// this way simply has no child until [`Pool::spawn`] is called again.
    pub fn close(&self, worker_id: usize) {
        if let Some(mut spawned) = self.table.borrow_mut().get_mut(worker_id).take_channel() {
            let _ = procpool_daemon::kill(&mut spawned);
        }
    }

    /// Dispatch `argument` to the registered entry point `entry` on
    /// `worker_id`, and return a handle for its eventual result.
    ///
    /// Preconditions: `worker_id` is neither busy nor force-quit; violating
    /// the first fails with [`Error::WorkerBusy`], violating the second
    /// fails with [`Error::FailedToSendJob`] (the worker is already gone,
    /// there is nothing to send to). Does not block: the request is
    /// written and the handle returned immediately.
    pub fn call<A, R>(&self, call_id: Option<u64>, worker_id: usize, entry: &'static str, argument: A) -> PoolResult<Handle<A, R>>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        if self.table.borrow().is_force_quit(worker_id) {
            return Err(Error::FailedToSendJob { worker_id, cause: SendJobError::AlreadyExited(-1) });
        }

        self.table.borrow_mut().mark_busy(worker_id)?;

        if !self.longlived && self.table.borrow().get(worker_id).channel().is_none() {
            if let Err(io_error) = self.spawn_child(worker_id) {
                self.table.borrow_mut().force_quit(worker_id);
                return Err(Error::FailedToSendJob { worker_id, cause: SendJobError::from(io_error) });
            }
        }

        let argument_bytes = procpool_executor::encode(&argument).map_err(|message| {
            self.table.borrow_mut().force_quit(worker_id);
            Error::FailedToSendJob { worker_id, cause: SendJobError::Other(message) }
        })?;

        let mode = if self.longlived { Mode::LongLived } else { Mode::ClonePerCall };
        let request = Request { entry: entry.to_string(), argument: argument_bytes, wrapper: self.call_wrapper.clone(), mode };

        let pid = {
            let table = self.table.borrow();
            table.get(worker_id).channel().expect("channel was spawned above").pid
        };

        {
            let mut table = self.table.borrow_mut();
            let worker = table.get_mut(worker_id);
            let spawned = worker.channel_mut().expect("channel was spawned above");

            if let Err(send_error) = spawned.channel.send(&request) {
                let cause = match spawned.child.try_wait() {
                    Ok(Some(status)) => SendJobError::AlreadyExited(status.code().unwrap_or(-1)),
                    _ => SendJobError::from(send_error),
                };

                drop(table);
                self.table.borrow_mut().force_quit(worker_id);

                return Err(Error::FailedToSendJob { worker_id, cause });
            }
        }

        let call_id = call_id.unwrap_or(0);
        let handle = Handle::new(self.table.clone(), worker_id, call_id, argument, pid);

        self.table.borrow_mut().set_handle(worker_id, ErasedHandle::new(call_id, worker_id, false));

        Ok(handle)
    }

    /// Cancel every handle in `handles`.
    ///
    /// A thin batch wrapper over [`Handle::cancel`]; provided so a
    /// scheduler can cancel handles of different job/result types in one
    /// call without downcasting anything.
    pub fn cancel(&self, handles: &[&dyn Cancellable]) {
        for handle in handles {
            handle.cancel();
        }
    }

    /// Retire every worker: close its channel, kill its child, and mark
    /// the record terminal. Idempotent; safe to call during shutdown.
    ///
    /// Also closes the controller's liveness pipe, so any worker that
    /// somehow survived force-quitting (or that was never reachable
    /// through its own channel) still observes the controller going away.
    pub fn force_quit_all(&self) {
        let ids: Vec<usize> = self.table.borrow().ids().collect();

        for worker_id in ids {
            self.table.borrow_mut().force_quit(worker_id);
        }

        #[cfg(unix)]
        self.liveness.borrow_mut().close();
    }

    /// The path to the worker executable this pool spawns children from.
    pub fn executable(&self) -> &Path {
        &self.executable
    }
}
