//! `procpool-select` is the readiness multiplexer: given a batch of pending
//! [`Handle`]s and a set of extra file descriptors a caller also cares
//! about, it blocks until at least one of them is ready and reports which.
//!
//! It never reads a response itself — only [`Handle::get_result`] does that
//! — so the single-consumer discipline on each handle's channel is
//! preserved no matter how many times `select` is called on it.

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
    io,
    os::fd::{BorrowedFd, RawFd},
};

use procpool_handle::Waitable;
use rustix::event::{poll, PollFd, PollFlags};

/// The result of one [`select`] call.
pub struct Outcome<'w> {
    /// Handles whose channel is readable, already known ready without
    /// polling (cancelled or force-quit), or that were pre-filtered for
    /// some other reason the caller should treat as "stop waiting on this
    /// one".
    pub readys: Vec<&'w dyn Waitable>,
    /// Handles that are still awaiting a result.
    pub waiters: Vec<&'w dyn Waitable>,
    /// The subset of the caller's `extra_fds` that were also ready.
    pub ready_fds: Vec<RawFd>,
}

/// Block until at least one of `waitables` or `extra_fds` is ready, then
/// partition `waitables` into `readys` and `waiters`.
///
/// A waitable whose [`Waitable::poll_source`] returns `None` (cancelled, or
/// its worker has already been force-quit) is placed directly into `readys`
/// without being polled at all: per the specification, a dead or cancelled
/// handle reports ready so the scheduler drains it promptly.
///
/// # Safety contract
///
/// `extra_fds` must each remain open and owned by the caller for the
/// duration of this call; `select` only borrows them to poll.
pub fn select<'w>(waitables: &[&'w dyn Waitable], extra_fds: &[RawFd]) -> io::Result<Outcome<'w>> {
    let mut readys = Vec::new();
    let mut pollable = Vec::new();

    for &waitable in waitables {
        match waitable.poll_source() {
            Some(fd) => pollable.push((waitable, fd)),
            None => readys.push(waitable),
        }
    }

    // Nothing left to block on: every waitable was already ready, and the
    // caller didn't ask us to watch any extra descriptor either.
    if pollable.is_empty() && extra_fds.is_empty() {
        return Ok(Outcome { readys, waiters: Vec::new(), ready_fds: Vec::new() });
    }

    let mut poll_fds = Vec::with_capacity(pollable.len() + extra_fds.len());

    for &(_, fd) in &pollable {
        // SAFETY: `fd` came from a channel owned by the worker table behind
        // this `Handle`, which outlives this call since `waitables` borrows
        // it for `'w` and we never touch the fd past this function.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        poll_fds.push(PollFd::new(&borrowed, PollFlags::IN));
    }

    for &fd in extra_fds {
        // SAFETY: the caller's contract guarantees `fd` stays open and
        // owned for the duration of this call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        poll_fds.push(PollFd::new(&borrowed, PollFlags::IN));
    }

    poll(&mut poll_fds, -1)?;

    let pollable_count = pollable.len();
    let is_ready = |flags: PollFlags| flags.intersects(PollFlags::IN | PollFlags::HUP | PollFlags::ERR);

    let mut waiters = Vec::new();

    for (index, (waitable, _fd)) in pollable.into_iter().enumerate() {
        if is_ready(poll_fds[index].revents()) {
            readys.push(waitable);
        } else {
            waiters.push(waitable);
        }
    }

    let mut ready_fds = Vec::new();

    for (offset, &fd) in extra_fds.iter().enumerate() {
        if is_ready(poll_fds[pollable_count + offset].revents()) {
            ready_fds.push(fd);
        }
    }

    Ok(Outcome { readys, waiters, ready_fds })
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, path::Path, rc::Rc};

    use procpool_daemon::SpawnedChild;
    use procpool_handle::Handle;
    use procpool_wire::{EntryState, WorkerParams};
    use procpool_worker_state::WorkerTable;

    use super::*;

    fn spawned_cat() -> (Rc<RefCell<WorkerTable>>, u32) {
        let table = Rc::new(RefCell::new(WorkerTable::new(1, true)));
        let params = WorkerParams { longlived: true, entry_state: EntryState::default(), controller_fd: None };
        let spawned: SpawnedChild = procpool_daemon::spawn(Path::new("/bin/cat"), &params).unwrap();
        let pid = spawned.pid;
        table.borrow_mut().set_channel(0, spawned);
        table.borrow_mut().mark_busy(0).unwrap();
        (table, pid)
    }

    #[test]
    fn a_cancelled_handle_is_immediately_ready() {
        let (table, pid) = spawned_cat();
        let handle: Handle<i64, i64> = Handle::new(table, 0, 1, 0, pid);
        handle.cancel();

        let outcome = select(&[&handle], &[]).unwrap();

        assert_eq!(outcome.readys.len(), 1);
        assert!(outcome.waiters.is_empty());
    }

    #[test]
    fn a_handle_with_a_pending_response_becomes_ready_once_written() {
        let (table, pid) = spawned_cat();

        {
            let mut table_ref = table.borrow_mut();
            let spawned = table_ref.get_mut(0).channel_mut().unwrap();
            spawned.channel.send(&procpool_wire::Response::Ok(bincode::serialize(&1_i64).unwrap())).unwrap();
        }

        let handle: Handle<i64, i64> = Handle::new(table, 0, 1, 0, pid);
        let outcome = select(&[&handle], &[]).unwrap();

        assert_eq!(outcome.readys.len(), 1);
        assert!(outcome.waiters.is_empty());

        handle.get_result().unwrap();
    }
}
