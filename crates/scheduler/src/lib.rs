//! `procpool-scheduler` is a small `ThreadPool` for running futures on
//! multiple threads — the shape of the higher-level task scheduler the
//! worker controller expects to sit above it, deciding which job goes to
//! which worker. It only consumes a worker pool's `call` and `select`
//! through ordinary futures; it has no knowledge of workers, handles, or
//! subprocesses itself.
//!
//! How it works is pretty simple. A `ThreadPool` creates _n_ `Worker`s. Each
//! `Worker` creates and owns a thread. The `ThreadPool` and the `Worker`s
//! communicate via an unbounded multi-producer multi-consumer (MPMC)
//! asynchronous channel, where `ThreadPool` owns the sender, and `Worker`s own
//! a clone of the receiver. When `ThreadPool::execute(future)` is called, it
//! sends the `Future` onto the channel. Each `Worker` uses its own
//! asynchronous executor to wait on the receiver. When a `Future` is
//! received, the executor spawns it in a detached mode, i.e. the `Future`
//! runs in the background. None of these steps are blocking.
//!
//! Distribution of the work is not based on a work-stealing approach (as is
//! usually the case), but relies on the fact that the asynchronous MPMC
//! channel sends the `Future` to whichever receiver is idle. They are idle
//! either because all their `Future`s are pending, or because there is no
//! `Future` at all. In some particular edge cases, it's possible for a
//! `Worker` to receive too many `Future`s because at some point they were
//! all pending, and suddenly there is a lot more work to do. In practice
//! this case happens rarely.
//!
//! This `ThreadPool` does not aim to be general-purpose or maximally
//! performant. It's tailored for a single need: give the worker controller
//! something simple above it to dispatch `call`s from and `select` on.

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
    cmp,
    future::Future,
    io,
    num::NonZeroUsize,
    pin::Pin,
    thread::{self, JoinHandle},
};

use async_channel::{unbounded, Receiver, SendError, Sender};
use async_executor::Executor;
use futures_lite::future::block_on;

/// A thread pool that runs `Future`s on whichever of its threads is idle.
///
/// The caller doesn't have to care about where their `Future`s are going to
/// be executed; they are just sent where there is idleness. In the current
/// design, _idle_ means a thread whose asynchronous executor has no
/// `Future` running at all, or whose `Future`s are all pending.
pub struct ThreadPool<'e, T> {
    _workers: Vec<Worker>,
    executor: Executor<'e>,
    sender: Sender<Job<T>>,
}

impl<'e, T> ThreadPool<'e, T>
where
    T: Send + 'static,
{
    /// Create a new pool of threads, of maximum size `desired_pool_size`.
    ///
    /// Threads are created eagerly; they are ready by the time this
    /// constructor returns.
    ///
    /// Why `desired_pool_size` rather than an exact `pool_size`? Because
    /// parallelism is a resource: a given machine provides a certain
    /// capacity for it, often but not always bounded by its CPU count. Host
    /// environments such as VMs or container orchestrators may restrict the
    /// parallelism available to programs running in them, so
    /// `desired_pool_size` is clamped between 1 and
    /// [`std::thread::available_parallelism`].
    pub fn new(desired_pool_size: NonZeroUsize) -> Result<Self, io::Error> {
        let pool_size = cmp::min(desired_pool_size, thread::available_parallelism()?).get();

        let mut workers = Vec::with_capacity(pool_size);

        let (sender, receiver) = unbounded::<Job<T>>();

        for nth in 0..pool_size {
            workers.push(Worker::new(nth, receiver.clone())?);
        }

        Ok(Self { _workers: workers, executor: Executor::new(), sender })
    }

    /// Execute a `Future` on a thread that can accept it.
    pub fn execute<F>(&self, work: F) -> Result<(), SendError<Job<T>>>
    where
        F: Future<Output = T> + Send + 'static,
    {
        block_on(self.executor.run(self.sender.send(Box::pin(work))))
    }
}

/// A `Worker` executes work, aka `Job`.
struct Worker {
    _thread_handle: JoinHandle<()>,
}

/// Type alias for a job, i.e. what a `Worker` will execute.
type Job<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

impl Worker {
    fn new<T>(worker_id: usize, receiver: Receiver<Job<T>>) -> Result<Self, io::Error>
    where
        T: Send + 'static,
    {
        let thread_handle = thread::Builder::new()
            .name(format!("{prefix}-worker-{worker_id}", prefix = env!("CARGO_PKG_NAME")))
            .spawn(move || {
                let executor = Executor::new();

                block_on(executor.run(async {
                    while let Ok(received_future) = receiver.recv().await {
                        executor.spawn(received_future).detach();
                    }
                }))
            })?;

        Ok(Self { _thread_handle: thread_handle })
    }
}
