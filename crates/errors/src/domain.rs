//! The error surface shared by every `procpool` crate: what a worker's
//! child can die of, why a job couldn't be sent to it, and what a caller of
//! the pool controller sees when either happens.

use crate::error;

error! {
    #[doc = "Why a worker's child process stopped being usable."]
    pub enum WorkerFailure {
        #[code = E100]
        #[message = "the child was killed by the platform's out-of-memory killer"]
        #[help = "reduce the job's memory footprint, or raise the worker's memory limit"]
        Oomed,

        #[code = E101]
        #[message = "the child exited mid-protocol"]
        #[formatted_message("the child exited with status {0}")]
        #[help = "a response was expected but the child exited first; check its stderr"]
        Quit(i32),

        #[code = E102]
        #[message = "the child was terminated by a signal"]
        #[formatted_message("the child was terminated by signal {0}")]
        #[help = "something outside this process killed the child; check dmesg or the process supervisor"]
        Signaled(i32),

        #[code = E108]
        #[message = "the entry point returned an explicit failure, or panicked"]
        #[formatted_message("the entry point failed: {0}")]
        #[help = "see the message for the cause reported from inside the child"]
        EntryPointFailed(String),

        #[code = E109]
        #[message = "the call was cancelled before a result arrived"]
        #[help = "this is expected after `cancel`; any result the child produces afterward is discarded"]
        Cancelled,
    }
}

error! {
    #[doc = "Why `call` could not hand a job to a worker's child."]
    pub enum SendJobError {
        #[code = E103]
        #[message = "the child had already exited before the request was written"]
        #[formatted_message("the child had already exited with status {0}")]
        #[help = "the worker should be force-quit; a higher-level scheduler may retry on another worker"]
        AlreadyExited(i32),

        #[code = E104]
        #[message = "some other transport error prevented the job from being sent"]
        #[formatted_message("{0}")]
        #[help = "see the message for the underlying cause"]
        Other(String),
    }
}

impl From<std::io::Error> for SendJobError {
    fn from(error: std::io::Error) -> Self {
        Self::Other(error.to_string())
    }
}

error! {
    #[doc = "Errors surfaced to a caller of the pool controller."]
    #[doc = "\n"]
    #[doc = "None of these are retried internally: the core reports, an outer"]
    #[doc = "scheduler decides whether and where to retry."]
    pub enum Error {
        #[code = E105]
        #[message = "a second `call` was issued on a worker that is already busy"]
        #[formatted_message("worker #{0} is busy: a second `call` was issued before the first completed")]
        #[help = "this is a scheduler bug, not a runtime condition: wait for `get_result` or `cancel` first"]
        WorkerBusy(usize),

        #[code = E106]
        #[message = "a worker's child died or reported failure"]
        #[formatted_message("worker #{worker_id} (pid {pid}) failed: {failure}")]
        #[help = "the worker has been force-quit; the job argument is still available for requeueing"]
        WorkerFailed { worker_id: usize, pid: u32, failure: WorkerFailure },

        #[code = E107]
        #[message = "a job could not be sent to a worker's child"]
        #[formatted_message("could not send the job to worker #{worker_id}: {cause}")]
        #[help = "the worker has been force-quit; a higher-level scheduler may retry on another worker"]
        FailedToSendJob { worker_id: usize, cause: SendJobError },
    }
}

/// Shorthand for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
