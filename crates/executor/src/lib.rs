//! `procpool-executor` is the job executor that runs inside a worker's
//! child process: it reads a request frame, looks up and runs the requested
//! entry point, and writes back a response frame.
//!
//! Rust cannot ship a closure across a process boundary, so this crate
//! follows the specification's own suggested substitution: a **registered
//! entry-point dispatch**. The embedding application builds a [`Registry`]
//! mapping string tags to plain `fn` pointers, and runs the exact same
//! registration code in both the role that becomes the controller and the
//! role that becomes a worker child (they are the same compiled binary;
//! which role a process takes is decided at startup, before the registry is
//! built). A [`Request`](procpool_wire::Request) then carries a tag plus a
//! `bincode`-encoded argument blob instead of code.

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
    collections::HashMap,
    io::{self, Read, Write},
    panic::{catch_unwind, AssertUnwindSafe},
};

use procpool_wire::{read_frame, write_frame, Mode, Request, Response, WorkerParams};
use serde::{de::DeserializeOwned, Serialize};

/// A registered entry point: takes the `bincode`-encoded argument, returns
/// either the `bincode`-encoded result or a rendered error message.
///
/// A bare `fn` pointer, not a boxed closure: the whole point of a
/// registered-entry-point table is that every entry is a top-level function
/// with no captured environment, so parent and child processes can agree on
/// its identity just by agreeing on its name.
pub type EntryFn = fn(&[u8]) -> Result<Vec<u8>, String>;

/// A registered call wrapper: given the entry point it wraps and the
/// argument bytes, decides how (and whether) to invoke it. Used to install
/// cross-cutting instrumentation (timing, tracing spans, resource limits)
/// around every call made through it.
pub type WrapperFn = fn(EntryFn, &[u8]) -> Result<Vec<u8>, String>;

/// Decode a `bincode`-encoded argument, rendering failures as a [`String`]
/// so they fit in a [`Response::Failed`].
pub fn decode<A: DeserializeOwned>(bytes: &[u8]) -> Result<A, String> {
    bincode::deserialize(bytes).map_err(|error| format!("failed to decode argument: {error}"))
}

/// Encode a result as `bincode`, rendering failures as a [`String`].
pub fn encode<R: Serialize>(value: &R) -> Result<Vec<u8>, String> {
    bincode::serialize(value).map_err(|error| format!("failed to encode result: {error}"))
}

/// The table of entry points and call wrappers a worker child can dispatch
/// to, built identically by the controller process and every worker child
/// it spawns.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<&'static str, EntryFn>,
    wrappers: HashMap<&'static str, WrapperFn>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry point under `name`. Returns `self` for chaining.
    pub fn register_entry(mut self, name: &'static str, entry: EntryFn) -> Self {
        self.entries.insert(name, entry);
        self
    }

    /// Register a call wrapper under `name`. Returns `self` for chaining.
    pub fn register_wrapper(mut self, name: &'static str, wrapper: WrapperFn) -> Self {
        self.wrappers.insert(name, wrapper);
        self
    }

    /// Look up a registered entry point by name.
    pub fn entry(&self, name: &str) -> Option<EntryFn> {
        self.entries.get(name).copied()
    }

    /// Look up a registered call wrapper by name.
    pub fn wrapper(&self, name: &str) -> Option<WrapperFn> {
        self.wrappers.get(name).copied()
    }
}

/// Run one request to completion, catching panics at the executor boundary
/// exactly as the specification requires: an unhandled panic inside the
/// entry point becomes a [`Response::Failed`], not a crash.
fn dispatch(registry: &Registry, request: &Request) -> Response {
    let Some(entry) = registry.entry(&request.entry) else {
        return Response::Failed(format!("no entry point registered under `{}`", request.entry));
    };

    let wrapper = match &request.wrapper {
        Some(name) => match registry.wrapper(name) {
            Some(wrapper) => Some(wrapper),
            None => return Response::Failed(format!("no call wrapper registered under `{name}`")),
        },
        None => None,
    };

    let argument = request.argument.as_slice();

    let outcome = catch_unwind(AssertUnwindSafe(|| match wrapper {
        Some(wrapper) => wrapper(entry, argument),
        None => entry(argument),
    }));

    match outcome {
        Ok(Ok(bytes)) => Response::Ok(bytes),
        Ok(Err(message)) => Response::Failed(message),
        Err(panic) => Response::Failed(render_panic(panic)),
    }
}

fn render_panic(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("entry point panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("entry point panicked: {message}")
    } else {
        "entry point panicked with a non-string payload".to_string()
    }
}

/// Run the worker's main loop: read the [`WorkerParams`] handshake, then
/// serve requests until the controller closes its end.
///
/// For a long-lived worker, this loops until end-of-file on `input`,
/// running each request in-process and writing its response before reading
/// the next one (requests are strictly serialized by construction: the
/// controller never writes a second request before reading the first
/// response). For a clone-per-call worker, it serves exactly one request
/// and returns; the caller (the worker binary's `main`) is expected to exit
/// immediately afterwards, giving every call a throwaway address space.
///
/// Returns once the controller side has gone away cleanly. I/O errors other
/// than a clean end-of-file propagate to the caller, which should exit with
/// a non-zero status so the controller's process-exit mapping can tell the
/// difference between "the parent hung up" and "the child crashed".
pub fn serve<I, O>(registry: &Registry, mut input: I, mut output: O) -> io::Result<()>
where
    I: Read,
    O: Write,
{
    let params: WorkerParams = read_frame(&mut input)?;

    tracing::debug!(
        longlived = params.longlived,
        worker_id = params.entry_state.worker_id,
        controller_fd = ?params.controller_fd,
        "worker handshake received"
    );

    loop {
        let request: Request = match read_frame(&mut input) {
            Ok(request) => request,
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!("controller closed the channel; worker exiting");
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let mode = request.mode;
        let response = dispatch(registry, &request);
        write_frame(&mut output, &response)?;

        if mode == Mode::ClonePerCall {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde::{Deserialize, Serialize};

    use super::*;

    fn add_one(bytes: &[u8]) -> Result<Vec<u8>, String> {
        let n: i64 = decode(bytes)?;
        encode(&(n + 1))
    }

    fn panics(_: &[u8]) -> Result<Vec<u8>, String> {
        panic!("boom");
    }

    fn time_it(entry: EntryFn, bytes: &[u8]) -> Result<Vec<u8>, String> {
        entry(bytes)
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Point {
        x: i32,
        y: i32,
    }

    fn negate_point(bytes: &[u8]) -> Result<Vec<u8>, String> {
        let point: Point = decode(bytes)?;
        encode(&Point { x: -point.x, y: -point.y })
    }

    fn registry() -> Registry {
        Registry::new()
            .register_entry("add_one", add_one)
            .register_entry("panics", panics)
            .register_entry("negate_point", negate_point)
            .register_wrapper("time_it", time_it)
    }

    fn request(entry: &str, argument: Vec<u8>, wrapper: Option<&str>, mode: Mode) -> Request {
        Request { entry: entry.to_string(), argument, wrapper: wrapper.map(str::to_string), mode }
    }

    #[test]
    fn dispatches_a_known_entry() {
        let response = dispatch(&registry(), &request("add_one", encode(&41_i64).unwrap(), None, Mode::LongLived));

        match response {
            Response::Ok(bytes) => assert_eq!(decode::<i64>(&bytes).unwrap(), 42),
            Response::Failed(message) => panic!("unexpected failure: {message}"),
        }
    }

    #[test]
    fn dispatches_through_a_wrapper() {
        let response = dispatch(
            &registry(),
            &request("add_one", encode(&1_i64).unwrap(), Some("time_it"), Mode::LongLived),
        );

        match response {
            Response::Ok(bytes) => assert_eq!(decode::<i64>(&bytes).unwrap(), 2),
            Response::Failed(message) => panic!("unexpected failure: {message}"),
        }
    }

    #[test]
    fn unknown_entry_fails_cleanly() {
        let response = dispatch(&registry(), &request("missing", Vec::new(), None, Mode::LongLived));

        assert!(matches!(response, Response::Failed(_)));
    }

    #[test]
    fn a_panic_becomes_a_failed_response() {
        let response = dispatch(&registry(), &request("panics", Vec::new(), None, Mode::LongLived));

        match response {
            Response::Failed(message) => assert!(message.contains("boom")),
            Response::Ok(_) => panic!("a panicking entry point should not succeed"),
        }
    }

    #[test]
    fn struct_arguments_round_trip() {
        let response = dispatch(
            &registry(),
            &request("negate_point", encode(&Point { x: 1, y: -2 }).unwrap(), None, Mode::LongLived),
        );

        match response {
            Response::Ok(bytes) => assert_eq!(decode::<Point>(&bytes).unwrap(), Point { x: -1, y: 2 }),
            Response::Failed(message) => panic!("unexpected failure: {message}"),
        }
    }

    #[test]
    fn serve_handles_one_request_in_clone_per_call_mode() {
        let params = WorkerParams { longlived: false, entry_state: Default::default(), controller_fd: None };

        let mut input = Vec::new();
        procpool_wire::write_frame(&mut input, &params).unwrap();
        procpool_wire::write_frame(
            &mut input,
            &request("add_one", encode(&9_i64).unwrap(), None, Mode::ClonePerCall),
        )
        .unwrap();

        let mut output = Vec::new();
        serve(&registry(), Cursor::new(input), &mut output).unwrap();

        let mut output = Cursor::new(output);
        let response: Response = procpool_wire::read_frame(&mut output).unwrap();

        match response {
            Response::Ok(bytes) => assert_eq!(decode::<i64>(&bytes).unwrap(), 10),
            Response::Failed(message) => panic!("unexpected failure: {message}"),
        }
    }

    #[test]
    fn serve_loops_for_longlived_workers_until_eof() {
        let params = WorkerParams { longlived: true, entry_state: Default::default(), controller_fd: None };

        let mut input = Vec::new();
        procpool_wire::write_frame(&mut input, &params).unwrap();
        for n in 0..3 {
            procpool_wire::write_frame(
                &mut input,
                &request("add_one", encode(&n).unwrap(), None, Mode::LongLived),
            )
            .unwrap();
        }

        let mut output = Vec::new();
        serve(&registry(), Cursor::new(input), &mut output).unwrap();

        let mut output = Cursor::new(output);
        for n in 0..3 {
            let response: Response = procpool_wire::read_frame(&mut output).unwrap();
            match response {
                Response::Ok(bytes) => assert_eq!(decode::<i64>(&bytes).unwrap(), n + 1),
                Response::Failed(message) => panic!("unexpected failure: {message}"),
            }
        }
    }
}
