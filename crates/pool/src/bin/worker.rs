//! Worker entry point: the executable `procpool-pool`'s controller spawns
//! for every child process, long-lived or clone-per-call.
//!
//! Registers the entry points this workspace's own tests dispatch to, then
//! hands off to [`procpool_executor::serve`] for the rest of its life.

use std::{io, process::ExitCode};

use procpool_executor::{decode, encode, Registry};

fn add_one(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let n: i64 = decode(bytes)?;
    encode(&(n + 1))
}

fn double(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let n: i64 = decode(bytes)?;
    encode(&(n * 2))
}

fn always_panics(_: &[u8]) -> Result<Vec<u8>, String> {
    panic!("this entry point always panics");
}

fn registry() -> Registry {
    Registry::new()
        .register_entry("add_one", add_one)
        .register_entry("double", double)
        .register_entry("always_panics", always_panics)
}

fn main() -> ExitCode {
    let stdin = io::stdin();
    let stdout = io::stdout();

    match procpool_executor::serve(&registry(), stdin.lock(), stdout.lock()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("procpool-worker: {error}");
            ExitCode::FAILURE
        }
    }
}
