//! `procpool-wire` frames requests and responses on the controller ↔ worker
//! pipe.
//!
//! Exactly one request and one response are exchanged per call. Framing is a
//! 4-byte, native-endian length prefix followed by a [`bincode`]-encoded
//! payload. This is a same-host IPC protocol between a parent and a child it
//! just spawned, not a portable wire format, so there is no attempt at
//! endianness normalisation or forward compatibility.

#![deny(unused)]
#![deny(warnings)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::missing_crate_level_docs)]
#![deny(rustdoc::invalid_codeblock_attributes)]
#![deny(rustdoc::invalid_rust_codeblocks)]

use std::io::{self, Read, Write};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Frames above this size are refused; a corrupt length prefix should not
/// make the controller try to allocate gigabytes on the caller's behalf.
const MAX_FRAME_LEN: u32 = 1 << 30;

/// Write one length-prefixed, `bincode`-encoded frame, then flush.
pub fn write_frame<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: Write,
    T: Serialize,
{
    let payload = bincode::serialize(value).map_err(to_io_error)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame is too large to send"))?;

    writer.write_all(&len.to_ne_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()
}

/// Read one length-prefixed, `bincode`-encoded frame.
///
/// A short read or an end-of-file before a complete frame surfaces as
/// [`io::ErrorKind::UnexpectedEof`], which callers map to a worker-failure
/// kind (a dead child looks exactly like a truncated frame).
pub fn read_frame<R, T>(reader: &mut R) -> io::Result<T>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut len_bytes = [0_u8; 4];
    reader.read_exact(&mut len_bytes)?;

    let len = u32::from_ne_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame length exceeds sanity bound"));
    }

    let mut payload = vec![0_u8; len as usize];
    reader.read_exact(&mut payload)?;

    bincode::deserialize(&payload).map_err(to_io_error)
}

fn to_io_error(error: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}

/// How the child should run the job it was just sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Run the job in-process and reuse this child for the next request.
    LongLived,
    /// Run exactly one job, write its response, then exit.
    ClonePerCall,
}

/// A job request: which registered entry point to run, the serialized
/// argument, an optional call wrapper, and the dispatch [`Mode`].
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    /// Name of the entry point registered in the child's registry, looked up
    /// by the child when the frame arrives. The registry itself lives in
    /// `procpool-executor`, to keep this crate free of any dependency on how
    /// entry points are looked up.
    pub entry: String,
    /// `bincode`-encoded argument, opaque to this crate.
    pub argument: Vec<u8>,
    /// Name of a registered call wrapper to run the entry point through, if
    /// any.
    pub wrapper: Option<String>,
    /// Dispatch mode for this particular request.
    pub mode: Mode,
}

/// A job response: either the `bincode`-encoded success value, or a
/// human-readable description of what went wrong inside the closure.
#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    /// The entry point ran to completion; payload is the encoded result.
    Ok(Vec<u8>),
    /// The entry point returned or panicked with an error; payload is a
    /// rendering of that error, since the original error type does not
    /// necessarily survive the process boundary.
    Failed(String),
}

/// Opaque token identifying a shared-heap region a child attaches to.
///
/// The core never interprets this value; it is relayed from [`EntryState`]
/// to the child at spawn time and handed back to whatever storage subsystem
/// the embedding application wires up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapHandle(pub Vec<u8>);

/// Opaque control blob for whatever garbage-collector tuning the embedding
/// application cares about. Passed through unexamined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcControl(pub Vec<u8>);

/// Immutable state handed to a child at spawn time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryState {
    /// Opaque, caller-supplied value (e.g. a serialized application config).
    pub saved_state: Vec<u8>,
    /// Garbage-collection tuning, passed through as-is.
    pub gc_control: GcControl,
    /// Shared-heap handle the child should attach to.
    pub heap_handle: HeapHandle,
    /// The id this worker was assigned by the pool controller.
    pub worker_id: usize,
}

/// Handshake parameters sent as the very first frame on a freshly spawned
/// child's channel, before any [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerParams {
    /// Whether this child is long-lived (serves many jobs) or will be asked
    /// to serve exactly one before exiting.
    pub longlived: bool,
    /// State handed down from the pool controller at spawn time.
    pub entry_state: EntryState,
    /// Raw fd number of a pipe's read end the controller keeps open for as
    /// long as it is alive, inherited into this child across `fork`/`exec`
    /// rather than sent down the channel itself (a fd number is only
    /// meaningful within the process that owns the table it indexes).
    ///
    /// Lets a child observe the controller's death independently of its own
    /// request/response traffic, by polling this descriptor for
    /// end-of-file; this crate only relays the number; `procpool-daemon`
    /// owns the pipe and `procpool-select`-style polling is up to the
    /// child. `None` on platforms without fd inheritance semantics.
    pub controller_fd: Option<i32>,
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn round_trips_a_request() {
        let request = Request {
            entry: "add_one".to_string(),
            argument: bincode::serialize(&41_i64).unwrap(),
            wrapper: None,
            mode: Mode::LongLived,
        };

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &request).unwrap();

        let mut cursor = Cursor::new(buffer);
        let decoded: Request = read_frame(&mut cursor).unwrap();

        assert_eq!(decoded.entry, "add_one");
        assert_eq!(decoded.mode, Mode::LongLived);
    }

    #[test]
    fn truncated_frame_is_unexpected_eof() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &Response::Ok(vec![1, 2, 3])).unwrap();
        buffer.truncate(buffer.len() - 1);

        let mut cursor = Cursor::new(buffer);
        let result: io::Result<Response> = read_frame(&mut cursor);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(MAX_FRAME_LEN + 1).to_ne_bytes());

        let mut cursor = Cursor::new(buffer);
        let result: io::Result<Response> = read_frame(&mut cursor);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
