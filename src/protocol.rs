//! Binary IPC protocol for the coordinator ↔ worker pipes.
//! Uses bincode records behind a u32 length prefix.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Dotted identifier naming one unit of loadable user code.
pub type ModuleName = String;

/// The single byte written on the sync pipe when a dead child has
/// been fully reaped by its parent.
pub const SYNC_BYTE: u8 = 0x06;

/// What really happened when one module name was imported: every
/// module that transitively became live as a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportEvent {
    pub requested: ModuleName,
    pub loaded: BTreeSet<ModuleName>,
}

impl ImportEvent {
    pub fn new(requested: &str, loaded: &[&str]) -> Self {
        Self {
            requested: requested.to_string(),
            loaded: loaded.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Requests the coordinator may send down the command pipe. The
/// finite command set replaces the original's "function over the
/// wire" scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Import the given names in order, reporting one event each.
    Preload(Vec<ModuleName>),
    /// Fork; the new child takes over the conversation.
    Fork,
    /// Run every test of one module, then stream EndOfStream and exit.
    RunTests { module: ModuleName, verbose: bool },
}

/// One traceback entry. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub path: String,
    pub line: u32,
    pub function: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailKind {
    Assertion,
    Exception,
    Setup,
}

impl FailKind {
    /// Letter appended to the reporter's progress log.
    pub fn letter(self) -> char {
        match self {
            FailKind::Assertion | FailKind::Exception => 'E',
            FailKind::Setup => 'F',
        }
    }
}

/// A failed test (or a module that could not even be set up).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailKind,
    /// Exception class name, e.g. "AssertionError".
    pub name: String,
    pub message: String,
    pub frames: Vec<Frame>,
    pub stdout: String,
    pub stderr: String,
}

/// Records streamed back up the result pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// A fork happened; the new top-of-stack process reports its pid.
    Forked(i32),
    /// Outcome of a Preload: the per-name events plus the paths of
    /// everything now live.
    Preloaded {
        events: Vec<ImportEvent>,
        paths: Vec<(ModuleName, PathBuf)>,
    },
    Pass,
    /// Pass carrying the test name; emitted only when the dispatch
    /// asked for verbosity.
    PassNamed(String),
    Fail(Failure),
    /// Paths of every module live in the child, sent before EndOfStream.
    Paths(Vec<(ModuleName, PathBuf)>),
    EndOfStream,
}

/// Encode a record as bincode bytes behind a u32-LE length prefix.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    let payload = bincode::serialize(value)?;
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame decoder. Accumulates arbitrarily short reads
/// and yields one complete payload at a time, never looking past a
/// record boundary.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame payload, if one has fully arrived.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 4 {
            return None;
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if self.buf.len() < 4 + len {
            return None;
        }
        let payload = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Some(payload)
    }

    /// Decode the next complete record, if any.
    pub fn next_response(&mut self) -> Result<Option<Response>, bincode::Error> {
        match self.next_frame() {
            Some(payload) => Ok(Some(bincode::deserialize(&payload)?)),
            None => Ok(None),
        }
    }

    /// Discard partially accumulated bytes. Used after a child is
    /// killed mid-record.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_failure() -> Failure {
        Failure {
            kind: FailKind::Exception,
            name: "ValueError".to_string(),
            message: "boom".to_string(),
            frames: vec![Frame {
                path: "pkg/mod.py".to_string(),
                line: 17,
                function: "test_boom".to_string(),
                source: "raise ValueError('boom')".to_string(),
            }],
            stdout: "some output".to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn frame_has_length_prefix() {
        let frame = encode_frame(&Response::Pass).unwrap();
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(len as usize, frame.len() - 4);
    }

    #[test]
    fn failure_roundtrip_is_identical() {
        let original = Response::Fail(sample_failure());
        let frame = encode_frame(&original).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame);
        let decoded = decoder.next_response().unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(decoder.is_empty());
    }

    #[test]
    fn decoder_tolerates_short_reads() {
        let frame = encode_frame(&Response::Fail(sample_failure())).unwrap();
        let mut decoder = FrameDecoder::new();
        for byte in &frame[..frame.len() - 1] {
            decoder.feed(std::slice::from_ref(byte));
            assert!(decoder.next_response().unwrap().is_none());
        }
        decoder.feed(&frame[frame.len() - 1..]);
        assert!(decoder.next_response().unwrap().is_some());
    }

    #[test]
    fn decoder_splits_concatenated_frames() {
        let mut bytes = encode_frame(&Response::Pass).unwrap();
        bytes.extend(encode_frame(&Response::EndOfStream).unwrap());
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        assert_eq!(decoder.next_response().unwrap(), Some(Response::Pass));
        assert_eq!(decoder.next_response().unwrap(), Some(Response::EndOfStream));
        assert_eq!(decoder.next_response().unwrap(), None);
    }

    #[test]
    fn clear_discards_torn_record() {
        let frame = encode_frame(&Response::Fail(sample_failure())).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&frame[..frame.len() / 2]);
        decoder.clear();
        decoder.feed(&encode_frame(&Response::Pass).unwrap());
        assert_eq!(decoder.next_response().unwrap(), Some(Response::Pass));
    }

    #[test]
    fn kind_letters_match_display_convention() {
        assert_eq!(FailKind::Assertion.letter(), 'E');
        assert_eq!(FailKind::Exception.letter(), 'E');
        assert_eq!(FailKind::Setup.letter(), 'F');
    }
}
