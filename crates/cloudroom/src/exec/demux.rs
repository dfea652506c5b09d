//! Incremental parser for the engine's multiplexed exec stream.
//!
//! Every frame starts with an 8-byte header: byte 0 selects the stream, bytes 4..8 hold
//! the payload length as a big-endian `u32`. Frames and even headers may be split across
//! arbitrary read chunks.

use bytes::{Buf, Bytes, BytesMut};

const HEADER_LEN: usize = 8;

/// Which output channel a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_selector(byte: u8) -> Self {
        // 0 is stdin echoed on stdout, 3 is the engine's own error channel.
        match byte {
            2 | 3 => StreamKind::Stderr,
            _ => StreamKind::Stdout,
        }
    }
}

/// One complete payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

/// Stateful demultiplexer. Feed it chunks in arrival order.
#[derive(Debug, Default)]
pub struct Demuxer {
    buf: BytesMut,
}

impl Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while self.buf.len() >= HEADER_LEN {
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if self.buf.len() < HEADER_LEN + len {
                break;
            }
            let kind = StreamKind::from_selector(self.buf[0]);
            self.buf.advance(HEADER_LEN);
            let payload = self.buf.split_to(len).freeze();
            if !payload.is_empty() {
                frames.push(Frame { kind, payload });
            }
        }
        frames
    }

    /// Bytes of an incomplete trailing frame still buffered.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Captured stdout and stderr of one command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DemuxedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl DemuxedOutput {
    pub fn append(&mut self, frame: &Frame) {
        match frame.kind {
            StreamKind::Stdout => self.stdout.extend_from_slice(&frame.payload),
            StreamKind::Stderr => self.stderr.extend_from_slice(&frame.payload),
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Encode one frame. Used by fake engines in tests and by nothing else.
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Vec<u8> {
    let selector = match kind {
        StreamKind::Stdout => 1u8,
        StreamKind::Stderr => 2u8,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&[selector, 0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
