// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Blocking transport over a `pkl server` child process.
//!
//! The child's stdout is a concatenation of msgpack values with no extra
//! length framing, so the reader keeps an incremental buffer and repeatedly
//! attempts to cut one complete value out of it, pulling more bytes from the
//! pipe whenever the buffered prefix is incomplete. stderr is drained on a
//! dedicated thread so a chatty child can never block on it.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

use bytes::{Buf, BytesMut};
use tracing::debug;

use crate::error::IpcError;
use crate::process;

const READ_CHUNK: usize = 8 * 1024;

/// How to invoke the evaluator child process.
///
/// [`PklCommand::resolve`] picks the conventional invocation: the binary
/// named by the `PKL_EXEC` environment variable, or `pkl` from `PATH`, run
/// in server mode. A fully custom argv can be supplied instead.
#[derive(Debug, Clone)]
pub struct PklCommand {
    program: String,
    args: Vec<String>,
}

impl PklCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        PklCommand {
            program: program.into(),
            args,
        }
    }

    pub fn resolve() -> Self {
        let program = std::env::var("PKL_EXEC").unwrap_or_else(|_| "pkl".to_owned());
        PklCommand {
            program,
            args: vec!["server".to_owned()],
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

/// Sends one encoded frame to the child, atomically from the caller's point
/// of view (append then flush).
pub trait WireWriter: Send {
    fn send(&mut self, frame: &[u8]) -> Result<(), IpcError>;
}

/// Blocks until one complete msgpack value is available and returns it.
pub trait WireReader: Send {
    fn receive(&mut self) -> Result<rmpv::Value, IpcError>;
}

/// Owns the spawned child. Dropping it (or calling [`ChildTransport::shutdown`])
/// terminates and reaps the process; shutdown is idempotent.
#[derive(Debug)]
pub struct ChildTransport {
    child: Child,
    closed: bool,
    stderr_thread: Option<JoinHandle<()>>,
}

impl ChildTransport {
    /// Spawns the child with piped stdio and splits the connection into its
    /// writer and reader halves. The pid is registered with the global exit
    /// hook before this returns.
    pub fn spawn(
        command: &PklCommand,
        debug: bool,
    ) -> Result<(ChildTransport, ChildWriter, FrameReader<ChildStdout>), IpcError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if debug {
            cmd.env("PKL_DEBUG", "1");
        }
        let mut child = cmd.spawn()?;
        let stdin = take_pipe(child.stdin.take())?;
        let stdout = take_pipe(child.stdout.take())?;
        let stderr = take_pipe(child.stderr.take())?;

        process::register(child.id());
        let stderr_thread = std::thread::Builder::new()
            .name("pkl-stderr".to_owned())
            .spawn(move || drain_stderr(stderr))?;

        let transport = ChildTransport {
            child,
            closed: false,
            stderr_thread: Some(stderr_thread),
        };
        Ok((transport, ChildWriter { stdin }, FrameReader::new(stdout)))
    }

    /// Terminates the child, reaps it, and deregisters the pid. Safe to call
    /// more than once.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.child.kill();
        let _ = self.child.wait();
        process::deregister(self.child.id());
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ChildTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn take_pipe<T>(pipe: Option<T>) -> Result<T, IpcError> {
    pipe.ok_or_else(|| IpcError::Io(io::Error::other("child spawned without piped stdio")))
}

fn drain_stderr(stderr: ChildStderr) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(line) => debug!(target: "pkl::server", "{line}"),
            Err(_) => break,
        }
    }
}

/// Writer half of the connection.
#[derive(Debug)]
pub struct ChildWriter {
    stdin: ChildStdin,
}

impl WireWriter for ChildWriter {
    fn send(&mut self, frame: &[u8]) -> Result<(), IpcError> {
        self.stdin.write_all(frame).map_err(map_pipe_error)?;
        self.stdin.flush().map_err(map_pipe_error)
    }
}

fn map_pipe_error(err: io::Error) -> IpcError {
    if err.kind() == io::ErrorKind::BrokenPipe {
        IpcError::Closed
    } else {
        IpcError::Io(err)
    }
}

/// Reader half: a streaming unpacker over any byte source.
#[derive(Debug)]
pub struct FrameReader<R> {
    source: R,
    buf: BytesMut,
}

impl<R: Read> FrameReader<R> {
    pub fn new(source: R) -> Self {
        FrameReader {
            source,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }
}

impl<R: Read + Send> WireReader for FrameReader<R> {
    fn receive(&mut self) -> Result<rmpv::Value, IpcError> {
        loop {
            if !self.buf.is_empty() {
                let mut cursor: &[u8] = &self.buf;
                match rmpv::decode::read_value(&mut cursor) {
                    Ok(value) => {
                        let consumed = self.buf.len() - cursor.len();
                        self.buf.advance(consumed);
                        return Ok(value);
                    }
                    Err(ref err) if is_incomplete(err) => {}
                    Err(err) => return Err(IpcError::MalformedFrame(err.to_string())),
                }
            }
            let mut chunk = [0u8; READ_CHUNK];
            let read = self.source.read(&mut chunk).map_err(map_pipe_error)?;
            if read == 0 {
                return Err(IpcError::Closed);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }
}

/// An `UnexpectedEof` while cutting a value only means the buffered prefix
/// stops mid-value; more bytes from the pipe may complete it.
fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(io) | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmpv::Value;

    /// A reader that hands out its bytes in deliberately tiny pieces, the way
    /// a pipe does under load.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let end = usize::min(self.pos + self.step, self.data.len());
            let n = usize::min(end - self.pos, buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn encoded(values: &[Value]) -> Vec<u8> {
        let mut out = Vec::new();
        for value in values {
            rmpv::encode::write_value(&mut out, value).unwrap();
        }
        out
    }

    #[test]
    fn reads_one_value_per_call_across_partial_reads() {
        let first = Value::Array(vec![Value::from(0x24), Value::from("payload")]);
        let second = Value::from("tail");
        let reader = Trickle {
            data: encoded(&[first.clone(), second.clone()]),
            pos: 0,
            step: 3,
        };
        let mut frames = FrameReader::new(reader);
        assert_eq!(frames.receive().unwrap(), first);
        assert_eq!(frames.receive().unwrap(), second);
        assert!(matches!(frames.receive(), Err(IpcError::Closed)));
    }

    #[test]
    fn two_values_in_one_chunk_are_split() {
        let a = Value::from(1u64);
        let b = Value::from(2u64);
        let reader = Trickle {
            data: encoded(&[a.clone(), b.clone()]),
            pos: 0,
            step: 1024,
        };
        let mut frames = FrameReader::new(reader);
        assert_eq!(frames.receive().unwrap(), a);
        assert_eq!(frames.receive().unwrap(), b);
    }

    #[test]
    fn eof_mid_value_is_closed() {
        let mut bytes = encoded(&[Value::from("a longer string payload")]);
        bytes.truncate(bytes.len() - 4);
        let reader = Trickle {
            data: bytes,
            pos: 0,
            step: 1024,
        };
        let mut frames = FrameReader::new(reader);
        assert!(matches!(frames.receive(), Err(IpcError::Closed)));
    }
}
