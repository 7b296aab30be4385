// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

/// Failures at the pipe and frame level.
///
/// `Closed` and `Io` mean the child process is gone or unusable; both are
/// fatal to everything multiplexed over the connection. `MalformedFrame` and
/// `UnexpectedCode` mean the child is alive but speaking something we don't
/// understand, which is just as fatal.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("transport closed")]
    Closed,
    #[error("pipe i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unexpected message code {0:#x}")]
    UnexpectedCode(u64),
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl IpcError {
    /// True when the child process itself is gone (as opposed to a protocol
    /// violation from a live child).
    pub fn is_disconnect(&self) -> bool {
        matches!(self, IpcError::Closed | IpcError::Io(_))
    }
}
