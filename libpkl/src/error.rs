// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libpkl_ipc::IpcError;
use libpkl_value::DecodeError;

/// Everything an evaluation can fail with.
///
/// `Transport` and `Protocol` are fatal: the child process (or our view of
/// it) is broken and every in-flight operation on the manager fails with one
/// of them. `Evaluation` and `Schema` concern a single request and leave the
/// session usable. Reader failures never show up here at all; they are
/// reported back to the server inside the callback response and the server
/// decides whether the evaluation fails.
#[derive(Debug, thiserror::Error)]
pub enum PklError {
    #[error("transport failure: {0}")]
    Transport(IpcError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("failed to create evaluator: {0}")]
    Init(String),
    // Rendered verbatim on its own lines; evaluator errors are multi-line
    // reports meant to be read as emitted.
    #[error("\n{0}")]
    Evaluation(String),
    #[error("schema binding failed: {0}")]
    Schema(#[from] DecodeError),
    #[error("evaluator is closed")]
    SessionClosed,
    #[error("invalid project: {0}")]
    Project(String),
    #[error("invalid module source: {0}")]
    Source(String),
}

impl From<IpcError> for PklError {
    fn from(err: IpcError) -> Self {
        if err.is_disconnect() {
            PklError::Transport(err)
        } else {
            PklError::Protocol(err.to_string())
        }
    }
}
