// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire-level plumbing for driving a `pkl server` child process: process
//! lifecycle, streaming msgpack framing over its stdio pipes, and the
//! request/response message catalog.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod error;
pub mod message;
pub mod process;
pub mod transport;

pub use error::IpcError;
pub use transport::{ChildTransport, FrameReader, PklCommand, WireReader, WireWriter};
