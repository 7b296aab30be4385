// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! An in-memory wire for exercising the manager without a child process.
//!
//! Tests script the server's half of the conversation as a frame queue and
//! inspect every frame the client sent. Request ids are allocated from 1 in
//! submission order, so a script can name them up front.

// Assertion helpers; panicking on a malformed frame is the point.
#![allow(clippy::panic, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use libpkl_ipc::{IpcError, WireReader, WireWriter};
use rmpv::Value;

use crate::sync::MutexExt;

/// A scripted connection. Clones share the same queues.
#[derive(Clone, Default)]
pub struct ScriptedWire {
    inbound: Arc<Mutex<VecDeque<Value>>>,
    sent: Arc<Mutex<Vec<Value>>>,
}

impl ScriptedWire {
    pub fn new() -> Self {
        ScriptedWire::default()
    }

    /// Appends frames the "server" will deliver, in order.
    pub fn script(&self, frames: impl IntoIterator<Item = Value>) {
        self.inbound.lock_or_panic().extend(frames);
    }

    /// Every frame the client has sent so far, decoded.
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock_or_panic().clone()
    }

    /// Frames the script still holds (empty once the conversation ran to
    /// completion).
    pub fn remaining(&self) -> usize {
        self.inbound.lock_or_panic().len()
    }

    pub fn writer(&self) -> Box<dyn WireWriter> {
        Box::new(ScriptedWriter(self.clone()))
    }

    pub fn reader(&self) -> Box<dyn WireReader> {
        Box::new(ScriptedReader(self.clone()))
    }
}

struct ScriptedWriter(ScriptedWire);

impl WireWriter for ScriptedWriter {
    fn send(&mut self, frame: &[u8]) -> Result<(), IpcError> {
        let mut cursor = frame;
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|err| IpcError::MalformedFrame(err.to_string()))?;
        if !cursor.is_empty() {
            return Err(IpcError::MalformedFrame(
                "outbound frame has trailing bytes".to_owned(),
            ));
        }
        self.0.sent.lock_or_panic().push(value);
        Ok(())
    }
}

struct ScriptedReader(ScriptedWire);

impl WireReader for ScriptedReader {
    fn receive(&mut self) -> Result<Value, IpcError> {
        self.0
            .inbound
            .lock_or_panic()
            .pop_front()
            .ok_or(IpcError::Closed)
    }
}

/// Builds a `[code, body]` frame from field pairs.
pub fn frame(code: u8, fields: Vec<(&str, Value)>) -> Value {
    Value::Array(vec![
        Value::from(code),
        Value::Map(
            fields
                .into_iter()
                .map(|(name, value)| (Value::from(name), value))
                .collect(),
        ),
    ])
}

/// The body map of an outbound frame, for assertions.
pub fn body_of(frame: &Value) -> Vec<(Value, Value)> {
    match frame {
        Value::Array(items) if items.len() == 2 => match &items[1] {
            Value::Map(fields) => fields.clone(),
            other => panic!("frame body is not a map: {other}"),
        },
        other => panic!("not a [code, body] frame: {other}"),
    }
}

pub fn code_of(frame: &Value) -> u64 {
    match frame {
        Value::Array(items) if !items.is_empty() => {
            items[0].as_u64().expect("frame code is not an integer")
        }
        other => panic!("not a [code, body] frame: {other}"),
    }
}

pub fn field<'a>(body: &'a [(Value, Value)], name: &str) -> Option<&'a Value> {
    body.iter()
        .find(|(key, _)| key.as_str() == Some(name))
        .map(|(_, value)| value)
}

/// Encodes a result tree the way the server ships it: as the binary payload
/// of an `EvaluateResponse`.
pub fn result_bytes(tree: &Value) -> Value {
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, tree).expect("encoding a result tree cannot fail");
    Value::Binary(bytes)
}
