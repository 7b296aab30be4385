// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Represent error that can happen while decoding an evaluation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload is not valid msgpack, or a tagged array has the wrong arity.
    InvalidFormat(String),
    /// A field of a tagged value has an unexpected type.
    InvalidType(String),
    /// A class identifier could not be bound to a declared host type.
    UnknownClass(String),
    /// A typed object mixes element members with properties or entries.
    MixedMembership(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidFormat(msg) => write!(f, "invalid format: {msg}"),
            DecodeError::InvalidType(msg) => write!(f, "invalid type encountered: {msg}"),
            DecodeError::UnknownClass(msg) => write!(f, "unknown class: {msg}"),
            DecodeError::MixedMembership(msg) => write!(f, "mixed membership: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}
