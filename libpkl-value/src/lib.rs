// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decoding of the Pkl evaluator's binary value representation.
//!
//! An evaluation result is a msgpack document in which every composite value
//! is an array whose first element is an integer tag (a typed object, a
//! mapping, a duration, ...). [`Decoder`] turns such a document into a
//! [`Value`] tree, binding emitted class shapes to host-side types through a
//! [`SchemaStrategy`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod decode;
pub mod schema;
pub mod value;

pub use decode::error::DecodeError;
pub use decode::Decoder;
pub use schema::{ClassShape, Namespace, SchemaStrategy};
pub use value::{
    DataSize, DataSizeUnit, Duration, DurationUnit, IntSeq, Object, Regex, UnitParseError, Value,
    ValueMap,
};
