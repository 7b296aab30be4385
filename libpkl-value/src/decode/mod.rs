// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tag-dispatch decoding of evaluation results.

pub mod error;

use std::sync::Arc;

use rmpv::Value as Mp;

use crate::decode::error::DecodeError;
use crate::schema::SchemaStrategy;
use crate::value::{DataSize, Duration, IntSeq, Object, Regex, Value, ValueMap};

/// Value tags. Every composite value on the wire is an array opening with
/// one of these.
mod tag {
    pub const TYPED_DYNAMIC: u64 = 0x1;
    pub const MAP: u64 = 0x2;
    pub const MAPPING: u64 = 0x3;
    pub const LIST: u64 = 0x4;
    pub const LISTING: u64 = 0x5;
    pub const SET: u64 = 0x6;
    pub const DURATION: u64 = 0x7;
    pub const DATASIZE: u64 = 0x8;
    pub const PAIR: u64 = 0x9;
    pub const INTSEQ: u64 = 0xA;
    pub const REGEX: u64 = 0xB;
    pub const CLASS: u64 = 0xC;
    pub const TYPEALIAS: u64 = 0xD;
    pub const PROPERTY: u64 = 0x10;
    pub const ENTRY: u64 = 0x11;
    pub const ELEMENT: u64 = 0x12;
}

/// Transforms the msgpack payload of an evaluation result into a [`Value`].
///
/// The decoder is stateful: in dynamic mode it interns class shapes across
/// calls, so repeated evaluations on one decoder keep producing the same host
/// types for the same shapes.
#[derive(Debug, Clone)]
pub struct Decoder {
    schema: SchemaStrategy,
    force_render: bool,
}

impl Decoder {
    pub fn new(schema: SchemaStrategy) -> Self {
        Decoder {
            schema,
            force_render: false,
        }
    }

    /// Dynamic-mode decoder; the default for callers without declared
    /// classes.
    pub fn dynamic() -> Self {
        Decoder::new(SchemaStrategy::dynamic())
    }

    /// With `force_render` set, a typed object carrying both elements and
    /// properties decodes to its element list and the properties/entries are
    /// dropped, instead of failing with [`DecodeError::MixedMembership`].
    pub fn with_force_render(mut self, force_render: bool) -> Self {
        self.force_render = force_render;
        self
    }

    /// Decodes one complete msgpack value from `bytes`.
    ///
    /// # Errors
    ///
    /// Fails if `bytes` is not exactly one well-formed msgpack value, if a
    /// tagged array has an unknown tag or the wrong shape, or if a class
    /// shape cannot be bound by the schema strategy.
    pub fn decode_slice(&mut self, bytes: &[u8]) -> Result<Value, DecodeError> {
        let mut cursor = bytes;
        let tree = rmpv::decode::read_value(&mut cursor)
            .map_err(|err| DecodeError::InvalidFormat(err.to_string()))?;
        if !cursor.is_empty() {
            return Err(DecodeError::InvalidFormat(format!(
                "{} trailing bytes after the result value",
                cursor.len()
            )));
        }
        self.decode_tree(tree)
    }

    /// Decodes an already-unpacked msgpack tree.
    pub fn decode_tree(&mut self, tree: Mp) -> Result<Value, DecodeError> {
        match tree {
            Mp::Nil => Ok(Value::Null),
            Mp::Boolean(b) => Ok(Value::Bool(b)),
            Mp::Integer(n) => n.as_i64().map(Value::Int).ok_or_else(|| {
                DecodeError::InvalidFormat(format!("integer {n:?} does not fit in i64"))
            }),
            Mp::F32(f) => Ok(Value::Float(f64::from(f))),
            Mp::F64(f) => Ok(Value::Float(f)),
            Mp::String(s) => match s.into_str() {
                Some(s) => Ok(Value::String(s)),
                None => Err(DecodeError::InvalidType("non-utf8 string".to_owned())),
            },
            Mp::Binary(bytes) => Ok(Value::Bytes(bytes)),
            Mp::Map(entries) => Ok(Value::Map(self.decode_entries(entries)?)),
            Mp::Array(items) => self.decode_tagged(items),
            Mp::Ext(kind, _) => Err(DecodeError::InvalidType(format!(
                "unexpected msgpack extension (type {kind})"
            ))),
        }
    }

    fn decode_entries(&mut self, entries: Vec<(Mp, Mp)>) -> Result<ValueMap, DecodeError> {
        let mut decoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            decoded.push((self.decode_tree(key)?, self.decode_tree(value)?));
        }
        Ok(ValueMap::new(decoded))
    }

    fn decode_tagged(&mut self, items: Vec<Mp>) -> Result<Value, DecodeError> {
        let Some(value_tag) = items.first().and_then(Mp::as_u64) else {
            return Err(DecodeError::InvalidFormat(
                "array value does not open with an integer tag".to_owned(),
            ));
        };
        match value_tag {
            tag::TYPED_DYNAMIC => self.decode_typed_dynamic(items),
            tag::MAP => {
                let body = expect_arity::<2>(value_tag, items)?;
                let [_, entries] = body;
                match entries {
                    Mp::Map(entries) => Ok(Value::Map(self.decode_entries(entries)?)),
                    other => Err(type_error(value_tag, "a map", &other)),
                }
            }
            tag::MAPPING => {
                let [_, entries] = expect_arity::<2>(value_tag, items)?;
                match entries {
                    Mp::Map(entries) => Ok(Value::Mapping(self.decode_entries(entries)?)),
                    other => Err(type_error(value_tag, "a map", &other)),
                }
            }
            tag::LIST | tag::LISTING => {
                let [_, elements] = expect_arity::<2>(value_tag, items)?;
                match elements {
                    Mp::Array(elements) => Ok(Value::List(self.decode_items(elements)?)),
                    other => Err(type_error(value_tag, "an array", &other)),
                }
            }
            tag::SET => {
                let [_, elements] = expect_arity::<2>(value_tag, items)?;
                let elements = match elements {
                    Mp::Array(elements) => elements,
                    other => return Err(type_error(value_tag, "an array", &other)),
                };
                let mut set: Vec<Value> = Vec::with_capacity(elements.len());
                for element in elements {
                    let decoded = self.decode_tree(element)?;
                    if !set.contains(&decoded) {
                        set.push(decoded);
                    }
                }
                Ok(Value::Set(set))
            }
            tag::DURATION => {
                let [_, value, unit] = expect_arity::<3>(value_tag, items)?;
                Ok(Value::Duration(Duration {
                    value: expect_number(value_tag, &value)?,
                    unit: expect_unit(value_tag, &unit)?,
                }))
            }
            tag::DATASIZE => {
                let [_, value, unit] = expect_arity::<3>(value_tag, items)?;
                Ok(Value::DataSize(DataSize {
                    value: expect_number(value_tag, &value)?,
                    unit: expect_unit(value_tag, &unit)?,
                }))
            }
            tag::PAIR => {
                let [_, first, second] = expect_arity::<3>(value_tag, items)?;
                Ok(Value::Pair(
                    Box::new(self.decode_tree(first)?),
                    Box::new(self.decode_tree(second)?),
                ))
            }
            tag::INTSEQ => {
                let [_, start, end, step] = expect_arity::<4>(value_tag, items)?;
                Ok(Value::IntSeq(IntSeq {
                    start: expect_int(value_tag, &start)?,
                    end: expect_int(value_tag, &end)?,
                    step: expect_int(value_tag, &step)?,
                }))
            }
            tag::REGEX => {
                let [_, pattern] = expect_arity::<2>(value_tag, items)?;
                match pattern {
                    Mp::String(s) => match s.into_str() {
                        Some(pattern) => Ok(Value::Regex(Regex { pattern })),
                        None => Err(DecodeError::InvalidType(
                            "non-utf8 regex pattern".to_owned(),
                        )),
                    },
                    other => Err(type_error(value_tag, "a string", &other)),
                }
            }
            // Schema metadata; carries nothing the runtime needs.
            tag::CLASS | tag::TYPEALIAS => Ok(Value::Null),
            tag::PROPERTY | tag::ENTRY | tag::ELEMENT => Err(DecodeError::InvalidFormat(format!(
                "member tag {value_tag:#x} outside a typed object"
            ))),
            other => Err(DecodeError::InvalidFormat(format!(
                "unknown value tag {other:#x}"
            ))),
        }
    }

    fn decode_items(&mut self, items: Vec<Mp>) -> Result<Vec<Value>, DecodeError> {
        items.into_iter().map(|v| self.decode_tree(v)).collect()
    }

    fn decode_typed_dynamic(&mut self, items: Vec<Mp>) -> Result<Value, DecodeError> {
        let [_, full_name, _module_uri, members] = expect_arity::<4>(tag::TYPED_DYNAMIC, items)?;
        let full_name = match full_name {
            Mp::String(s) => s
                .into_str()
                .ok_or_else(|| DecodeError::InvalidType("non-utf8 class name".to_owned()))?,
            other => return Err(type_error(tag::TYPED_DYNAMIC, "a class name", &other)),
        };
        let members = match members {
            Mp::Array(members) => members,
            other => return Err(type_error(tag::TYPED_DYNAMIC, "a member list", &other)),
        };

        let mut elements: Vec<(i64, Value)> = Vec::new();
        let mut named: Vec<(String, Value)> = Vec::new();
        for member in members {
            let Mp::Array(parts) = member else {
                return Err(DecodeError::InvalidFormat(
                    "object member is not a tagged array".to_owned(),
                ));
            };
            let Some(member_tag) = parts.first().and_then(Mp::as_u64) else {
                return Err(DecodeError::InvalidFormat(
                    "object member does not open with an integer tag".to_owned(),
                ));
            };
            match member_tag {
                tag::PROPERTY => {
                    let [_, key, value] = expect_arity::<3>(member_tag, parts)?;
                    let key = match key {
                        Mp::String(key) => key.into_str().ok_or_else(|| {
                            DecodeError::InvalidType("non-utf8 property name".to_owned())
                        })?,
                        other => return Err(type_error(member_tag, "a property name", &other)),
                    };
                    named.push((key, self.decode_tree(value)?));
                }
                tag::ENTRY => {
                    let [_, key, value] = expect_arity::<3>(member_tag, parts)?;
                    let key = self.decode_tree(key)?;
                    let Value::String(key) = key else {
                        return Err(DecodeError::InvalidType(format!(
                            "entry key of object '{full_name}' is not a string"
                        )));
                    };
                    named.push((key, self.decode_tree(value)?));
                }
                tag::ELEMENT => {
                    let [_, index, value] = expect_arity::<3>(member_tag, parts)?;
                    elements.push((expect_int(member_tag, &index)?, self.decode_tree(value)?));
                }
                other => {
                    return Err(DecodeError::InvalidFormat(format!(
                        "unknown member tag {other:#x} in object '{full_name}'"
                    )))
                }
            }
        }

        if !elements.is_empty() {
            if !named.is_empty() && !self.force_render {
                return Err(DecodeError::MixedMembership(format!(
                    "object '{full_name}' has both elements and properties"
                )));
            }
            elements.sort_by_key(|(index, _)| *index);
            return Ok(Value::List(
                elements.into_iter().map(|(_, value)| value).collect(),
            ));
        }

        // Duplicate names keep their first position and last value.
        let mut deduped: Vec<(String, Value)> = Vec::with_capacity(named.len());
        for (name, value) in named {
            if let Some(existing) = deduped.iter_mut().find(|(n, _)| *n == name) {
                existing.1 = value;
            } else {
                deduped.push((name, value));
            }
        }

        let member_names: Vec<String> = deduped.iter().map(|(n, _)| n.clone()).collect();
        let shape = self.schema.bind(&full_name, &member_names)?;
        let mut values = vec![Value::Null; shape.members().len()];
        for (name, value) in deduped {
            let index = shape.index_of(&name).ok_or_else(|| {
                DecodeError::UnknownClass(format!(
                    "member '{name}' has no slot in class '{}'",
                    shape.name()
                ))
            })?;
            values[index] = value;
        }
        Ok(Value::Object(Object::new(Arc::clone(&shape), values)))
    }
}

fn expect_arity<const N: usize>(value_tag: u64, items: Vec<Mp>) -> Result<[Mp; N], DecodeError> {
    let len = items.len();
    <[Mp; N]>::try_from(items).map_err(|_| {
        DecodeError::InvalidFormat(format!(
            "tag {value_tag:#x} expects {N} elements, found {len}"
        ))
    })
}

fn expect_number(value_tag: u64, value: &Mp) -> Result<f64, DecodeError> {
    match value {
        Mp::Integer(n) => n.as_f64(),
        Mp::F32(f) => Some(f64::from(*f)),
        Mp::F64(f) => Some(*f),
        _ => None,
    }
    .ok_or_else(|| type_error(value_tag, "a number", value))
}

fn expect_int(value_tag: u64, value: &Mp) -> Result<i64, DecodeError> {
    value
        .as_i64()
        .ok_or_else(|| type_error(value_tag, "an integer", value))
}

fn expect_unit<U: std::str::FromStr>(value_tag: u64, value: &Mp) -> Result<U, DecodeError>
where
    U::Err: std::fmt::Display,
{
    let Some(unit) = value.as_str() else {
        return Err(type_error(value_tag, "a unit string", value));
    };
    unit.parse()
        .map_err(|err| DecodeError::InvalidType(format!("tag {value_tag:#x}: {err}")))
}

fn type_error(value_tag: u64, expected: &str, found: &Mp) -> DecodeError {
    DecodeError::InvalidType(format!("tag {value_tag:#x} expects {expected}, found {found}"))
}
