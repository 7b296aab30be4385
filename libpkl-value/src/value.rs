// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The host-side representation of decoded Pkl values.

use std::fmt;
use std::sync::Arc;

use crate::schema::ClassShape;

/// A decoded Pkl value.
///
/// `Map` makes no promise about entry order; `Mapping` preserves the order
/// entries appeared on the wire. `Set` keeps first-occurrence order and holds
/// no structural duplicates.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(ValueMap),
    Mapping(ValueMap),
    Set(Vec<Value>),
    Pair(Box<Value>, Box<Value>),
    Duration(Duration),
    DataSize(DataSize),
    IntSeq(IntSeq),
    Regex(Regex),
    Object(Object),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Set(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) | Value::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Member/entry lookup by string key: object members, then map entries.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(obj) => obj.get(key),
            Value::Map(map) | Value::Mapping(map) => map.get_str(key),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// An entry-list map keyed by arbitrary values.
///
/// Pkl map keys are not restricted to strings (or even to hashable values),
/// so entries are kept as a flat list and looked up by structural equality.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueMap {
    entries: Vec<(Value, Value)>,
}

impl ValueMap {
    pub fn new(entries: Vec<(Value, Value)>) -> Self {
        ValueMap { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

impl IntoIterator for ValueMap {
    type Item = (Value, Value);
    type IntoIter = std::vec::IntoIter<(Value, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Raised when a wire unit string is outside the documented vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitParseError {
    pub unit: String,
}

impl fmt::Display for UnitParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown unit '{}'", self.unit)
    }
}

impl std::error::Error for UnitParseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl DurationUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DurationUnit::Nanoseconds => "ns",
            DurationUnit::Microseconds => "us",
            DurationUnit::Milliseconds => "ms",
            DurationUnit::Seconds => "s",
            DurationUnit::Minutes => "min",
            DurationUnit::Hours => "h",
            DurationUnit::Days => "d",
        }
    }

    fn seconds_per_unit(&self) -> f64 {
        match self {
            DurationUnit::Nanoseconds => 1e-9,
            DurationUnit::Microseconds => 1e-6,
            DurationUnit::Milliseconds => 1e-3,
            DurationUnit::Seconds => 1.0,
            DurationUnit::Minutes => 60.0,
            DurationUnit::Hours => 3600.0,
            DurationUnit::Days => 86_400.0,
        }
    }
}

impl std::str::FromStr for DurationUnit {
    type Err = UnitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ns" => Ok(DurationUnit::Nanoseconds),
            "us" => Ok(DurationUnit::Microseconds),
            "ms" => Ok(DurationUnit::Milliseconds),
            "s" => Ok(DurationUnit::Seconds),
            "min" => Ok(DurationUnit::Minutes),
            "h" => Ok(DurationUnit::Hours),
            "d" => Ok(DurationUnit::Days),
            other => Err(UnitParseError {
                unit: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for DurationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `pkl.Duration`: magnitude plus unit, exactly as emitted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Duration {
    pub value: f64,
    pub unit: DurationUnit,
}

impl Duration {
    /// Conversion into [`std::time::Duration`]. `None` for negative or
    /// non-finite magnitudes, which std durations cannot carry.
    pub fn to_std(&self) -> Option<std::time::Duration> {
        let seconds = self.value * self.unit.seconds_per_unit();
        if seconds.is_finite() && seconds >= 0.0 {
            Some(std::time::Duration::from_secs_f64(seconds))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSizeUnit {
    Bytes,
    Kilobytes,
    Kibibytes,
    Megabytes,
    Mebibytes,
    Gigabytes,
    Gibibytes,
    Terabytes,
    Tebibytes,
    Petabytes,
    Pebibytes,
}

impl DataSizeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSizeUnit::Bytes => "b",
            DataSizeUnit::Kilobytes => "kb",
            DataSizeUnit::Kibibytes => "kib",
            DataSizeUnit::Megabytes => "mb",
            DataSizeUnit::Mebibytes => "mib",
            DataSizeUnit::Gigabytes => "gb",
            DataSizeUnit::Gibibytes => "gib",
            DataSizeUnit::Terabytes => "tb",
            DataSizeUnit::Tebibytes => "tib",
            DataSizeUnit::Petabytes => "pb",
            DataSizeUnit::Pebibytes => "pib",
        }
    }

    fn bytes_per_unit(&self) -> f64 {
        match self {
            DataSizeUnit::Bytes => 1.0,
            DataSizeUnit::Kilobytes => 1e3,
            DataSizeUnit::Kibibytes => 1024.0,
            DataSizeUnit::Megabytes => 1e6,
            DataSizeUnit::Mebibytes => 1024.0 * 1024.0,
            DataSizeUnit::Gigabytes => 1e9,
            DataSizeUnit::Gibibytes => 1024.0 * 1024.0 * 1024.0,
            DataSizeUnit::Terabytes => 1e12,
            DataSizeUnit::Tebibytes => 1024.0 * 1024.0 * 1024.0 * 1024.0,
            DataSizeUnit::Petabytes => 1e15,
            DataSizeUnit::Pebibytes => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        }
    }
}

impl std::str::FromStr for DataSizeUnit {
    type Err = UnitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "b" => Ok(DataSizeUnit::Bytes),
            "kb" => Ok(DataSizeUnit::Kilobytes),
            "kib" => Ok(DataSizeUnit::Kibibytes),
            "mb" => Ok(DataSizeUnit::Megabytes),
            "mib" => Ok(DataSizeUnit::Mebibytes),
            "gb" => Ok(DataSizeUnit::Gigabytes),
            "gib" => Ok(DataSizeUnit::Gibibytes),
            "tb" => Ok(DataSizeUnit::Terabytes),
            "tib" => Ok(DataSizeUnit::Tebibytes),
            "pb" => Ok(DataSizeUnit::Petabytes),
            "pib" => Ok(DataSizeUnit::Pebibytes),
            other => Err(UnitParseError {
                unit: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for DataSizeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `pkl.DataSize`: magnitude plus unit, exactly as emitted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataSize {
    pub value: f64,
    pub unit: DataSizeUnit,
}

impl DataSize {
    pub fn to_bytes(&self) -> f64 {
        self.value * self.unit.bytes_per_unit()
    }
}

/// A `pkl.IntSeq` triple. Iteration is half-open: `start` inclusive, `end`
/// exclusive, advancing by `step`; a zero step yields nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntSeq {
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

impl IntSeq {
    pub fn iter(&self) -> IntSeqIter {
        IntSeqIter {
            next: self.start,
            end: self.end,
            step: self.step,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntSeqIter {
    next: i64,
    end: i64,
    step: i64,
}

impl Iterator for IntSeqIter {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        let exhausted = match self.step {
            0 => true,
            s if s > 0 => self.next >= self.end,
            _ => self.next <= self.end,
        };
        if exhausted {
            return None;
        }
        let current = self.next;
        self.next = self.next.saturating_add(self.step);
        Some(current)
    }
}

/// A `pkl.Regex`. Only the pattern travels on the wire; it is not compiled
/// host-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regex {
    pub pattern: String,
}

/// An instance of a user-declared class, with members in declared order.
///
/// Two objects are the same host type iff they share their [`ClassShape`]
/// allocation; the binding strategy guarantees one allocation per distinct
/// shape. Structural equality compares shape and member values.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    shape: Arc<ClassShape>,
    values: Vec<Value>,
}

impl Object {
    /// Builds an instance; the value list must be positionally aligned with
    /// the shape's member list.
    pub fn new(shape: Arc<ClassShape>, values: Vec<Value>) -> Self {
        debug_assert_eq!(shape.members().len(), values.len());
        Object { shape, values }
    }

    pub fn shape(&self) -> &Arc<ClassShape> {
        &self.shape
    }

    pub fn class_name(&self) -> &str {
        self.shape.name()
    }

    pub fn get(&self, member: &str) -> Option<&Value> {
        self.shape.index_of(member).map(|idx| &self.values[idx])
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.shape
            .members()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Host-type identity: same shape allocation.
    pub fn is_same_class(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.shape, &other.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_to_std() {
        let d = Duration {
            value: 1.5,
            unit: DurationUnit::Minutes,
        };
        assert_eq!(d.to_std(), Some(std::time::Duration::from_secs(90)));
        let negative = Duration {
            value: -1.0,
            unit: DurationUnit::Seconds,
        };
        assert_eq!(negative.to_std(), None);
    }

    #[test]
    fn datasize_to_bytes() {
        let s = DataSize {
            value: 2.0,
            unit: DataSizeUnit::Kibibytes,
        };
        assert_eq!(s.to_bytes(), 2048.0);
    }

    #[test]
    fn unit_round_trips() {
        for unit in ["ns", "us", "ms", "s", "min", "h", "d"] {
            assert_eq!(unit.parse::<DurationUnit>().unwrap().as_str(), unit);
        }
        for unit in [
            "b", "kb", "kib", "mb", "mib", "gb", "gib", "tb", "tib", "pb", "pib",
        ] {
            assert_eq!(unit.parse::<DataSizeUnit>().unwrap().as_str(), unit);
        }
        assert!("fortnights".parse::<DurationUnit>().is_err());
    }

    #[test]
    fn intseq_iterates_half_open() {
        let seq = IntSeq {
            start: 0,
            end: 10,
            step: 3,
        };
        assert_eq!(seq.iter().collect::<Vec<_>>(), vec![0, 3, 6, 9]);
        let down = IntSeq {
            start: 5,
            end: 0,
            step: -2,
        };
        assert_eq!(down.iter().collect::<Vec<_>>(), vec![5, 3, 1]);
        let stuck = IntSeq {
            start: 0,
            end: 10,
            step: 0,
        };
        assert_eq!(stuck.iter().count(), 0);
    }

    #[test]
    fn map_lookup_is_structural() {
        let map = ValueMap::new(vec![
            (Value::Int(1), Value::String("one".into())),
            (Value::String("two".into()), Value::Int(2)),
        ]);
        assert_eq!(map.get(&Value::Int(1)), Some(&Value::String("one".into())));
        assert_eq!(map.get_str("two"), Some(&Value::Int(2)));
        assert_eq!(map.get_str("three"), None);
    }
}
