// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Binding of emitted class identifiers to host-side types.

use std::collections::HashMap;
use std::sync::Arc;

use crate::decode::error::DecodeError;

/// The identity of a host-side class: short name plus member names in
/// declared order.
///
/// Shapes are always handled through `Arc`; one allocation per distinct
/// `(name, members)` pair is what gives decoded objects a usable notion of
/// "same type". Caching by name alone is not enough: two dynamic objects in
/// one module can share a name and differ in members, and collapsing them
/// onto one cached type silently drops fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassShape {
    name: String,
    members: Vec<String>,
}

impl ClassShape {
    pub fn new<N, M, I>(name: N, members: I) -> Self
    where
        N: Into<String>,
        M: Into<String>,
        I: IntoIterator<Item = M>,
    {
        ClassShape {
            name: name.into(),
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn index_of(&self, member: &str) -> Option<usize> {
        self.members.iter().position(|m| m == member)
    }
}

/// Derives the short class name from a fully qualified one: the segment
/// after the last `#`, then after the last `.`.
pub fn short_class_name(full_class_name: &str) -> &str {
    let after_hash = full_class_name
        .rsplit_once('#')
        .map_or(full_class_name, |(_, tail)| tail);
    after_hash
        .rsplit_once('.')
        .map_or(after_hash, |(_, tail)| tail)
}

/// An explicit short-name → shape registry for callers that declare their
/// classes up front.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    types: HashMap<String, Arc<ClassShape>>,
}

impl Namespace {
    pub fn new() -> Self {
        Namespace::default()
    }

    /// Declares a class. The member order given here is the order members
    /// come out of decoded objects, whatever order the wire used.
    pub fn declare<N, M, I>(mut self, name: N, members: I) -> Self
    where
        N: Into<String>,
        M: Into<String>,
        I: IntoIterator<Item = M>,
    {
        let name = name.into();
        let shape = Arc::new(ClassShape::new(name.clone(), members));
        self.types.insert(name, shape);
        self
    }

    fn resolve(
        &self,
        short_name: &str,
        wire_members: &[String],
    ) -> Result<Arc<ClassShape>, DecodeError> {
        let shape = self.types.get(short_name).ok_or_else(|| {
            DecodeError::UnknownClass(format!("class '{short_name}' is not declared"))
        })?;
        if shape.members().len() != wire_members.len()
            || wire_members.iter().any(|m| shape.index_of(m).is_none())
        {
            return Err(DecodeError::UnknownClass(format!(
                "class '{short_name}' was emitted with members [{}] but is declared with [{}]",
                wire_members.join(", "),
                shape.members().join(", ")
            )));
        }
        Ok(Arc::clone(shape))
    }
}

/// How emitted class identifiers bind to host types.
///
/// `Dynamic` synthesizes one type per distinct shape, keyed on the full
/// `(short name, member tuple)` pair. `Namespace` restricts decoding to
/// declared classes and fails on anything else.
#[derive(Debug, Clone)]
pub enum SchemaStrategy {
    Dynamic { interned: ShapeInterner },
    Namespace(Namespace),
}

impl SchemaStrategy {
    pub fn dynamic() -> Self {
        SchemaStrategy::Dynamic {
            interned: ShapeInterner::default(),
        }
    }

    pub fn namespace(namespace: Namespace) -> Self {
        SchemaStrategy::Namespace(namespace)
    }

    /// Binds one emitted `(full name, wire member order)` to a shape.
    pub(crate) fn bind(
        &mut self,
        full_class_name: &str,
        wire_members: &[String],
    ) -> Result<Arc<ClassShape>, DecodeError> {
        let short_name = short_class_name(full_class_name);
        match self {
            SchemaStrategy::Dynamic { interned } => Ok(interned.intern(short_name, wire_members)),
            SchemaStrategy::Namespace(namespace) => namespace.resolve(short_name, wire_members),
        }
    }
}

/// The dynamic-mode shape cache.
#[derive(Debug, Clone, Default)]
pub struct ShapeInterner {
    shapes: HashMap<(String, Vec<String>), Arc<ClassShape>>,
}

impl ShapeInterner {
    fn intern(&mut self, short_name: &str, members: &[String]) -> Arc<ClassShape> {
        let key = (short_name.to_owned(), members.to_vec());
        Arc::clone(
            self.shapes
                .entry(key)
                .or_insert_with(|| Arc::new(ClassShape::new(short_name, members))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn short_name_strips_module_and_package() {
        assert_eq!(short_class_name("birds#Animal"), "Animal");
        assert_eq!(short_class_name("com.example.birds#Animal"), "Animal");
        assert_eq!(short_class_name("pkl.Project"), "Project");
        assert_eq!(short_class_name("Animal"), "Animal");
    }

    #[test]
    fn interner_reuses_identical_shapes() {
        let mut strategy = SchemaStrategy::dynamic();
        let a = strategy.bind("mod#Animal", &strings(&["name"])).unwrap();
        let b = strategy.bind("mod#Animal", &strings(&["name"])).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn interner_splits_same_name_different_members() {
        let mut strategy = SchemaStrategy::dynamic();
        let a = strategy.bind("mod#Dynamic", &strings(&["a"])).unwrap();
        let b = strategy.bind("mod#Dynamic", &strings(&["b", "c"])).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.members(), &strings(&["a"]));
        assert_eq!(b.members(), &strings(&["b", "c"]));
    }

    #[test]
    fn namespace_rejects_undeclared_class() {
        let mut strategy =
            SchemaStrategy::namespace(Namespace::new().declare("Animal", ["name"]));
        let err = strategy
            .bind("mod#Plant", &strings(&["name"]))
            .unwrap_err();
        assert!(matches!(err, DecodeError::UnknownClass(_)));
    }

    #[test]
    fn namespace_rejects_member_mismatch() {
        let mut strategy =
            SchemaStrategy::namespace(Namespace::new().declare("Animal", ["name"]));
        let err = strategy
            .bind("mod#Animal", &strings(&["name", "legs"]))
            .unwrap_err();
        assert!(matches!(err, DecodeError::UnknownClass(_)));
    }

    #[test]
    fn namespace_accepts_reordered_members() {
        let mut strategy =
            SchemaStrategy::namespace(Namespace::new().declare("Dog", ["name", "barks"]));
        let shape = strategy
            .bind("mod#Dog", &strings(&["barks", "name"]))
            .unwrap();
        assert_eq!(shape.members(), &strings(&["name", "barks"]));
    }
}
