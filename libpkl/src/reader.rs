// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client-side module and resource readers.
//!
//! A reader answers the server's callbacks for one URI scheme. The
//! capability flags are declared to the server when the evaluator is
//! created and the server tailors its callbacks to them (`list_elements`
//! is only ever called on readers that declared themselves hierarchical and
//! local, or globbable), so implementations must report them truthfully.

use libpkl_ipc::message::{ModuleReaderDescriptor, PathElement, ResourceReaderDescriptor};
use url::Url;

/// Resolves module imports for one URI scheme, e.g. `customfs:/birds.pkl`.
pub trait ModuleReader: Send + Sync {
    /// The URI scheme this reader is responsible for.
    fn scheme(&self) -> &str;

    /// Whether the path part of the URI is hierarchical
    /// (`scheme:///nested/path`) rather than opaque (`scheme:name`).
    fn has_hierarchical_uris(&self) -> bool {
        false
    }

    /// Whether the scheme supports glob imports.
    fn is_globbable(&self) -> bool {
        false
    }

    /// Whether modules are local to the system. A local hierarchical reader
    /// supports relative (triple-dot) imports.
    fn is_local(&self) -> bool {
        false
    }

    /// Returns the module source text at `uri`.
    fn read(&self, uri: &Url) -> anyhow::Result<String>;

    /// Lists the entries under `uri`. For non-hierarchical schemes the path
    /// is empty and all available names should be returned.
    fn list_elements(&self, uri: &Url) -> anyhow::Result<Vec<PathElement>> {
        anyhow::bail!("the '{}' module reader does not support listing ({uri})", self.scheme())
    }
}

/// Resolves `read()` expressions for one URI scheme.
pub trait ResourceReader: Send + Sync {
    fn scheme(&self) -> &str;

    fn has_hierarchical_uris(&self) -> bool {
        false
    }

    fn is_globbable(&self) -> bool {
        false
    }

    /// Returns the raw resource bytes at `uri`.
    fn read(&self, uri: &Url) -> anyhow::Result<Vec<u8>>;

    fn list_elements(&self, uri: &Url) -> anyhow::Result<Vec<PathElement>> {
        anyhow::bail!(
            "the '{}' resource reader does not support listing ({uri})",
            self.scheme()
        )
    }
}

pub(crate) fn module_descriptor(reader: &dyn ModuleReader) -> ModuleReaderDescriptor {
    ModuleReaderDescriptor {
        scheme: reader.scheme().to_owned(),
        has_hierarchical_uris: reader.has_hierarchical_uris(),
        is_globbable: reader.is_globbable(),
        is_local: reader.is_local(),
    }
}

pub(crate) fn resource_descriptor(reader: &dyn ResourceReader) -> ResourceReaderDescriptor {
    ResourceReaderDescriptor {
        scheme: reader.scheme().to_owned(),
        has_hierarchical_uris: reader.has_hierarchical_uris(),
        is_globbable: reader.is_globbable(),
    }
}

/// A session's readers. Lookup is first exact scheme match, so registration
/// order is precedence.
#[derive(Default)]
pub(crate) struct ReaderRegistry {
    modules: Vec<Box<dyn ModuleReader>>,
    resources: Vec<Box<dyn ResourceReader>>,
}

impl ReaderRegistry {
    pub fn new(modules: Vec<Box<dyn ModuleReader>>, resources: Vec<Box<dyn ResourceReader>>) -> Self {
        ReaderRegistry { modules, resources }
    }

    pub fn find_module(&self, scheme: &str) -> Option<&dyn ModuleReader> {
        self.modules
            .iter()
            .find(|reader| reader.scheme() == scheme)
            .map(Box::as_ref)
    }

    pub fn find_resource(&self, scheme: &str) -> Option<&dyn ResourceReader> {
        self.resources
            .iter()
            .find(|reader| reader.scheme() == scheme)
            .map(Box::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str, &'static str);

    impl ModuleReader for Fixed {
        fn scheme(&self) -> &str {
            self.0
        }

        fn read(&self, _uri: &Url) -> anyhow::Result<String> {
            Ok(self.1.to_owned())
        }
    }

    #[test]
    fn first_registered_reader_wins() {
        let registry = ReaderRegistry::new(
            vec![Box::new(Fixed("fs", "first")), Box::new(Fixed("fs", "second"))],
            Vec::new(),
        );
        let reader = registry.find_module("fs").unwrap();
        let uri = Url::parse("fs:/x").unwrap();
        assert_eq!(reader.read(&uri).unwrap(), "first");
        assert!(registry.find_module("other").is_none());
    }
}
