// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use url::Url;

use crate::error::PklError;

/// What to evaluate: an absolute module URI, or an inline module body tagged
/// with the synthetic `repl:text` URI. Exactly one form is ever present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    uri: String,
    text: Option<String>,
}

impl ModuleSource {
    /// A module on the local filesystem. The path is absolutized but does
    /// not have to exist yet; the evaluator reads it at evaluation time.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PklError> {
        let path = path.as_ref();
        let absolute = std::path::absolute(path)
            .map_err(|err| PklError::Source(format!("cannot resolve '{}': {err}", path.display())))?;
        let uri = Url::from_file_path(&absolute).map_err(|()| {
            PklError::Source(format!(
                "cannot express '{}' as a file uri",
                absolute.display()
            ))
        })?;
        Ok(ModuleSource {
            uri: uri.as_str().to_owned(),
            text: None,
        })
    }

    /// An inline module body.
    pub fn from_text(text: impl Into<String>) -> Self {
        ModuleSource {
            uri: "repl:text".to_owned(),
            text: Some(text.into()),
        }
    }

    /// An already-absolute module URI.
    pub fn from_uri(uri: impl AsRef<str>) -> Result<Self, PklError> {
        let parsed = Url::parse(uri.as_ref())
            .map_err(|err| PklError::Source(format!("invalid module uri '{}': {err}", uri.as_ref())))?;
        Ok(ModuleSource {
            uri: parsed.as_str().to_owned(),
            text: None,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_sources_get_the_repl_uri() {
        let source = ModuleSource::from_text("a: Int = 1 + 1");
        assert_eq!(source.uri(), "repl:text");
        assert_eq!(source.text(), Some("a: Int = 1 + 1"));
    }

    #[test]
    fn path_sources_become_file_uris() {
        let source = ModuleSource::from_path("/tmp/config.pkl").unwrap();
        assert_eq!(source.uri(), "file:///tmp/config.pkl");
        assert_eq!(source.text(), None);
    }

    #[test]
    fn uri_sources_are_validated() {
        let source = ModuleSource::from_uri("package://example.com/birds@1.0.0#/Bird.pkl").unwrap();
        assert!(source.uri().starts_with("package://"));
        assert!(ModuleSource::from_uri("not a uri").is_err());
    }
}
