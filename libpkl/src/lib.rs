// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client library for the Pkl configuration language.
//!
//! Evaluation is delegated to a long-lived `pkl server` child process driven
//! over a binary msgpack protocol on its stdio pipes. [`EvaluatorManager`]
//! owns the child and multiplexes sessions over it; [`Evaluator`] is one
//! session; [`load`] is the one-shot convenience that wires everything up,
//! evaluates, and tears it back down.
//!
//! ```no_run
//! use libpkl::{load, LoadOptions};
//!
//! let value = load(
//!     "config.pkl",
//!     LoadOptions {
//!         expr: Some("output.value".to_owned()),
//!         ..LoadOptions::default()
//!     },
//! )?;
//! println!("{value:?}");
//! # Ok::<(), libpkl::PklError>(())
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod error;
mod log;
pub mod manager;
pub mod options;
pub mod project;
pub mod reader;
pub mod session;
pub mod source;
mod sync;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::path::{Path, PathBuf};

use url::Url;

pub use crate::error::PklError;
pub use crate::manager::EvaluatorManager;
pub use crate::options::EvaluatorOptions;
pub use crate::reader::{ModuleReader, ResourceReader};
pub use crate::session::Evaluator;
pub use crate::source::ModuleSource;
pub use libpkl_ipc::message::{PathElement, ProjectDependency};
pub use libpkl_ipc::PklCommand;
pub use libpkl_value::{ClassShape, DecodeError, Decoder, Namespace, SchemaStrategy, Value};

/// Knobs for the one-shot [`load`].
pub struct LoadOptions {
    /// Inline module body. When set, `module` only provides a display name
    /// and the body is evaluated under the `repl:text` URI.
    pub module_text: Option<String>,
    /// Expression to evaluate within the module; the whole module when
    /// `None`.
    pub expr: Option<String>,
    /// Project directory. When `None`, ancestors of the module path are
    /// searched for a `PklProject` file.
    pub project_dir: Option<PathBuf>,
    /// Options for the evaluator session.
    pub evaluator: EvaluatorOptions,
    /// Custom child invocation; `PKL_EXEC`/`PATH` resolution when `None`.
    pub command: Option<PklCommand>,
    /// Verbose child diagnostics on stderr.
    pub debug: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            module_text: None,
            expr: None,
            project_dir: None,
            evaluator: EvaluatorOptions::preconfigured(),
            command: None,
            debug: false,
        }
    }
}

/// Evaluates one module (or expression) and tears everything down again.
///
/// `module` may be an inline-text tag (with [`LoadOptions::module_text`]),
/// an absolute URI, or a filesystem path. For path modules the surrounding
/// project is picked up automatically when a `PklProject` file exists in an
/// ancestor directory.
pub fn load(module: &str, options: LoadOptions) -> Result<Value, PklError> {
    let source = if let Some(text) = &options.module_text {
        ModuleSource::from_text(text.clone())
    } else if Url::parse(module).is_ok() {
        ModuleSource::from_uri(module)?
    } else {
        ModuleSource::from_path(module)?
    };

    let command = options.command.unwrap_or_else(PklCommand::resolve);
    let manager = EvaluatorManager::with_command(command, options.debug)?;

    let project_dir = options
        .project_dir
        .or_else(|| search_project_dir(Path::new(module)));
    let evaluator = match project_dir {
        Some(dir) if dir.join("PklProject").is_file() => {
            manager.new_project_evaluator(&dir, options.evaluator)?
        }
        _ => manager.new_evaluator(options.evaluator)?,
    };

    let result = evaluator.evaluate(&source, options.expr.as_deref());
    let _ = evaluator.close();
    manager.close();
    result
}

/// Walks up from the module's directory looking for a `PklProject` file.
fn search_project_dir(module_path: &Path) -> Option<PathBuf> {
    let absolute = std::path::absolute(module_path).ok()?;
    let mut dir = absolute.parent()?.to_path_buf();
    loop {
        if dir.join("PklProject").is_file() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_search_walks_ancestors() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("configs").join("prod");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.path().join("PklProject"), "amends \"pkl:Project\"\n").unwrap();
        let module = nested.join("main.pkl");
        std::fs::write(&module, "a = 1\n").unwrap();

        let found = search_project_dir(&module).unwrap();
        assert_eq!(
            std::fs::canonicalize(found).unwrap(),
            std::fs::canonicalize(root.path()).unwrap()
        );
    }

    #[test]
    fn project_search_misses_cleanly() {
        let root = tempfile::tempdir().unwrap();
        let module = root.path().join("main.pkl");
        std::fs::write(&module, "a = 1\n").unwrap();
        // The ancestor chain may still hit a PklProject somewhere above the
        // temp dir; only assert it is not the temp dir itself.
        if let Some(found) = search_project_dir(&module) {
            assert_ne!(found, root.path());
        }
    }
}
