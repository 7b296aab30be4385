// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use indexmap::IndexMap;
use libpkl_ipc::message::{CreateEvaluator, ProjectDependency};

use crate::reader::{module_descriptor, resource_descriptor, ModuleReader, ResourceReader};

/// Settings for one evaluator instance.
///
/// [`EvaluatorOptions::default`] starts from nothing, which leaves the
/// evaluator unable to import or read anything; most callers want
/// [`EvaluatorOptions::preconfigured`] and tighten from there.
#[derive(Default)]
pub struct EvaluatorOptions {
    /// URI patterns permitted as imports (`--allowed-modules`).
    pub allowed_modules: Option<Vec<String>>,
    /// URI patterns permitted as resource reads (`--allowed-resources`).
    pub allowed_resources: Option<Vec<String>>,
    /// Filesystem roots searched when resolving `modulepath:` URIs.
    pub module_paths: Option<Vec<String>>,
    /// Environment variables exposed to the evaluator.
    pub env: Option<IndexMap<String, String>>,
    /// External property overrides.
    pub properties: Option<IndexMap<String, String>>,
    /// Server-enforced per-evaluation time limit, in seconds.
    pub timeout_seconds: Option<u64>,
    /// Jail for file-based module and resource access.
    pub root_dir: Option<String>,
    /// Package cache location.
    pub cache_dir: Option<String>,
    /// Sets the `pkl.outputFormat` external property.
    pub output_format: Option<String>,

    pub(crate) module_readers: Vec<Box<dyn ModuleReader>>,
    pub(crate) resource_readers: Vec<Box<dyn ResourceReader>>,
}

impl EvaluatorOptions {
    /// The conventional defaults: the standard module and resource schemes,
    /// the caller's environment, and the shared `~/.pkl/cache` package
    /// cache.
    pub fn preconfigured() -> Self {
        EvaluatorOptions {
            allowed_modules: Some(
                ["pkl:", "repl:", "file:", "http:", "https:", "modulepath:", "package:", "projectpackage:"]
                    .map(str::to_owned)
                    .to_vec(),
            ),
            allowed_resources: Some(
                ["http:", "https:", "file:", "env:", "prop:", "modulepath:", "package:", "projectpackage:"]
                    .map(str::to_owned)
                    .to_vec(),
            ),
            env: Some(std::env::vars().collect()),
            cache_dir: default_cache_dir(),
            ..EvaluatorOptions::default()
        }
    }

    pub fn with_allowed_modules<S: Into<String>>(
        mut self,
        patterns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.allowed_modules = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_allowed_resources<S: Into<String>>(
        mut self,
        patterns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.allowed_resources = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    /// Permits one more module URI pattern on top of what is already allowed.
    pub fn allow_module(mut self, pattern: impl Into<String>) -> Self {
        self.allowed_modules
            .get_or_insert_with(Vec::new)
            .push(pattern.into());
        self
    }

    pub fn allow_resource(mut self, pattern: impl Into<String>) -> Self {
        self.allowed_resources
            .get_or_insert_with(Vec::new)
            .push(pattern.into());
        self
    }

    /// Registers a module reader. Registration order is lookup precedence.
    pub fn with_module_reader(mut self, reader: impl ModuleReader + 'static) -> Self {
        self.module_readers.push(Box::new(reader));
        self
    }

    pub fn with_resource_reader(mut self, reader: impl ResourceReader + 'static) -> Self {
        self.resource_readers.push(Box::new(reader));
        self
    }

    pub fn with_env<K: Into<String>, V: Into<String>>(
        mut self,
        env: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        self.env = Some(env.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties
            .get_or_insert_with(IndexMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_module_paths<S: Into<String>>(
        mut self,
        paths: impl IntoIterator<Item = S>,
    ) -> Self {
        self.module_paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_root_dir(mut self, dir: impl Into<String>) -> Self {
        self.root_dir = Some(dir.into());
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<String>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = Some(format.into());
        self
    }

    pub(crate) fn to_create_request(
        &self,
        request_id: i64,
        project: Option<ProjectDependency>,
    ) -> CreateEvaluator {
        CreateEvaluator {
            request_id,
            allowed_modules: self.allowed_modules.clone(),
            allowed_resources: self.allowed_resources.clone(),
            client_module_readers: if self.module_readers.is_empty() {
                None
            } else {
                Some(
                    self.module_readers
                        .iter()
                        .map(|reader| module_descriptor(reader.as_ref()))
                        .collect(),
                )
            },
            client_resource_readers: if self.resource_readers.is_empty() {
                None
            } else {
                Some(
                    self.resource_readers
                        .iter()
                        .map(|reader| resource_descriptor(reader.as_ref()))
                        .collect(),
                )
            },
            module_paths: self.module_paths.clone(),
            env: self.env.clone(),
            properties: self.properties.clone(),
            timeout_seconds: self.timeout_seconds,
            root_dir: self.root_dir.clone(),
            cache_dir: self.cache_dir.clone(),
            output_format: self.output_format.clone(),
            project,
        }
    }
}

fn default_cache_dir() -> Option<String> {
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"))?;
    Some(
        Path::new(&home)
            .join(".pkl")
            .join("cache")
            .to_string_lossy()
            .into_owned(),
    )
}
