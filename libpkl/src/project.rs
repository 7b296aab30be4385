// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Project bootstrap: evaluating a `PklProject` descriptor into the
//! dependency tree that project-aware evaluators are created with.

use std::path::Path;

use indexmap::IndexMap;
use libpkl_ipc::message::{Checksums, LocalProject, ProjectDependency, RemoteDependency};
use libpkl_value::{Object, Value};

use crate::error::PklError;
use crate::manager::EvaluatorManager;
use crate::options::EvaluatorOptions;
use crate::source::ModuleSource;

/// Evaluates `<project_dir>/PklProject` through a throwaway preconfigured
/// session and re-tags its dependency map into the wire form.
pub fn load_project(
    manager: &EvaluatorManager,
    project_dir: impl AsRef<Path>,
) -> Result<ProjectDependency, PklError> {
    let bootstrap = manager.new_evaluator(EvaluatorOptions::preconfigured())?;
    let source = ModuleSource::from_path(project_dir.as_ref().join("PklProject"))?;
    let outcome = bootstrap.evaluate_output_value(&source);
    let _ = bootstrap.close();
    project_from_value(&outcome?)
}

fn project_from_value(value: &Value) -> Result<ProjectDependency, PklError> {
    let object = value
        .as_object()
        .ok_or_else(|| PklError::Project("PklProject output.value is not an object".to_owned()))?;
    Ok(ProjectDependency::Local(LocalProject {
        project_file_uri: required_str(object, "projectFileUri")?,
        package_uri: package_uri_of(object),
        dependencies: dependencies_of(object)?,
    }))
}

/// Dependencies come back as objects whose class tells their kind: a nested
/// `Project` or a `RemoteDependency` pinned by checksum.
fn dependency_from_value(value: &Value) -> Result<ProjectDependency, PklError> {
    let object = value
        .as_object()
        .ok_or_else(|| PklError::Project("dependency entry is not an object".to_owned()))?;
    match object.class_name() {
        "Project" => Ok(ProjectDependency::Local(LocalProject {
            project_file_uri: required_str(object, "projectFileUri")?,
            package_uri: package_uri_of(object),
            dependencies: dependencies_of(object)?,
        })),
        "RemoteDependency" => Ok(ProjectDependency::Remote(RemoteDependency {
            package_uri: object
                .get("uri")
                .and_then(Value::as_str)
                .map(str::to_owned),
            checksums: object
                .get("checksums")
                .and_then(|checksums| checksums.get("sha256"))
                .and_then(Value::as_str)
                .map(|sha256| Checksums {
                    sha256: sha256.to_owned(),
                }),
        })),
        other => Err(PklError::Project(format!(
            "unknown dependency kind '{other}'"
        ))),
    }
}

fn dependencies_of(object: &Object) -> Result<IndexMap<String, ProjectDependency>, PklError> {
    let mut dependencies = IndexMap::new();
    let Some(entries) = object.get("dependencies") else {
        return Ok(dependencies);
    };
    if entries.is_null() {
        return Ok(dependencies);
    }
    let entries = entries
        .as_map()
        .ok_or_else(|| PklError::Project("dependencies is not a map".to_owned()))?;
    for (name, dependency) in entries.iter() {
        let name = name
            .as_str()
            .ok_or_else(|| PklError::Project("dependency name is not a string".to_owned()))?;
        dependencies.insert(name.to_owned(), dependency_from_value(dependency)?);
    }
    Ok(dependencies)
}

fn package_uri_of(object: &Object) -> Option<String> {
    object
        .get("package")
        .and_then(|package| package.get("uri"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn required_str(object: &Object, member: &str) -> Result<String, PklError> {
    object
        .get(member)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| {
            PklError::Project(format!(
                "'{}' object has no string member '{member}'",
                object.class_name()
            ))
        })
}
