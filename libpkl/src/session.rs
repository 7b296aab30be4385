// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One evaluator session: submits evaluate requests and answers the
//! server's read/list callbacks from its reader registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use libpkl_ipc::message::{
    CloseEvaluator, Evaluate, IncomingMessage, ListModulesResponse, ListResourcesResponse,
    OutgoingMessage, ReadModuleResponse, ReadResourceResponse,
};
use libpkl_value::{DecodeError, Decoder, Value};
use serde_bytes::ByteBuf;
use url::Url;

use crate::error::PklError;
use crate::manager::ManagerShared;
use crate::reader::ReaderRegistry;
use crate::source::ModuleSource;
use crate::sync::MutexExt;

const OUTPUT_TEXT_EXPR: &str = "output";
const OUTPUT_FILES_EXPR: &str = "output.files.toMap().mapValues((_, it) -> it.text)";
const OUTPUT_VALUE_EXPR: &str = "output.value";

/// A handle to one server-side evaluator instance.
///
/// Obtained from [`crate::EvaluatorManager::new_evaluator`]. The handle
/// stays bound to its evaluator id for the life of the child process; ids
/// are never reissued.
pub struct Evaluator {
    session: Arc<SessionShared>,
    manager: Arc<ManagerShared>,
    decoder: Mutex<Decoder>,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("evaluator_id", &self.session.evaluator_id)
            .finish()
    }
}

impl Evaluator {
    pub(crate) fn new(session: Arc<SessionShared>, manager: Arc<ManagerShared>) -> Self {
        Evaluator {
            session,
            manager,
            decoder: Mutex::new(Decoder::dynamic()),
        }
    }

    /// Replaces the result decoder, e.g. with a namespace-mode one carrying
    /// declared classes.
    pub fn with_decoder(mut self, decoder: Decoder) -> Self {
        self.decoder = Mutex::new(decoder);
        self
    }

    pub fn evaluator_id(&self) -> i64 {
        self.session.evaluator_id
    }

    /// Evaluates `expr` within the module (or the whole module when `expr`
    /// is `None`) and decodes the result.
    pub fn evaluate(&self, source: &ModuleSource, expr: Option<&str>) -> Result<Value, PklError> {
        let result = self.evaluate_raw(source, expr)?;
        self.decoder
            .lock_or_panic()
            .decode_slice(&result)
            .map_err(PklError::Schema)
    }

    pub fn evaluate_module(&self, source: &ModuleSource) -> Result<Value, PklError> {
        self.evaluate(source, None)
    }

    /// Evaluates the module's rendered output text.
    pub fn evaluate_output_text(&self, source: &ModuleSource) -> Result<String, PklError> {
        match self.evaluate(source, Some(OUTPUT_TEXT_EXPR))? {
            Value::String(text) => Ok(text),
            _ => Err(PklError::Schema(DecodeError::InvalidType(
                "module output did not render to text".to_owned(),
            ))),
        }
    }

    /// Evaluates the module's output files as a file-name → rendered-text
    /// map, in declaration order.
    pub fn evaluate_output_files(
        &self,
        source: &ModuleSource,
    ) -> Result<IndexMap<String, String>, PklError> {
        let value = self.evaluate(source, Some(OUTPUT_FILES_EXPR))?;
        let entries = value.as_map().ok_or_else(|| {
            PklError::Schema(DecodeError::InvalidType(
                "module output files did not render to a map".to_owned(),
            ))
        })?;
        let mut files = IndexMap::with_capacity(entries.len());
        for (name, text) in entries.iter() {
            match (name.as_str(), text.as_str()) {
                (Some(name), Some(text)) => {
                    files.insert(name.to_owned(), text.to_owned());
                }
                _ => {
                    return Err(PklError::Schema(DecodeError::InvalidType(
                        "output file entry is not a string pair".to_owned(),
                    )))
                }
            }
        }
        Ok(files)
    }

    /// Evaluates `output.value`, the module's effective output object.
    pub fn evaluate_output_value(&self, source: &ModuleSource) -> Result<Value, PklError> {
        self.evaluate(source, Some(OUTPUT_VALUE_EXPR))
    }

    fn evaluate_raw(&self, source: &ModuleSource, expr: Option<&str>) -> Result<Vec<u8>, PklError> {
        if self.session.is_closed() {
            return Err(PklError::SessionClosed);
        }
        let request_id = self.manager.next_request_id();
        self.manager
            .send_message(&OutgoingMessage::Evaluate(Evaluate {
                request_id,
                evaluator_id: self.session.evaluator_id,
                module_uri: source.uri().to_owned(),
                module_text: source.text().map(str::to_owned),
                expr: expr.map(str::to_owned),
            }))?;

        let response = match self.manager.receive_until(request_id)? {
            IncomingMessage::EvaluateResponse(response) => response,
            other => {
                return Err(PklError::Protocol(format!(
                    "request {request_id} was answered by a {} frame",
                    other.kind()
                )))
            }
        };
        if response.evaluator_id != self.session.evaluator_id {
            return Err(PklError::Protocol(format!(
                "response for request {request_id} names evaluator {} instead of {}",
                response.evaluator_id, self.session.evaluator_id
            )));
        }
        if let Some(error) = response.error {
            return Err(PklError::Evaluation(error));
        }
        response.result.map(ByteBuf::into_vec).ok_or_else(|| {
            PklError::Protocol("EvaluateResponse carried neither result nor error".to_owned())
        })
    }

    /// Closes the server-side evaluator. Idempotent; later evaluate calls
    /// fail with [`PklError::SessionClosed`]. A child that is already gone
    /// is not an error here.
    pub fn close(&self) -> Result<(), PklError> {
        if self.session.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.manager.remove_session(self.session.evaluator_id);
        match self
            .manager
            .send_message(&OutgoingMessage::CloseEvaluator(CloseEvaluator {
                evaluator_id: self.session.evaluator_id,
            })) {
            Err(PklError::Transport(_)) => Ok(()),
            outcome => outcome,
        }
    }
}

/// The part of a session the manager's dispatch loop needs: the evaluator
/// id, the reader registry, and the closed flag.
pub(crate) struct SessionShared {
    pub(crate) evaluator_id: i64,
    readers: ReaderRegistry,
    pub(crate) closed: AtomicBool,
}

impl SessionShared {
    pub(crate) fn new(evaluator_id: i64, readers: ReaderRegistry) -> Self {
        SessionShared {
            evaluator_id,
            readers,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Services one server-initiated callback. A reader failure becomes the
    /// `error` field of the response, never a local error; only a dead
    /// transport propagates out of here.
    pub(crate) fn handle_callback(
        &self,
        manager: &ManagerShared,
        message: IncomingMessage,
    ) -> Result<(), PklError> {
        match message {
            IncomingMessage::ReadModule(request) => {
                let outcome = self.with_module_reader(&request.uri, |reader, uri| reader.read(uri));
                let (contents, error) = split(outcome);
                manager.send_message(&OutgoingMessage::ReadModuleResponse(ReadModuleResponse {
                    request_id: request.request_id,
                    evaluator_id: request.evaluator_id,
                    contents,
                    error,
                }))
            }
            IncomingMessage::ReadResource(request) => {
                let outcome =
                    self.with_resource_reader(&request.uri, |reader, uri| reader.read(uri));
                let (contents, error) = split(outcome);
                manager.send_message(&OutgoingMessage::ReadResourceResponse(
                    ReadResourceResponse {
                        request_id: request.request_id,
                        evaluator_id: request.evaluator_id,
                        contents: contents.map(ByteBuf::from),
                        error,
                    },
                ))
            }
            IncomingMessage::ListModules(request) => {
                let outcome =
                    self.with_module_reader(&request.uri, |reader, uri| reader.list_elements(uri));
                let (path_elements, error) = split(outcome);
                manager.send_message(&OutgoingMessage::ListModulesResponse(ListModulesResponse {
                    request_id: request.request_id,
                    evaluator_id: request.evaluator_id,
                    path_elements,
                    error,
                }))
            }
            IncomingMessage::ListResources(request) => {
                let outcome = self
                    .with_resource_reader(&request.uri, |reader, uri| reader.list_elements(uri));
                let (path_elements, error) = split(outcome);
                manager.send_message(&OutgoingMessage::ListResourcesResponse(
                    ListResourcesResponse {
                        request_id: request.request_id,
                        evaluator_id: request.evaluator_id,
                        path_elements,
                        error,
                    },
                ))
            }
            other => Err(PklError::Protocol(format!(
                "{} frame routed to evaluator {}",
                other.kind(),
                self.evaluator_id
            ))),
        }
    }

    fn with_module_reader<T>(
        &self,
        uri: &str,
        read: impl FnOnce(&dyn crate::reader::ModuleReader, &Url) -> anyhow::Result<T>,
    ) -> Result<T, String> {
        let parsed = Url::parse(uri).map_err(|err| format!("invalid uri '{uri}': {err}"))?;
        match self.readers.find_module(parsed.scheme()) {
            Some(reader) => read(reader, &parsed).map_err(|err| format!("{err:#}")),
            None => Err(format!(
                "no module reader registered for scheme '{}'",
                parsed.scheme()
            )),
        }
    }

    fn with_resource_reader<T>(
        &self,
        uri: &str,
        read: impl FnOnce(&dyn crate::reader::ResourceReader, &Url) -> anyhow::Result<T>,
    ) -> Result<T, String> {
        let parsed = Url::parse(uri).map_err(|err| format!("invalid uri '{uri}': {err}"))?;
        match self.readers.find_resource(parsed.scheme()) {
            Some(reader) => read(reader, &parsed).map_err(|err| format!("{err:#}")),
            None => Err(format!(
                "no resource reader registered for scheme '{}'",
                parsed.scheme()
            )),
        }
    }
}

/// Exactly one of payload and error, never both, never neither.
fn split<T>(outcome: Result<T, String>) -> (Option<T>, Option<String>) {
    match outcome {
        Ok(value) => (Some(value), None),
        Err(error) => (None, Some(error)),
    }
}
