// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The process-wide coordinator for one `pkl server` child.
//!
//! The manager is the single owner of the transport: all writes go through
//! one mutex-protected writer, and all reads happen inside
//! [`ManagerShared::receive_until`], which routes every frame that is not
//! the awaited response (logs to the log channel, reader callbacks to the
//! session owning the evaluator id) before looking at the next one.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use libpkl_ipc::message::{IncomingMessage, OutgoingMessage, ProjectDependency};
use libpkl_ipc::{ChildTransport, IpcError, PklCommand, WireReader, WireWriter};
use tracing::warn;

use crate::error::PklError;
use crate::options::EvaluatorOptions;
use crate::reader::ReaderRegistry;
use crate::session::{Evaluator, SessionShared};
use crate::sync::MutexExt;

/// Owns the child process and hands out evaluator sessions.
///
/// Closing the manager (or dropping it) terminates the child; every
/// operation still waiting on the wire fails with a transport error.
pub struct EvaluatorManager {
    shared: Arc<ManagerShared>,
    transport: Mutex<Option<ChildTransport>>,
}

impl EvaluatorManager {
    /// Spawns `pkl server` resolved from `PKL_EXEC` or `PATH`.
    pub fn new() -> Result<Self, PklError> {
        EvaluatorManager::with_command(PklCommand::resolve(), false)
    }

    /// Spawns a custom evaluator invocation. `debug` turns on the child's
    /// verbose stderr diagnostics.
    pub fn with_command(command: PklCommand, debug: bool) -> Result<Self, PklError> {
        let (transport, writer, reader) = ChildTransport::spawn(&command, debug)?;
        Ok(EvaluatorManager::from_wire(
            Box::new(writer),
            Box::new(reader),
            Some(transport),
        ))
    }

    /// Builds a manager over an arbitrary wire, with no child process
    /// behind it.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn with_wire(writer: Box<dyn WireWriter>, reader: Box<dyn WireReader>) -> Self {
        EvaluatorManager::from_wire(writer, reader, None)
    }

    fn from_wire(
        writer: Box<dyn WireWriter>,
        reader: Box<dyn WireReader>,
        transport: Option<ChildTransport>,
    ) -> Self {
        EvaluatorManager {
            shared: Arc::new(ManagerShared {
                writer: Mutex::new(writer),
                reader: Mutex::new(reader),
                sessions: Mutex::new(HashMap::new()),
                next_request_id: AtomicI64::new(1),
                closed: AtomicBool::new(false),
            }),
            transport: Mutex::new(transport),
        }
    }

    /// Creates an evaluator session with the given options.
    pub fn new_evaluator(&self, options: EvaluatorOptions) -> Result<Evaluator, PklError> {
        self.create_session(options, None)
    }

    /// Loads `<project_dir>/PklProject` through a throwaway session and
    /// creates an evaluator wired to the project's dependencies.
    pub fn new_project_evaluator(
        &self,
        project_dir: impl AsRef<Path>,
        options: EvaluatorOptions,
    ) -> Result<Evaluator, PklError> {
        let project = crate::project::load_project(self, project_dir)?;
        self.create_session(options, Some(project))
    }

    pub(crate) fn create_session(
        &self,
        options: EvaluatorOptions,
        project: Option<ProjectDependency>,
    ) -> Result<Evaluator, PklError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(PklError::Transport(IpcError::Closed));
        }

        let request_id = shared.next_request_id();
        let request = options.to_create_request(request_id, project);
        shared.send_message(&OutgoingMessage::CreateEvaluator(request))?;
        let response = match shared.receive_until(request_id)? {
            IncomingMessage::CreateEvaluatorResponse(response) => response,
            other => {
                return Err(PklError::Protocol(format!(
                    "request {request_id} was answered by a {} frame",
                    other.kind()
                )))
            }
        };
        if let Some(error) = response.error {
            return Err(PklError::Init(error));
        }
        let evaluator_id = response.evaluator_id.ok_or_else(|| {
            PklError::Protocol(
                "CreateEvaluatorResponse carried neither evaluatorId nor error".to_owned(),
            )
        })?;

        let session = Arc::new(SessionShared::new(
            evaluator_id,
            ReaderRegistry::new(options.module_readers, options.resource_readers),
        ));
        shared
            .sessions
            .lock_or_panic()
            .insert(evaluator_id, Arc::clone(&session));
        Ok(Evaluator::new(session, Arc::clone(shared)))
    }

    /// Terminates the child and fails everything still in flight.
    /// Idempotent.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Some(mut transport) = self.transport.lock_or_panic().take() {
            transport.shutdown();
        }
    }
}

impl Drop for EvaluatorManager {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) struct ManagerShared {
    writer: Mutex<Box<dyn WireWriter>>,
    reader: Mutex<Box<dyn WireReader>>,
    sessions: Mutex<HashMap<i64, Arc<SessionShared>>>,
    next_request_id: AtomicI64,
    closed: AtomicBool,
}

impl ManagerShared {
    pub(crate) fn next_request_id(&self) -> i64 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn send_message(&self, message: &OutgoingMessage) -> Result<(), PklError> {
        if self.is_closed() {
            return Err(PklError::Transport(IpcError::Closed));
        }
        let bytes = message.encode()?;
        self.writer
            .lock_or_panic()
            .send(&bytes)
            .map_err(PklError::from)
    }

    /// Pulls frames until the response for `request_id` arrives, servicing
    /// everything else in arrival order.
    pub(crate) fn receive_until(&self, request_id: i64) -> Result<IncomingMessage, PklError> {
        let mut reader = self.reader.lock_or_panic();
        loop {
            let frame = reader.receive().map_err(PklError::from)?;
            let message = IncomingMessage::decode(frame).map_err(PklError::from)?;
            if message.is_response() && message.request_id() == Some(request_id) {
                return Ok(message);
            }
            self.dispatch(message)?;
        }
    }

    fn dispatch(&self, message: IncomingMessage) -> Result<(), PklError> {
        if let IncomingMessage::Log(log) = &message {
            crate::log::emit(log);
            return Ok(());
        }
        if message.is_response() {
            // A response nobody is parked on. With a single-threaded caller
            // this is a stale answer for an abandoned request.
            warn!(
                target: "pkl",
                "dropping unawaited {} for request {:?}",
                message.kind(),
                message.request_id()
            );
            return Ok(());
        }

        let Some(evaluator_id) = message.evaluator_id() else {
            return Err(PklError::Protocol(format!(
                "{} frame without an evaluator id",
                message.kind()
            )));
        };
        let session = self.sessions.lock_or_panic().get(&evaluator_id).cloned();
        match session {
            Some(session) => session.handle_callback(self, message),
            None => {
                // The server may still emit frames for an evaluator we just
                // closed; they have nowhere to go.
                warn!(
                    target: "pkl",
                    "dropping {} for unknown evaluator {evaluator_id}",
                    message.kind()
                );
                Ok(())
            }
        }
    }

    pub(crate) fn remove_session(&self, evaluator_id: i64) {
        self.sessions.lock_or_panic().remove(&evaluator_id);
    }
}
