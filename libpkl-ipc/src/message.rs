// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The evaluator server's message catalog.
//!
//! Every wire message is a two-element msgpack array `[code, body]` where the
//! body is a map keyed by camelCase field name. Absent optional fields are
//! omitted from outbound bodies and tolerated when missing from inbound ones.

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::IpcError;

/// Message codes, client-to-server and server-to-client.
pub mod code {
    pub const CREATE_EVALUATOR: u8 = 0x20;
    pub const CREATE_EVALUATOR_RESPONSE: u8 = 0x21;
    pub const CLOSE_EVALUATOR: u8 = 0x22;
    pub const EVALUATE: u8 = 0x23;
    pub const EVALUATE_RESPONSE: u8 = 0x24;
    pub const LOG: u8 = 0x25;
    pub const READ_RESOURCE: u8 = 0x26;
    pub const READ_RESOURCE_RESPONSE: u8 = 0x27;
    pub const READ_MODULE: u8 = 0x28;
    pub const READ_MODULE_RESPONSE: u8 = 0x29;
    pub const LIST_RESOURCES: u8 = 0x2A;
    pub const LIST_RESOURCES_RESPONSE: u8 = 0x2B;
    pub const LIST_MODULES: u8 = 0x2C;
    pub const LIST_MODULES_RESPONSE: u8 = 0x2D;
}

/// One entry of a list/glob callback result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathElement {
    pub name: String,
    pub is_directory: bool,
}

impl PathElement {
    pub fn new(name: impl Into<String>, is_directory: bool) -> Self {
        PathElement {
            name: name.into(),
            is_directory,
        }
    }
}

/// Capabilities a client-side module reader declares at evaluator creation.
/// The server tailors its callbacks to these flags, so they must be truthful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleReaderDescriptor {
    pub scheme: String,
    pub has_hierarchical_uris: bool,
    pub is_globbable: bool,
    pub is_local: bool,
}

/// Capabilities a client-side resource reader declares at evaluator creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReaderDescriptor {
    pub scheme: String,
    pub has_hierarchical_uris: bool,
    pub is_globbable: bool,
}

/// Package checksums of a remote dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checksums {
    pub sha256: String,
}

/// A node of the project dependency tree sent inside `CreateEvaluator`.
///
/// Local projects nest their own dependency maps; remote dependencies are
/// pinned by package URI and checksum. The tree is finite by construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ProjectDependency {
    #[serde(rename = "local")]
    Local(LocalProject),
    #[serde(rename = "remote")]
    Remote(RemoteDependency),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalProject {
    pub project_file_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_uri: Option<String>,
    pub dependencies: IndexMap<String, ProjectDependency>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDependency {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksums: Option<Checksums>,
}

// Client-to-server bodies.

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEvaluator {
    pub request_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_modules: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_resources: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_module_readers: Option<Vec<ModuleReaderDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_resource_readers: Option<Vec<ResourceReaderDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_paths: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<IndexMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<IndexMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectDependency>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseEvaluator {
    pub evaluator_id: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluate {
    pub request_id: i64,
    pub evaluator_id: i64,
    pub module_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResourceResponse {
    pub request_id: i64,
    pub evaluator_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadModuleResponse {
    pub request_id: i64,
    pub evaluator_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesResponse {
    pub request_id: i64,
    pub evaluator_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_elements: Option<Vec<PathElement>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListModulesResponse {
    pub request_id: i64,
    pub evaluator_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_elements: Option<Vec<PathElement>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// Server-to-client bodies.

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEvaluatorResponse {
    pub request_id: i64,
    #[serde(default)]
    pub evaluator_id: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    pub request_id: i64,
    pub evaluator_id: i64,
    #[serde(default)]
    pub result: Option<ByteBuf>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub evaluator_id: i64,
    pub level: i64,
    pub message: String,
    pub frame_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResource {
    pub request_id: i64,
    pub evaluator_id: i64,
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadModule {
    pub request_id: i64,
    pub evaluator_id: i64,
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResources {
    pub request_id: i64,
    pub evaluator_id: i64,
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListModules {
    pub request_id: i64,
    pub evaluator_id: i64,
    pub uri: String,
}

/// Everything the client can put on the wire.
#[derive(Debug, Clone)]
pub enum OutgoingMessage {
    CreateEvaluator(CreateEvaluator),
    CloseEvaluator(CloseEvaluator),
    Evaluate(Evaluate),
    ReadResourceResponse(ReadResourceResponse),
    ReadModuleResponse(ReadModuleResponse),
    ListResourcesResponse(ListResourcesResponse),
    ListModulesResponse(ListModulesResponse),
}

impl OutgoingMessage {
    pub fn code(&self) -> u8 {
        match self {
            OutgoingMessage::CreateEvaluator(_) => code::CREATE_EVALUATOR,
            OutgoingMessage::CloseEvaluator(_) => code::CLOSE_EVALUATOR,
            OutgoingMessage::Evaluate(_) => code::EVALUATE,
            OutgoingMessage::ReadResourceResponse(_) => code::READ_RESOURCE_RESPONSE,
            OutgoingMessage::ReadModuleResponse(_) => code::READ_MODULE_RESPONSE,
            OutgoingMessage::ListResourcesResponse(_) => code::LIST_RESOURCES_RESPONSE,
            OutgoingMessage::ListModulesResponse(_) => code::LIST_MODULES_RESPONSE,
        }
    }

    /// Encodes the `[code, body]` envelope. Struct fields land as a map keyed
    /// by field name; `None` fields are left out entirely.
    pub fn encode(&self) -> Result<Vec<u8>, IpcError> {
        match self {
            OutgoingMessage::CreateEvaluator(m) => envelope(self.code(), m),
            OutgoingMessage::CloseEvaluator(m) => envelope(self.code(), m),
            OutgoingMessage::Evaluate(m) => envelope(self.code(), m),
            OutgoingMessage::ReadResourceResponse(m) => envelope(self.code(), m),
            OutgoingMessage::ReadModuleResponse(m) => envelope(self.code(), m),
            OutgoingMessage::ListResourcesResponse(m) => envelope(self.code(), m),
            OutgoingMessage::ListModulesResponse(m) => envelope(self.code(), m),
        }
    }
}

fn envelope<T: Serialize>(code: u8, body: &T) -> Result<Vec<u8>, IpcError> {
    rmp_serde::to_vec_named(&(code, body)).map_err(|err| IpcError::Encode(err.to_string()))
}

/// Everything the server can put on the wire.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    CreateEvaluatorResponse(CreateEvaluatorResponse),
    EvaluateResponse(EvaluateResponse),
    Log(Log),
    ReadResource(ReadResource),
    ReadModule(ReadModule),
    ListResources(ListResources),
    ListModules(ListModules),
}

impl IncomingMessage {
    /// Decodes one inbound frame. Unknown codes and bodies missing required
    /// fields are protocol violations.
    pub fn decode(frame: rmpv::Value) -> Result<IncomingMessage, IpcError> {
        let rmpv::Value::Array(mut items) = frame else {
            return Err(IpcError::MalformedFrame("frame is not an array".to_owned()));
        };
        if items.len() != 2 {
            return Err(IpcError::MalformedFrame(format!(
                "frame has {} elements, expected [code, body]",
                items.len()
            )));
        }
        let body = items.remove(1);
        let frame_code = items.remove(0).as_u64().ok_or_else(|| {
            IpcError::MalformedFrame("frame code is not an unsigned integer".to_owned())
        })?;

        match u8::try_from(frame_code) {
            Ok(code::CREATE_EVALUATOR_RESPONSE) => {
                Ok(IncomingMessage::CreateEvaluatorResponse(body_of(body)?))
            }
            Ok(code::EVALUATE_RESPONSE) => Ok(IncomingMessage::EvaluateResponse(body_of(body)?)),
            Ok(code::LOG) => Ok(IncomingMessage::Log(body_of(body)?)),
            Ok(code::READ_RESOURCE) => Ok(IncomingMessage::ReadResource(body_of(body)?)),
            Ok(code::READ_MODULE) => Ok(IncomingMessage::ReadModule(body_of(body)?)),
            Ok(code::LIST_RESOURCES) => Ok(IncomingMessage::ListResources(body_of(body)?)),
            Ok(code::LIST_MODULES) => Ok(IncomingMessage::ListModules(body_of(body)?)),
            _ => Err(IpcError::UnexpectedCode(frame_code)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IncomingMessage::CreateEvaluatorResponse(_) => "CreateEvaluatorResponse",
            IncomingMessage::EvaluateResponse(_) => "EvaluateResponse",
            IncomingMessage::Log(_) => "Log",
            IncomingMessage::ReadResource(_) => "ReadResource",
            IncomingMessage::ReadModule(_) => "ReadModule",
            IncomingMessage::ListResources(_) => "ListResources",
            IncomingMessage::ListModules(_) => "ListModules",
        }
    }

    /// True for the two frames that answer a client-initiated request.
    /// Server-initiated callbacks carry a request id too, but from the
    /// server's own id space; they are never matched against ours.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            IncomingMessage::CreateEvaluatorResponse(_) | IncomingMessage::EvaluateResponse(_)
        )
    }

    pub fn request_id(&self) -> Option<i64> {
        match self {
            IncomingMessage::CreateEvaluatorResponse(m) => Some(m.request_id),
            IncomingMessage::EvaluateResponse(m) => Some(m.request_id),
            IncomingMessage::Log(_) => None,
            IncomingMessage::ReadResource(m) => Some(m.request_id),
            IncomingMessage::ReadModule(m) => Some(m.request_id),
            IncomingMessage::ListResources(m) => Some(m.request_id),
            IncomingMessage::ListModules(m) => Some(m.request_id),
        }
    }

    pub fn evaluator_id(&self) -> Option<i64> {
        match self {
            IncomingMessage::CreateEvaluatorResponse(m) => m.evaluator_id,
            IncomingMessage::EvaluateResponse(m) => Some(m.evaluator_id),
            IncomingMessage::Log(m) => Some(m.evaluator_id),
            IncomingMessage::ReadResource(m) => Some(m.evaluator_id),
            IncomingMessage::ReadModule(m) => Some(m.evaluator_id),
            IncomingMessage::ListResources(m) => Some(m.evaluator_id),
            IncomingMessage::ListModules(m) => Some(m.evaluator_id),
        }
    }
}

fn body_of<T: DeserializeOwned>(body: rmpv::Value) -> Result<T, IpcError> {
    rmpv::ext::from_value(body).map_err(|err| IpcError::MalformedFrame(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmpv::Value;

    fn decode_envelope(bytes: &[u8]) -> (u64, Vec<(Value, Value)>) {
        let mut cursor = bytes;
        let value = rmpv::decode::read_value(&mut cursor).unwrap();
        assert!(cursor.is_empty(), "trailing bytes after envelope");
        let items = match value {
            Value::Array(items) => items,
            other => panic!("envelope is not an array: {other}"),
        };
        assert_eq!(items.len(), 2);
        let code = items[0].as_u64().unwrap();
        let Value::Map(fields) = items[1].clone() else {
            panic!("body is not a map: {}", items[1]);
        };
        (code, fields)
    }

    fn field<'a>(fields: &'a [(Value, Value)], name: &str) -> Option<&'a Value> {
        fields
            .iter()
            .find(|(k, _)| k.as_str() == Some(name))
            .map(|(_, v)| v)
    }

    #[test]
    fn evaluate_omits_absent_optionals() {
        let msg = OutgoingMessage::Evaluate(Evaluate {
            request_id: 7,
            evaluator_id: 42,
            module_uri: "repl:text".to_owned(),
            module_text: None,
            expr: Some("output.value".to_owned()),
        });
        let (code, fields) = decode_envelope(&msg.encode().unwrap());
        assert_eq!(code, 0x23);
        assert_eq!(field(&fields, "requestId").unwrap().as_i64(), Some(7));
        assert_eq!(field(&fields, "evaluatorId").unwrap().as_i64(), Some(42));
        assert_eq!(
            field(&fields, "moduleUri").unwrap().as_str(),
            Some("repl:text")
        );
        assert!(field(&fields, "moduleText").is_none());
        assert_eq!(field(&fields, "expr").unwrap().as_str(), Some("output.value"));
    }

    #[test]
    fn create_evaluator_serializes_reader_descriptors() {
        let msg = OutgoingMessage::CreateEvaluator(CreateEvaluator {
            request_id: 1,
            allowed_modules: Some(vec!["pkl:".to_owned(), "customfs:".to_owned()]),
            client_module_readers: Some(vec![ModuleReaderDescriptor {
                scheme: "customfs".to_owned(),
                has_hierarchical_uris: true,
                is_globbable: true,
                is_local: true,
            }]),
            ..Default::default()
        });
        let (code, fields) = decode_envelope(&msg.encode().unwrap());
        assert_eq!(code, 0x20);
        let Value::Array(readers) = field(&fields, "clientModuleReaders").unwrap() else {
            panic!("clientModuleReaders is not an array");
        };
        let Value::Map(descriptor) = &readers[0] else {
            panic!("descriptor is not a map");
        };
        assert_eq!(field(descriptor, "scheme").unwrap().as_str(), Some("customfs"));
        assert_eq!(
            field(descriptor, "hasHierarchicalUris").unwrap().as_bool(),
            Some(true)
        );
        assert_eq!(field(descriptor, "isLocal").unwrap().as_bool(), Some(true));
        assert!(field(&fields, "env").is_none());
        assert!(field(&fields, "project").is_none());
    }

    #[test]
    fn project_dependencies_carry_type_tags() {
        let project = ProjectDependency::Local(LocalProject {
            project_file_uri: "file:///work/PklProject".to_owned(),
            package_uri: None,
            dependencies: IndexMap::from([(
                "uri".to_owned(),
                ProjectDependency::Remote(RemoteDependency {
                    package_uri: Some("package://example.com/uri@1.0.0".to_owned()),
                    checksums: Some(Checksums {
                        sha256: "abc123".to_owned(),
                    }),
                }),
            )]),
        });
        let msg = OutgoingMessage::CreateEvaluator(CreateEvaluator {
            request_id: 1,
            project: Some(project),
            ..Default::default()
        });
        let (_, fields) = decode_envelope(&msg.encode().unwrap());
        let Value::Map(project) = field(&fields, "project").unwrap() else {
            panic!("project is not a map");
        };
        assert_eq!(field(project, "type").unwrap().as_str(), Some("local"));
        let Value::Map(deps) = field(project, "dependencies").unwrap() else {
            panic!("dependencies is not a map");
        };
        let Value::Map(remote) = &deps[0].1 else {
            panic!("dependency is not a map");
        };
        assert_eq!(field(remote, "type").unwrap().as_str(), Some("remote"));
        let Value::Map(checksums) = field(remote, "checksums").unwrap() else {
            panic!("checksums is not a map");
        };
        assert_eq!(field(checksums, "sha256").unwrap().as_str(), Some("abc123"));
    }

    #[test]
    fn read_resource_response_contents_are_binary() {
        let msg = OutgoingMessage::ReadResourceResponse(ReadResourceResponse {
            request_id: 9,
            evaluator_id: 3,
            contents: Some(ByteBuf::from(vec![0u8, 159, 146, 150])),
            error: None,
        });
        let (code, fields) = decode_envelope(&msg.encode().unwrap());
        assert_eq!(code, 0x27);
        match field(&fields, "contents").unwrap() {
            Value::Binary(bytes) => assert_eq!(bytes, &vec![0u8, 159, 146, 150]),
            other => panic!("contents is not binary: {other}"),
        }
        assert!(field(&fields, "error").is_none());
    }

    #[test]
    fn decodes_evaluate_response_with_result() {
        let frame = Value::Array(vec![
            Value::from(0x24),
            Value::Map(vec![
                (Value::from("requestId"), Value::from(11)),
                (Value::from("evaluatorId"), Value::from(5)),
                (Value::from("result"), Value::Binary(vec![0xc0])),
            ]),
        ]);
        let IncomingMessage::EvaluateResponse(resp) = IncomingMessage::decode(frame).unwrap()
        else {
            panic!("wrong kind");
        };
        assert_eq!(resp.request_id, 11);
        assert_eq!(resp.evaluator_id, 5);
        assert_eq!(resp.result.as_ref().map(|b| &b[..]), Some(&[0xc0u8][..]));
        assert_eq!(resp.error, None);
    }

    #[test]
    fn decodes_log_frame() {
        let frame = Value::Array(vec![
            Value::from(0x25),
            Value::Map(vec![
                (Value::from("evaluatorId"), Value::from(5)),
                (Value::from("level"), Value::from(1)),
                (Value::from("message"), Value::from("deprecated")),
                (Value::from("frameUri"), Value::from("file:///mod.pkl#3")),
            ]),
        ]);
        let msg = IncomingMessage::decode(frame).unwrap();
        assert!(!msg.is_response());
        assert_eq!(msg.request_id(), None);
        assert_eq!(msg.evaluator_id(), Some(5));
    }

    #[test]
    fn unknown_code_is_rejected() {
        let frame = Value::Array(vec![Value::from(0x99), Value::Map(vec![])]);
        assert!(matches!(
            IncomingMessage::decode(frame),
            Err(IpcError::UnexpectedCode(0x99))
        ));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let frame = Value::Array(vec![
            Value::from(0x28),
            Value::Map(vec![(Value::from("requestId"), Value::from(1))]),
        ]);
        assert!(matches!(
            IncomingMessage::decode(frame),
            Err(IpcError::MalformedFrame(_))
        ));
    }
}
