// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversation-level behavior of the manager and its sessions over a
//! scripted wire: request/response pairing, frame routing, callback
//! servicing, and teardown.

use libpkl::test_utils::{body_of, code_of, field, frame, result_bytes, ScriptedWire};
use libpkl::{
    EvaluatorManager, EvaluatorOptions, ModuleReader, ModuleSource, PathElement, PklError, Value,
};
use rmpv::Value as Mp;
use url::Url;

fn manager_over(wire: &ScriptedWire) -> EvaluatorManager {
    EvaluatorManager::with_wire(wire.writer(), wire.reader())
}

fn create_response(request_id: i64, evaluator_id: i64) -> Mp {
    frame(
        0x21,
        vec![
            ("requestId", Mp::from(request_id)),
            ("evaluatorId", Mp::from(evaluator_id)),
        ],
    )
}

fn create_error(request_id: i64, error: &str) -> Mp {
    frame(
        0x21,
        vec![
            ("requestId", Mp::from(request_id)),
            ("error", Mp::from(error)),
        ],
    )
}

fn evaluate_response(request_id: i64, evaluator_id: i64, tree: &Mp) -> Mp {
    frame(
        0x24,
        vec![
            ("requestId", Mp::from(request_id)),
            ("evaluatorId", Mp::from(evaluator_id)),
            ("result", result_bytes(tree)),
        ],
    )
}

fn evaluate_error(request_id: i64, evaluator_id: i64, error: &str) -> Mp {
    frame(
        0x24,
        vec![
            ("requestId", Mp::from(request_id)),
            ("evaluatorId", Mp::from(evaluator_id)),
            ("error", Mp::from(error)),
        ],
    )
}

fn log_frame(evaluator_id: i64, level: i64, message: &str) -> Mp {
    frame(
        0x25,
        vec![
            ("evaluatorId", Mp::from(evaluator_id)),
            ("level", Mp::from(level)),
            ("message", Mp::from(message)),
            ("frameUri", Mp::from("file:///mod.pkl#L1")),
        ],
    )
}

fn read_module(request_id: i64, evaluator_id: i64, uri: &str) -> Mp {
    frame(
        0x28,
        vec![
            ("requestId", Mp::from(request_id)),
            ("evaluatorId", Mp::from(evaluator_id)),
            ("uri", Mp::from(uri)),
        ],
    )
}

struct FixedModule {
    scheme: &'static str,
    body: &'static str,
}

impl ModuleReader for FixedModule {
    fn scheme(&self) -> &str {
        self.scheme
    }

    fn is_local(&self) -> bool {
        true
    }

    fn read(&self, _uri: &Url) -> anyhow::Result<String> {
        Ok(self.body.to_owned())
    }
}

struct FailingModule;

impl ModuleReader for FailingModule {
    fn scheme(&self) -> &str {
        "customfs"
    }

    fn read(&self, uri: &Url) -> anyhow::Result<String> {
        anyhow::bail!("backing store unavailable for {uri}")
    }
}

struct ListingModule;

impl ModuleReader for ListingModule {
    fn scheme(&self) -> &str {
        "customfs"
    }

    fn has_hierarchical_uris(&self) -> bool {
        true
    }

    fn is_globbable(&self) -> bool {
        true
    }

    fn is_local(&self) -> bool {
        true
    }

    fn read(&self, _uri: &Url) -> anyhow::Result<String> {
        Ok(String::new())
    }

    fn list_elements(&self, _uri: &Url) -> anyhow::Result<Vec<PathElement>> {
        Ok(vec![
            PathElement::new("birds.pkl", false),
            PathElement::new("nested", true),
        ])
    }
}

#[test]
fn logs_between_request_and_response_are_not_the_response() {
    let wire = ScriptedWire::new();
    wire.script([
        create_response(1, 100),
        log_frame(100, 0, "resolving imports"),
        log_frame(100, 1, "deprecated syntax"),
        evaluate_response(2, 100, &Mp::from(42)),
    ]);
    let manager = manager_over(&wire);
    let evaluator = manager.new_evaluator(EvaluatorOptions::default()).unwrap();
    let value = evaluator
        .evaluate(&ModuleSource::from_text("a = 42"), Some("a"))
        .unwrap();
    assert_eq!(value, Value::Int(42));
    assert_eq!(wire.remaining(), 0);
}

#[test]
fn stale_responses_are_dropped_until_the_awaited_request_id() {
    let wire = ScriptedWire::new();
    wire.script([
        create_response(1, 100),
        evaluate_response(99, 100, &Mp::from("stale")),
        evaluate_response(2, 100, &Mp::from("fresh")),
    ]);
    let manager = manager_over(&wire);
    let evaluator = manager.new_evaluator(EvaluatorOptions::default()).unwrap();
    let value = evaluator
        .evaluate(&ModuleSource::from_text("x"), Some("x"))
        .unwrap();
    assert_eq!(value, Value::String("fresh".to_owned()));
}

#[test]
fn callbacks_route_to_the_session_owning_the_evaluator_id() {
    let wire = ScriptedWire::new();
    wire.script([
        create_response(1, 100),
        create_response(2, 200),
        read_module(77, 200, "customfs:/foo.pkl"),
        evaluate_response(3, 100, &Mp::from(1)),
    ]);
    let manager = manager_over(&wire);
    let plain = manager.new_evaluator(EvaluatorOptions::default()).unwrap();
    let _with_reader = manager
        .new_evaluator(EvaluatorOptions::default().with_module_reader(FixedModule {
            scheme: "customfs",
            body: "foo = 1",
        }))
        .unwrap();

    plain
        .evaluate(&ModuleSource::from_text("x"), Some("x"))
        .unwrap();

    let responses: Vec<_> = wire
        .sent()
        .iter()
        .filter(|f| code_of(f) == 0x29)
        .map(body_of)
        .collect();
    assert_eq!(responses.len(), 1);
    assert_eq!(field(&responses[0], "requestId").unwrap().as_i64(), Some(77));
    assert_eq!(
        field(&responses[0], "evaluatorId").unwrap().as_i64(),
        Some(200)
    );
    assert_eq!(
        field(&responses[0], "contents").unwrap().as_str(),
        Some("foo = 1")
    );
    assert!(field(&responses[0], "error").is_none());
}

#[test]
fn reader_failure_becomes_response_data_and_session_survives() {
    let wire = ScriptedWire::new();
    wire.script([
        create_response(1, 100),
        read_module(8, 100, "customfs:/gone.pkl"),
        evaluate_response(2, 100, &Mp::from(1)),
        evaluate_response(3, 100, &Mp::from(2)),
    ]);
    let manager = manager_over(&wire);
    let evaluator = manager
        .new_evaluator(EvaluatorOptions::default().with_module_reader(FailingModule))
        .unwrap();

    let first = evaluator
        .evaluate(&ModuleSource::from_text("x"), Some("x"))
        .unwrap();
    assert_eq!(first, Value::Int(1));

    let response = wire
        .sent()
        .iter()
        .find(|f| code_of(f) == 0x29)
        .map(body_of)
        .unwrap();
    assert!(field(&response, "contents").is_none());
    let error = field(&response, "error").unwrap().as_str().unwrap();
    assert!(error.contains("backing store unavailable"), "{error}");

    // The failed callback must not poison the session.
    let second = evaluator
        .evaluate(&ModuleSource::from_text("y"), Some("y"))
        .unwrap();
    assert_eq!(second, Value::Int(2));
}

#[test]
fn missing_reader_scheme_is_reported_to_the_server() {
    let wire = ScriptedWire::new();
    wire.script([
        create_response(1, 100),
        read_module(4, 100, "customfs:/foo.pkl"),
        evaluate_response(2, 100, &Mp::from(1)),
    ]);
    let manager = manager_over(&wire);
    let evaluator = manager.new_evaluator(EvaluatorOptions::default()).unwrap();
    evaluator
        .evaluate(&ModuleSource::from_text("x"), Some("x"))
        .unwrap();

    let response = wire
        .sent()
        .iter()
        .find(|f| code_of(f) == 0x29)
        .map(body_of)
        .unwrap();
    let error = field(&response, "error").unwrap().as_str().unwrap();
    assert!(error.contains("no module reader registered for scheme 'customfs'"));
}

#[test]
fn list_modules_callback_returns_path_elements() {
    let wire = ScriptedWire::new();
    wire.script([
        create_response(1, 100),
        frame(
            0x2C,
            vec![
                ("requestId", Mp::from(6)),
                ("evaluatorId", Mp::from(100)),
                ("uri", Mp::from("customfs:/")),
            ],
        ),
        evaluate_response(2, 100, &Mp::from(1)),
    ]);
    let manager = manager_over(&wire);
    let evaluator = manager
        .new_evaluator(EvaluatorOptions::default().with_module_reader(ListingModule))
        .unwrap();
    evaluator
        .evaluate(&ModuleSource::from_text("x"), Some("x"))
        .unwrap();

    let response = wire
        .sent()
        .iter()
        .find(|f| code_of(f) == 0x2D)
        .map(body_of)
        .unwrap();
    let Mp::Array(elements) = field(&response, "pathElements").unwrap() else {
        panic!("pathElements is not an array");
    };
    assert_eq!(elements.len(), 2);
    let Mp::Map(first) = &elements[0] else {
        panic!("path element is not a map");
    };
    assert_eq!(field(first, "name").unwrap().as_str(), Some("birds.pkl"));
    assert_eq!(field(first, "isDirectory").unwrap().as_bool(), Some(false));
}

#[test]
fn callbacks_for_unknown_evaluators_are_dropped() {
    let wire = ScriptedWire::new();
    wire.script([
        create_response(1, 100),
        read_module(5, 999, "customfs:/foo.pkl"),
        evaluate_response(2, 100, &Mp::from(7)),
    ]);
    let manager = manager_over(&wire);
    let evaluator = manager.new_evaluator(EvaluatorOptions::default()).unwrap();
    let value = evaluator
        .evaluate(&ModuleSource::from_text("x"), Some("x"))
        .unwrap();
    assert_eq!(value, Value::Int(7));
    assert!(wire.sent().iter().all(|f| code_of(f) != 0x29));
}

#[test]
fn init_errors_surface_from_create() {
    let wire = ScriptedWire::new();
    wire.script([create_error(1, "invalid allowedModules pattern")]);
    let manager = manager_over(&wire);
    let err = manager
        .new_evaluator(EvaluatorOptions::default())
        .unwrap_err();
    assert!(matches!(err, PklError::Init(_)));
    assert!(err.to_string().contains("invalid allowedModules pattern"));
}

#[test]
fn evaluation_errors_render_verbatim_with_leading_newline() {
    let wire = ScriptedWire::new();
    wire.script([
        create_response(1, 100),
        evaluate_error(2, 100, "–– Pkl Error ––\nunresolved import"),
    ]);
    let manager = manager_over(&wire);
    let evaluator = manager.new_evaluator(EvaluatorOptions::default()).unwrap();
    let err = evaluator
        .evaluate(&ModuleSource::from_text("x"), None)
        .unwrap_err();
    assert!(matches!(err, PklError::Evaluation(_)), "{err:?}");
    assert_eq!(err.to_string(), "\n–– Pkl Error ––\nunresolved import");
}

#[test]
fn close_is_idempotent_and_blocks_further_evaluation() {
    let wire = ScriptedWire::new();
    wire.script([create_response(1, 100)]);
    let manager = manager_over(&wire);
    let evaluator = manager.new_evaluator(EvaluatorOptions::default()).unwrap();

    evaluator.close().unwrap();
    evaluator.close().unwrap();

    let sent = wire.sent();
    let closes: Vec<_> = sent.iter().filter(|f| code_of(f) == 0x22).collect();
    assert_eq!(closes.len(), 1);
    assert_eq!(
        field(&body_of(closes[0]), "evaluatorId").unwrap().as_i64(),
        Some(100)
    );

    let sent_before = wire.sent().len();
    let err = evaluator
        .evaluate(&ModuleSource::from_text("x"), None)
        .unwrap_err();
    assert!(matches!(err, PklError::SessionClosed));
    assert_eq!(wire.sent().len(), sent_before);
}

#[test]
fn exhausted_wire_poisons_the_wait_as_transport_closed() {
    let wire = ScriptedWire::new();
    wire.script([create_response(1, 100)]);
    let manager = manager_over(&wire);
    let evaluator = manager.new_evaluator(EvaluatorOptions::default()).unwrap();
    let err = evaluator
        .evaluate(&ModuleSource::from_text("x"), None)
        .unwrap_err();
    assert!(matches!(err, PklError::Transport(_)));
}

#[test]
fn evaluate_request_carries_source_and_expr() {
    let wire = ScriptedWire::new();
    wire.script([
        create_response(1, 100),
        evaluate_response(2, 100, &Mp::from(1)),
    ]);
    let manager = manager_over(&wire);
    let evaluator = manager.new_evaluator(EvaluatorOptions::default()).unwrap();
    evaluator
        .evaluate(&ModuleSource::from_text("a: Int = 1 + 1"), Some("a"))
        .unwrap();

    let request = wire
        .sent()
        .iter()
        .find(|f| code_of(f) == 0x23)
        .map(body_of)
        .unwrap();
    assert_eq!(field(&request, "requestId").unwrap().as_i64(), Some(2));
    assert_eq!(field(&request, "evaluatorId").unwrap().as_i64(), Some(100));
    assert_eq!(
        field(&request, "moduleUri").unwrap().as_str(),
        Some("repl:text")
    );
    assert_eq!(
        field(&request, "moduleText").unwrap().as_str(),
        Some("a: Int = 1 + 1")
    );
    assert_eq!(field(&request, "expr").unwrap().as_str(), Some("a"));
}
