//! Configuration Graph Integration Tests
//!
//! Validation reports, reference and cycle checks, and root selection.

mod common;

use common::tenant_doc;
use convo::core::{ConfigError, ErrorCode, ErrorKind};
use convo::ConfigGraphService;
use serde_json::json;

#[test]
fn test_valid_configuration_loads() {
    let graphs = ConfigGraphService::new();
    let raw = tenant_doc(json!([
        {"id": "name", "type": "capture_name", "purpose": "greet", "on_success": "email"},
        {"id": "email", "type": "capture_email", "purpose": "receipt", "required": false, "on_success": "end"},
    ]));

    assert!(graphs.validate(&raw).valid);

    let config = graphs.load(&raw).unwrap();
    assert_eq!(config.tenant_id, "acme");
    assert_eq!(config.objectives.len(), 2);
    assert!(config.objectives[0].required);
    assert_eq!(config.objectives[0].max_retries, 2);
    assert!(!config.objectives[1].required);

    let graph = graphs.build_graph(&config).unwrap();
    assert_eq!(graph.root(), "name");
    assert_eq!(graph.len(), 2);
}

#[test]
fn test_validation_reports_every_problem() {
    let graphs = ConfigGraphService::new();
    let raw = json!({
        "tenant_id": "",
        "tenant_name": "Acme",
        "locale": "en-GB",
        "schema_version": "2.0",
        "objectives": [
            {"id": "a", "type": "capture_fax", "purpose": "x"},
            {"id": "a", "type": "capture_name", "purpose": "y", "max_retries": 0},
            {"type": "capture_date"},
        ],
    });

    let report = graphs.validate(&raw);
    assert!(!report.valid);
    assert!(report.has_code(ErrorCode::SchemaVersionMismatch));
    assert!(report.has_code(ErrorCode::DuplicateId));
    assert!(report.has_code(ErrorCode::RequiredField));
    assert!(report.errors.len() >= 5, "got {:?}", report.errors);

    let fields: Vec<_> = report.errors.iter().map(|e| e.field.as_str()).collect();
    assert!(fields.contains(&"tenant_id"));
    assert!(fields.contains(&"schema_version"));
    assert!(fields.iter().any(|f| f.starts_with("objectives[0]")));
    assert!(fields.iter().any(|f| f.starts_with("objectives[2]")));

    let err = graphs.load(&raw).unwrap_err();
    assert!(err.has_kind(ErrorKind::Validation));
}

#[test]
fn test_empty_objectives_rejected() {
    let report = ConfigGraphService::new().validate(&tenant_doc(json!([])));
    assert!(!report.valid);
    assert!(report.has_code(ErrorCode::EmptyObjectives));
}

#[test]
fn test_two_node_cycle_rejected_at_load() {
    let graphs = ConfigGraphService::new();
    let raw = tenant_doc(json!([
        {"id": "A", "type": "capture_name", "purpose": "a", "on_success": "B", "on_failure": "B"},
        {"id": "B", "type": "capture_date", "purpose": "b", "on_success": "A"},
    ]));

    // Structurally fine, but not a DAG
    assert!(graphs.validate(&raw).valid);

    let err = graphs.load(&raw).unwrap_err();
    assert!(err.has_kind(ErrorKind::Cycle));
    assert!(!err.has_kind(ErrorKind::Reference));
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn test_cycle_in_disconnected_component_detected() {
    let graphs = ConfigGraphService::new();
    let raw = tenant_doc(json!([
        {"id": "start", "type": "capture_name", "purpose": "main", "on_success": "end"},
        {"id": "x", "type": "capture_date", "purpose": "island", "on_success": "y"},
        {"id": "y", "type": "capture_number", "purpose": "island", "on_success": "z"},
        {"id": "z", "type": "capture_choice", "purpose": "island", "on_failure": "x"},
    ]));

    let err = graphs.load(&raw).unwrap_err();
    let cycles: Vec<_> = err
        .errors()
        .into_iter()
        .filter(|e| e.code == ErrorCode::CycleError)
        .collect();
    assert_eq!(cycles.len(), 1);
    assert!(cycles[0].message.contains("x -> y -> z -> x"), "{}", cycles[0].message);
}

#[test]
fn test_self_loop_is_a_cycle() {
    let graphs = ConfigGraphService::new();
    let raw = tenant_doc(json!([
        {"id": "ask", "type": "capture_yes_no", "purpose": "confirm", "on_failure": "ask"},
    ]));

    let err = graphs.load(&raw).unwrap_err();
    assert!(err.has_kind(ErrorKind::Cycle));
}

#[test]
fn test_dangling_reference_rejected() {
    let graphs = ConfigGraphService::new();
    let raw = tenant_doc(json!([
        {"id": "A", "type": "capture_name", "purpose": "a", "on_success": "B"},
        {"id": "C", "type": "capture_date", "purpose": "c", "on_failure": "missing"},
    ]));

    let err = graphs.load(&raw).unwrap_err();
    assert!(err.has_kind(ErrorKind::Reference));
    let fields: Vec<_> = err.errors().into_iter().map(|e| e.field).collect();
    assert_eq!(
        fields,
        vec!["objectives[0].on_success".to_string(), "objectives[1].on_failure".to_string()]
    );
}

#[test]
fn test_root_tie_break_uses_declaration_order() {
    let graphs = ConfigGraphService::new();
    let config = graphs
        .load(&tenant_doc(json!([
            {"id": "second", "type": "capture_date", "purpose": "b", "on_success": "shared"},
            {"id": "first", "type": "capture_name", "purpose": "a", "on_success": "shared"},
            {"id": "shared", "type": "capture_yes_no", "purpose": "c", "on_success": "end"},
        ])))
        .unwrap();

    assert_eq!(graphs.candidate_roots(&config.objectives), vec!["second", "first"]);
    assert_eq!(graphs.build_graph(&config).unwrap().root(), "second");
}

#[test]
fn test_yaml_document_loads() {
    let yaml = r#"
tenant_id: acme
tenant_name: Acme Dental
locale: en-GB
schema_version: "1.0"
objectives:
  - id: name
    type: capture_name
    purpose: greet the caller
    on_success: phone
  - id: phone
    type: capture_phone
    purpose: call back
    required: false
    max_retries: 1
    escalation: voicemail
    on_success: end
"#;

    let config = ConfigGraphService::new().load_str(yaml).unwrap();
    assert_eq!(config.objectives.len(), 2);
    assert_eq!(config.objectives[1].max_retries, 1);
    assert_eq!(config.objectives[1].total_attempts(), 2);
}

#[test]
fn test_null_optional_fields_take_defaults() {
    let config = ConfigGraphService::new()
        .load(&tenant_doc(json!([
            {"id": "A", "type": "capture_name", "purpose": "a", "on_success": null, "on_failure": null, "params": null},
        ])))
        .unwrap();

    assert!(config.objectives[0].required);
    assert_eq!(config.objectives[0].max_retries, 2);
    assert!(config.objectives[0].success_target().is_none());
    assert!(config.objectives[0].params.is_empty());
}
