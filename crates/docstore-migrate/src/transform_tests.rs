//! Tests for record normalization.

use super::*;
use chrono::TimeZone;
use serde_json::json;

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => panic!("test record must be an object"),
    }
}

fn descriptor() -> CollectionDescriptor {
    CollectionDescriptor::new("ACADEMICA", "/academica", "academica", 100, 1)
        .with_json_fields(&["extensionHistory", "onHoldHistory"])
        .with_date_fields(&["fechaNacimiento", "inicioCurso"])
}

fn transformer() -> Transformer {
    Transformer::new(&descriptor(), &MigrationOptions::default())
}

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap()
}

#[test]
fn test_json_field_object_is_serialized() {
    let out = transformer().transform_at(
        record(json!({"_id": "a1", "extensionHistory": [{"days": 30}]})),
        fixed_now(),
    );
    assert_eq!(out["extensionHistory"], json!(r#"[{"days":30}]"#));
}

#[test]
fn test_json_field_missing_defaults_to_empty_array() {
    let out = transformer().transform_at(record(json!({"_id": "a1"})), fixed_now());
    assert_eq!(out["extensionHistory"], json!("[]"));
    assert_eq!(out["onHoldHistory"], json!("[]"));
}

#[test]
fn test_json_field_null_defaults_to_empty_array() {
    let out = transformer().transform_at(
        record(json!({"_id": "a1", "onHoldHistory": null})),
        fixed_now(),
    );
    assert_eq!(out["onHoldHistory"], json!("[]"));
}

#[test]
fn test_json_field_existing_string_untouched() {
    let out = transformer().transform_at(
        record(json!({"_id": "a1", "onHoldHistory": "[1,2]"})),
        fixed_now(),
    );
    assert_eq!(out["onHoldHistory"], json!("[1,2]"));
}

#[test]
fn test_origin_tag_is_stamped() {
    let out = transformer().transform_at(record(json!({"_id": "a1"})), fixed_now());
    assert_eq!(out["origen"], json!("DOCSTORE_MIGRATION"));
}

#[test]
fn test_empty_strings_become_null() {
    let out = transformer().transform_at(
        record(json!({"_id": "a1", "nombre": "", "ciudad": "Bogota"})),
        fixed_now(),
    );
    assert_eq!(out["nombre"], Value::Null);
    assert_eq!(out["ciudad"], json!("Bogota"));
}

#[test]
fn test_invalid_dates_become_null() {
    let out = transformer().transform_at(
        record(json!({
            "_id": "a1",
            "fechaNacimiento": "not-a-date",
            "inicioCurso": ""
        })),
        fixed_now(),
    );
    assert_eq!(out["fechaNacimiento"], Value::Null);
    assert_eq!(out["inicioCurso"], Value::Null);
}

#[test]
fn test_out_of_range_year_becomes_null() {
    assert_eq!(normalize_date(&json!("3000-01-01T00:00:00Z")), Value::Null);
    assert_eq!(normalize_date(&json!("1850-07-04")), Value::Null);
    assert_eq!(
        normalize_date(&json!("2100-12-31T23:59:59Z")),
        json!("2100-12-31T23:59:59.000Z")
    );
    assert_eq!(
        normalize_date(&json!("1900-01-01")),
        json!("1900-01-01T00:00:00.000Z")
    );
}

#[test]
fn test_valid_dates_are_canonical() {
    assert_eq!(
        normalize_date(&json!("2024-03-01T12:00:00Z")),
        json!("2024-03-01T12:00:00.000Z")
    );
    assert_eq!(
        normalize_date(&json!("2024-03-01T07:00:00-05:00")),
        json!("2024-03-01T12:00:00.000Z")
    );
    assert_eq!(
        normalize_date(&json!("2024-03-01 12:00:00")),
        json!("2024-03-01T12:00:00.000Z")
    );
    assert_eq!(
        normalize_date(&json!("2024-03-01")),
        json!("2024-03-01T00:00:00.000Z")
    );
}

#[test]
fn test_epoch_millis_and_wrapped_dates() {
    assert_eq!(
        normalize_date(&json!(1_709_294_400_000_i64)),
        json!("2024-03-01T12:00:00.000Z")
    );
    assert_eq!(
        normalize_date(&json!({"$date": "2024-03-01T12:00:00.250Z"})),
        json!("2024-03-01T12:00:00.250Z")
    );
}

#[test]
fn test_non_date_values_become_null() {
    assert_eq!(normalize_date(&json!(true)), Value::Null);
    assert_eq!(normalize_date(&json!(["2024-03-01"])), Value::Null);
    assert_eq!(normalize_date(&Value::Null), Value::Null);
}

#[test]
fn test_audit_timestamps_default_to_now() {
    let out = transformer().transform_at(record(json!({"_id": "a1"})), fixed_now());
    assert_eq!(out["_createdDate"], json!("2025-06-01T08:30:00.000Z"));
    assert_eq!(out["_updatedDate"], json!("2025-06-01T08:30:00.000Z"));
}

#[test]
fn test_audit_timestamps_kept_when_present() {
    let out = transformer().transform_at(
        record(json!({"_id": "a1", "_createdDate": "2023-01-10T10:00:00Z"})),
        fixed_now(),
    );
    assert_eq!(out["_createdDate"], json!("2023-01-10T10:00:00.000Z"));
    assert_eq!(out["_updatedDate"], json!("2025-06-01T08:30:00.000Z"));
}

#[test]
fn test_corrupt_audit_timestamp_falls_back_to_now() {
    let out = transformer().transform_at(
        record(json!({"_id": "a1", "_updatedDate": "garbage"})),
        fixed_now(),
    );
    assert_eq!(out["_updatedDate"], json!("2025-06-01T08:30:00.000Z"));
}

#[test]
fn test_undeclared_fields_are_not_date_normalized() {
    let out = transformer().transform_at(
        record(json!({"_id": "a1", "codigo": "2024-03-01"})),
        fixed_now(),
    );
    assert_eq!(out["codigo"], json!("2024-03-01"));
}

#[test]
fn test_object_id_is_unwrapped() {
    let out = transformer().transform_at(
        record(json!({"_id": {"$oid": "65f0c0ffee"}})),
        fixed_now(),
    );
    assert_eq!(out["_id"], json!("65f0c0ffee"));
}

#[test]
fn test_field_mappings_rename_before_other_rules() {
    let descriptor = CollectionDescriptor::new("B", "/b", "b", 10, 1)
        .with_mapping("eventoId", "idEvento")
        .with_mapping("cuando", "fechaEvento")
        .with_date_fields(&["fechaEvento"]);
    let transformer = Transformer::new(&descriptor, &MigrationOptions::default());

    let out = transformer.transform_at(
        record(json!({"_id": "b1", "eventoId": "e9", "cuando": "2024-05-05"})),
        fixed_now(),
    );

    assert!(!out.contains_key("eventoId"));
    assert_eq!(out["idEvento"], json!("e9"));
    assert_eq!(out["fechaEvento"], json!("2024-05-05T00:00:00.000Z"));
}

#[test]
fn test_transform_batch_preserves_order() {
    let out = transformer().transform_batch(vec![
        record(json!({"_id": "1"})),
        record(json!({"_id": "2"})),
        record(json!({"_id": "3"})),
    ]);
    let ids: Vec<&Value> = out.iter().map(|r| &r["_id"]).collect();
    assert_eq!(ids, vec![&json!("1"), &json!("2"), &json!("3")]);
}
