use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;

/// Compile a schema stored under `tests/schemas/{name}.json`
pub fn load_test_schema(schema_name: &str) -> JSONSchema {
    let path: PathBuf = [
        env!("CARGO_MANIFEST_DIR"),
        "tests",
        "schemas",
        &format!("{}.json", schema_name),
    ]
    .iter()
    .collect();

    let content = fs::read_to_string(&path)
        .unwrap_or_else(|_| panic!("Failed to read schema file: {}", path.display()));
    let schema: Value = serde_json::from_str(&content)
        .unwrap_or_else(|_| panic!("Failed to parse schema JSON: {}", path.display()));

    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .expect("Failed to compile schema")
}

/// Validate a JSON value against a schema
pub fn validate_against_schema(data: &Value, schema: &JSONSchema) -> Result<(), Vec<String>> {
    schema.validate(data).map_err(|errors| {
        errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect()
    })
}

/// Panic with every violation and the offending document
pub fn assert_matches_schema(data: &Value, schema_name: &str) {
    let schema = load_test_schema(schema_name);
    if let Err(errors) = validate_against_schema(data, &schema) {
        panic!(
            "{} schema validation failed:\n  - {}\n\nActual:\n{}",
            schema_name,
            errors.join("\n  - "),
            serde_json::to_string_pretty(data).unwrap()
        );
    }
}
