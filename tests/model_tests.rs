//! Model installation, verification and rendering

mod common;

use common::{files_model, get, ok, registry_with, send};
use jsonschema::JSONSchema;
use serde_json::json;
use tempfile::TempDir;
use xregistry::model::join_path;
use xregistry::{Method, Registry, RegistrySettings, SqliteStore};

#[test]
fn test_ifvalues_sibling_clashes_with_document_attribute() {
    let reg = Registry::in_memory().unwrap();
    let model = files_model(json!({
        "mystring": {
            "type": "string",
            "ifvalues": { "foo": { "siblingattributes": { "file": { "type": "string" } } } }
        }
    }));

    let response = send(&reg, Method::Put, "/model", Some(model));
    assert_eq!(response.status, 400);
    assert_eq!(
        response.text(),
        "Duplicate attribute name (file) at: resources.files.mystring.ifvalues.foo\n"
    );
    assert!(reg.model().groups.is_empty());
}

#[test]
fn test_enum_values_must_match_attribute_type() {
    let reg = Registry::in_memory().unwrap();
    let model = files_model(json!({ "mycount": { "type": "integer", "enum": ["a", "b"] } }));

    let response = send(&reg, Method::Put, "/model", Some(model));
    assert_eq!(response.status, 400);
    assert_eq!(
        response.text(),
        "Model attribute \"resources.files.mycount\" has an \"enum\" value (a) that isn't an integer\n"
    );
    assert!(reg.model().groups.is_empty());

    ok(&reg, Method::Put, "/model", files_model(json!({ "mycount": { "type": "integer", "enum": [1, 2] } })));
}

#[test]
fn test_attribute_paths_join_with_dots() {
    assert_eq!(join_path("", "mystr"), "mystr");
    assert_eq!(join_path("resources.files", "mystr"), "resources.files.mystr");
}

#[test]
fn test_model_round_trips_through_get() {
    let reg = Registry::in_memory().unwrap();
    ok(&reg, Method::Put, "/model", files_model(json!({ "mystr": { "type": "string" } })));

    let model = get(&reg, "/model");
    assert_eq!(model["groups"]["dirs"]["singular"], "dir");
    assert_eq!(model["groups"]["dirs"]["resources"]["files"]["attributes"]["mystr"]["type"], "string");
    assert!(model["attributes"]["epoch"].is_object());
}

#[test]
fn test_model_change_revalidates_stored_entities() {
    let mut model = files_model(json!({}));
    model["attributes"] = json!({ "owner": { "type": "string" } });
    let reg = registry_with(model);
    ok(&reg, Method::Put, "/", json!({ "owner": "ops" }));

    let response = send(&reg, Method::Put, "/model", Some(files_model(json!({}))));
    assert_eq!(response.status, 400);
    assert_eq!(response.text(), "Invalid extension(s): owner\n");
    assert!(get(&reg, "/model")["attributes"]["owner"].is_object());
}

#[test]
fn test_unknown_schema_format() {
    let reg = registry_with(files_model(json!({})));
    let response = send(&reg, Method::Get, "/model?schema=openapi", None);
    assert_eq!(response.status, 400);
    assert_eq!(response.text(), "Unsupported schema format: openapi\n");
}

#[test]
fn test_json_schema_export_compiles() {
    let reg = registry_with(files_model(json!({ "size": { "type": "uinteger" } })));
    let schema = get(&reg, "/model?schema=jsonschema");
    assert_eq!(schema["$schema"], "http://json-schema.org/draft-07/schema#");
    assert!(schema["definitions"]["dirs_files"].is_object());

    let compiled = JSONSchema::compile(&schema).unwrap();
    assert!(!compiled.is_valid(&json!({ "dirs": { "d1": { "name": 5 } } })));
    assert!(!compiled.is_valid(&json!({
        "dirs": { "d1": { "files": { "f1": { "versions": { "1": { "size": -1 } } } } } }
    })));
}

#[test]
fn test_unknown_types_are_not_found() {
    let reg = registry_with(files_model(json!({})));
    let response = send(&reg, Method::Get, "/folders", None);
    assert_eq!(response.status, 404);
    assert_eq!(response.text(), "Unknown Group type: folders\n");

    let response = send(&reg, Method::Get, "/dirs/d1/blobs", None);
    assert_eq!(response.status, 404);
}

#[test]
fn test_model_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("registry.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        let reg = Registry::new(Box::new(store), RegistrySettings::default()).unwrap();
        reg.set_model(&files_model(json!({}))).unwrap();
        ok(&reg, Method::Put, "/dirs/d1", json!({ "name": "kept" }));
    }

    let store = SqliteStore::open(&path).unwrap();
    let reg = Registry::new(Box::new(store), RegistrySettings::default()).unwrap();
    assert!(reg.model().group("dirs").is_some());
    assert_eq!(get(&reg, "/dirs/d1")["name"], "kept");
}
