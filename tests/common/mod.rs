//! Shared fixtures for the integration tests

#![allow(dead_code)]

use serde_json::{json, Value};
use xregistry::{dispatch, Method, Registry, Request, Response};

/// One Group type `dirs` holding one Resource type `files`
pub fn files_model(version_attrs: Value) -> Value {
    json!({
        "groups": {
            "dirs": {
                "plural": "dirs",
                "singular": "dir",
                "resources": {
                    "files": {
                        "plural": "files",
                        "singular": "file",
                        "attributes": version_attrs
                    }
                }
            }
        }
    })
}

pub fn registry_with(model: Value) -> Registry {
    let registry = Registry::in_memory().unwrap();
    registry.set_model(&model).unwrap();
    registry
}

pub fn files_registry() -> Registry {
    registry_with(files_model(json!({})))
}

pub fn send(registry: &Registry, method: Method, target: &str, body: Option<Value>) -> Response {
    let mut request = Request::parse(method, target);
    if let Some(body) = body {
        request = request.with_json(&body);
    }
    dispatch(registry, &request)
}

pub fn get(registry: &Registry, target: &str) -> Value {
    let response = send(registry, Method::Get, target, None);
    assert_eq!(response.status, 200, "GET {} failed: {}", target, response.text());
    response.json_body().unwrap()
}

/// Write and insist on success
pub fn ok(registry: &Registry, method: Method, target: &str, body: Value) -> Value {
    let response = send(registry, method, target, Some(body));
    assert!(
        response.status == 200 || response.status == 201,
        "{} {} failed with {}: {}",
        method,
        target,
        response.status,
        response.text()
    );
    response.json_body().unwrap()
}
