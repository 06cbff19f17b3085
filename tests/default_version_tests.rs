//! Default-version selection across creates, deletes and explicit requests

mod common;

use common::{files_registry, get, ok, send};
use serde_json::{json, Value};
use xregistry::Method;

const F1: &str = "/dirs/d1/files/f1";

fn default_of(reg: &xregistry::Registry) -> (Value, Value) {
    let meta = get(reg, &format!("{}/meta", F1));
    (meta["defaultversionid"].clone(), meta["defaultversionsticky"].clone())
}

fn defaults_in_versions(reg: &xregistry::Registry) -> Vec<String> {
    let versions = get(reg, &format!("{}/versions", F1));
    versions
        .as_object()
        .unwrap()
        .iter()
        .filter(|(_, v)| v["isdefault"] == true)
        .map(|(id, _)| id.clone())
        .collect()
}

fn with_versions(ids: &[&str]) -> xregistry::Registry {
    let reg = files_registry();
    for id in ids {
        ok(&reg, Method::Put, &format!("{}/versions/{}$structure", F1, id), json!({}));
    }
    reg
}

#[test]
fn test_newest_version_becomes_default() {
    let reg = with_versions(&["1", "2"]);
    assert_eq!(default_of(&reg), (json!("2"), json!(false)));
    assert_eq!(defaults_in_versions(&reg), vec!["2"]);

    let resource = get(&reg, &format!("{}$structure", F1));
    assert_eq!(resource["versionid"], "2");
    assert_eq!(resource["isdefault"], true);
    assert_eq!(resource["versionscount"], 2);
}

#[test]
fn test_sticky_default_survives_new_versions() {
    let reg = with_versions(&["1", "2"]);
    ok(&reg, Method::Patch, &format!("{}/meta", F1), json!({ "defaultversionid": "1", "defaultversionsticky": true }));
    ok(&reg, Method::Put, &format!("{}/versions/3$structure", F1), json!({}));

    assert_eq!(default_of(&reg), (json!("1"), json!(true)));
    assert_eq!(defaults_in_versions(&reg), vec!["1"]);
}

#[test]
fn test_delete_sticky_default_with_next() {
    let reg = with_versions(&["1", "2"]);
    ok(&reg, Method::Patch, &format!("{}/meta", F1), json!({ "defaultversionid": "1", "defaultversionsticky": true }));

    let response = send(&reg, Method::Delete, &format!("{}/versions/1?setdefaultversionid=2", F1), None);
    assert_eq!(response.status, 204, "{}", response.text());

    let resource = get(&reg, &format!("{}$structure", F1));
    assert_eq!(resource["versionid"], "2");
    assert_eq!(resource["isdefault"], true);
}

#[test]
fn test_delete_default_falls_back_to_newest() {
    let reg = with_versions(&["1", "2", "3"]);
    let response = send(&reg, Method::Delete, &format!("{}/versions/3", F1), None);
    assert_eq!(response.status, 204);
    assert_eq!(default_of(&reg), (json!("2"), json!(false)));
}

#[test]
fn test_next_default_cannot_be_deleted_version() {
    let reg = with_versions(&["1", "2"]);
    let response = send(&reg, Method::Delete, &format!("{}/versions/1?setdefaultversionid=1", F1), None);
    assert_eq!(response.status, 400);
    assert_eq!(response.text(), "Can't set defaultversionid to Version being deleted\n");
    assert_eq!(get(&reg, &format!("{}$structure", F1))["versionscount"], 2);
}

#[test]
fn test_setdefaultversionid_request_pins_written_version() {
    let reg = with_versions(&["1", "2"]);
    ok(&reg, Method::Patch, &format!("{}/versions/1$structure?setdefaultversionid=request", F1), json!({}));
    assert_eq!(default_of(&reg), (json!("1"), json!(true)));
}

#[test]
fn test_setdefaultversionid_null_unsticks() {
    let reg = with_versions(&["1", "2"]);
    ok(&reg, Method::Patch, &format!("{}/meta", F1), json!({ "defaultversionid": "1", "defaultversionsticky": true }));
    ok(&reg, Method::Patch, &format!("{}/meta", F1), json!({ "defaultversionsticky": false }));
    assert_eq!(default_of(&reg), (json!("2"), json!(false)));
}

#[test]
fn test_unknown_default_target() {
    let reg = with_versions(&["1"]);
    let response = send(&reg, Method::Patch, &format!("{}/meta", F1), Some(json!({ "defaultversionid": "9" })));
    assert_eq!(response.status, 400);
    assert_eq!(response.text(), "Version \"9\" not found\n");
    assert_eq!(default_of(&reg), (json!("1"), json!(false)));
}

#[test]
fn test_deleting_last_version_deletes_resource() {
    let reg = with_versions(&["1"]);
    let response = send(&reg, Method::Delete, &format!("{}/versions/1", F1), None);
    assert_eq!(response.status, 204);
    assert_eq!(send(&reg, Method::Get, &format!("{}$structure", F1), None).status, 404);
}

#[test]
fn test_maxversions_prunes_oldest_non_default() {
    let mut model = common::files_model(json!({}));
    model["groups"]["dirs"]["resources"]["files"]["maxversions"] = json!(2);
    let reg = common::registry_with(model);
    for id in ["1", "2"] {
        ok(&reg, Method::Put, &format!("{}/versions/{}$structure", F1, id), json!({}));
    }
    ok(&reg, Method::Patch, &format!("{}/meta", F1), json!({ "defaultversionid": "1", "defaultversionsticky": true }));
    ok(&reg, Method::Put, &format!("{}/versions/3$structure", F1), json!({}));

    let versions = get(&reg, &format!("{}/versions", F1));
    let mut ids: Vec<&String> = versions.as_object().unwrap().keys().collect();
    ids.sort();
    assert_eq!(ids, vec!["1", "3"]);
}

#[test]
fn test_sticky_forbidden_by_model() {
    let mut model = common::files_model(json!({}));
    model["groups"]["dirs"]["resources"]["files"]["setdefaultversionsticky"] = json!(false);
    let reg = common::registry_with(model);
    ok(&reg, Method::Put, &format!("{}/versions/1$structure", F1), json!({}));
    let response = send(&reg, Method::Put, &format!("{}/versions/2$structure?setdefaultversionid=1", F1), Some(json!({})));
    assert_eq!(response.status, 400);
    assert_eq!(send(&reg, Method::Get, &format!("{}/versions/2$structure", F1), None).status, 404);
}
