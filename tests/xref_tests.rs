//! Resources aliasing other Resources through `meta.xref`

mod common;

use common::{files_model, get, ok, send};
use rusqlite::Connection;
use serde_json::json;
use tempfile::TempDir;
use xregistry::{Method, Registry, RegistrySettings, SqliteStore};

const F1: &str = "/dirs/d1/files/f1";
const FX: &str = "/dirs/d1/files/fx";

fn seeded(reg: &Registry) {
    reg.set_model(&files_model(json!({}))).unwrap();
    ok(reg, Method::Put, &format!("{}$structure", F1), json!({ "name": "target" }));
    ok(reg, Method::Put, &format!("{}/versions/1$structure", FX), json!({ "name": "local one" }));
    ok(reg, Method::Put, &format!("{}/versions/2$structure", FX), json!({ "name": "local two" }));
}

fn sqlite_registry(dir: &TempDir) -> Registry {
    let store = SqliteStore::open(&dir.path().join("registry.db")).unwrap();
    Registry::new(Box::new(store), RegistrySettings::default()).unwrap()
}

fn version_rows(dir: &TempDir, resource: &str) -> i64 {
    let db = Connection::open(dir.path().join("registry.db")).unwrap();
    db.query_row(
        "SELECT COUNT(*) FROM entities WHERE parent = ?1 AND collection = 'versions'",
        [resource],
        |row| row.get(0),
    )
    .unwrap()
}

#[test]
fn test_setting_xref_removes_local_versions() {
    let dir = TempDir::new().unwrap();
    let reg = sqlite_registry(&dir);
    seeded(&reg);
    assert_eq!(version_rows(&dir, FX), 2);

    let response = send(&reg, Method::Put, &format!("{}/meta", FX), Some(json!({ "xref": F1 })));
    assert_eq!(response.status, 200, "{}", response.text());
    assert_eq!(version_rows(&dir, FX), 0);
    assert_eq!(version_rows(&dir, F1), 1);
}

#[test]
fn test_alias_reads_through_to_target() {
    let reg = Registry::in_memory().unwrap();
    seeded(&reg);
    ok(&reg, Method::Put, &format!("{}/meta", FX), json!({ "xref": F1 }));

    let resource = get(&reg, &format!("{}$structure", FX));
    assert_eq!(resource["fileid"], "fx");
    assert_eq!(resource["name"], "target");
    assert_eq!(resource["versionid"], "1");
    assert_eq!(resource["self"], format!("http://localhost:8080{}", FX));
    assert_eq!(resource["versionscount"], 1);

    let meta = get(&reg, &format!("{}/meta", FX));
    assert_eq!(meta["xref"], F1);
    assert_eq!(meta["defaultversionid"], "1");
    assert_eq!(meta["defaultversionurl"], format!("http://localhost:8080{}/versions/1", F1));
}

#[test]
fn test_versions_locked_while_aliased() {
    let reg = Registry::in_memory().unwrap();
    seeded(&reg);
    ok(&reg, Method::Put, &format!("{}/meta", FX), json!({ "xref": F1 }));

    let response = send(&reg, Method::Put, &format!("{}/versions/3$structure", FX), Some(json!({})));
    assert_eq!(response.status, 400);
    assert_eq!(response.text(), "Can't update \"versions\" if \"xref\" is set\n");

    let response = send(&reg, Method::Delete, &format!("{}/versions", FX), None);
    assert_eq!(response.text(), "Can't delete \"versions\" if \"xref\" is set\n");
}

#[test]
fn test_meta_extras_rejected_with_xref() {
    let reg = Registry::in_memory().unwrap();
    seeded(&reg);
    let response = send(
        &reg,
        Method::Put,
        &format!("{}/meta", FX),
        Some(json!({ "xref": F1, "defaultversionid": "1", "compatibility": "backward" })),
    );
    assert_eq!(response.status, 400);
    assert_eq!(
        response.text(),
        "Extra attributes (compatibility,defaultversionid) in \"meta\" not allowed when \"xref\" is set\n"
    );
    assert_eq!(get(&reg, &format!("{}$structure", FX))["versionscount"], 2);
}

#[test]
fn test_meta_read_back_can_be_written_again() {
    let reg = Registry::in_memory().unwrap();
    seeded(&reg);
    ok(&reg, Method::Put, &format!("{}/meta", FX), json!({ "xref": F1 }));

    let meta = get(&reg, &format!("{}/meta", FX));
    assert!(meta.get("createdat").is_some());
    assert_eq!(meta["defaultversionid"], "1");
    let written = ok(&reg, Method::Put, &format!("{}/meta", FX), meta);
    assert_eq!(written["xref"], F1);
    let meta = get(&reg, &format!("{}/meta", FX));
    ok(&reg, Method::Patch, &format!("{}/meta", FX), meta);

    let response = send(
        &reg,
        Method::Patch,
        &format!("{}/meta", FX),
        Some(json!({ "defaultversionid": "2" })),
    );
    assert_eq!(response.status, 400);
    assert_eq!(
        response.text(),
        "Extra attributes (defaultversionid) in \"meta\" not allowed when \"xref\" is set\n"
    );
}

#[test]
fn test_xref_must_target_same_type_and_not_self() {
    let reg = Registry::in_memory().unwrap();
    seeded(&reg);
    let response = send(&reg, Method::Put, &format!("{}/meta", FX), Some(json!({ "xref": FX })));
    assert_eq!(response.status, 400);
    assert_eq!(response.text(), format!("'xref' ({}) can't point to itself\n", FX));
}

#[test]
fn test_clearing_xref_snapshots_target_and_keeps_createdat() {
    let reg = Registry::in_memory().unwrap();
    seeded(&reg);
    let created = get(&reg, &format!("{}/meta", FX))["createdat"].clone();

    ok(&reg, Method::Put, &format!("{}/meta", FX), json!({ "xref": F1 }));
    ok(&reg, Method::Put, &format!("{}/meta", FX), json!({}));

    let meta = get(&reg, &format!("{}/meta", FX));
    assert!(meta.get("xref").is_none());
    assert_eq!(meta["createdat"], created);
    assert_eq!(meta["defaultversionid"], "1");

    let resource = get(&reg, &format!("{}$structure", FX));
    assert_eq!(resource["name"], "target");
    assert_eq!(resource["versionscount"], 1);
}

#[test]
fn test_alias_keeps_overlay_until_xref_cleared() {
    let reg = Registry::in_memory().unwrap();
    seeded(&reg);
    ok(&reg, Method::Put, &format!("{}/meta", FX), json!({ "xref": F1 }));
    ok(&reg, Method::Patch, &format!("{}$structure", FX), json!({ "name": "alias" }));
    assert_eq!(get(&reg, &format!("{}$structure", FX))["name"], "alias");
    assert_eq!(get(&reg, &format!("{}$structure", F1))["name"], "target");

    ok(&reg, Method::Put, &format!("{}/meta", FX), json!({}));
    assert_eq!(get(&reg, &format!("{}$structure", FX))["name"], "target");

    ok(&reg, Method::Patch, &format!("{}/versions/1$structure", FX), json!({ "name": "fresh" }));
    assert_eq!(get(&reg, &format!("{}$structure", FX))["name"], "fresh");
}

#[test]
fn test_alias_rejects_attributes_outside_overlay() {
    let reg = Registry::in_memory().unwrap();
    reg.set_model(&files_model(json!({ "mystr": { "type": "string" } }))).unwrap();
    ok(&reg, Method::Put, &format!("{}$structure", F1), json!({ "mystr": "t" }));
    ok(&reg, Method::Put, &format!("{}$structure", FX), json!({}));
    ok(&reg, Method::Put, &format!("{}/meta", FX), json!({ "xref": F1 }));

    let response = send(&reg, Method::Put, &format!("{}$structure", FX), Some(json!({ "mystr": "mine" })));
    assert_eq!(response.status, 400);
    assert_eq!(
        response.text(),
        "Extra attributes (mystr) in \"file\" not allowed when \"xref\" is set\n"
    );
    assert_eq!(get(&reg, &format!("{}$structure", FX))["mystr"], "t");

    let read_back = get(&reg, &format!("{}$structure", FX));
    ok(&reg, Method::Put, &format!("{}$structure", FX), read_back);
    ok(&reg, Method::Patch, &format!("{}$structure", FX), json!({ "description": "alias", "mystr": "t" }));
    assert_eq!(get(&reg, &format!("{}$structure", FX))["description"], "alias");
}
