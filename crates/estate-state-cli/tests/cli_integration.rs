use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::{json, Value};

fn run_estate<I, S>(db: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_estate"))
        .arg("--db")
        .arg(db)
        .args(args)
        .env_remove("ESTATE_LEGACY_FILE")
        .env_remove("ESTATE_DB")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute estate binary: {err}"))
}

fn run_json<I, S>(db: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_estate(db, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "estate command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let value: Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
    assert_eq!(value.get("contract_version"), Some(&json!("cli.v1")));
    value
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"))
}

#[test]
fn fresh_database_reports_status_and_health() {
    let dir = temp_dir();
    let db = dir.path().join("state.sqlite3");

    let status = run_json(&db, ["db", "status"]);
    assert_eq!(as_str(&status, "migration_state"), "complete");
    assert_eq!(as_str(&status, "migration_outcome"), "nothing_to_migrate");
    assert_eq!(status.get("history_capacity"), Some(&json!(50)));

    let again = run_json(&db, ["db", "status"]);
    assert_eq!(as_str(&again, "migration_outcome"), "already_complete");

    let health = run_json(&db, ["db", "health"]);
    assert_eq!(health.get("ok"), Some(&json!(true)));
}

#[test]
fn customers_are_added_listed_audited_and_deleted() {
    let dir = temp_dir();
    let db = dir.path().join("state.sqlite3");

    let added = run_json(&db, ["customer", "add", "--name", "Ahmed", "--phone", "0100"]);
    let id = as_str(&added, "id").to_string();
    assert!(id.starts_with("C_"));

    let duplicate = run_estate(&db, ["customer", "add", "--name", "ahmed", "--phone", "0111"]);
    assert!(!duplicate.status.success());

    let listed = run_json(&db, ["customer", "list"]);
    let customers = as_array(&listed, "customers");
    assert_eq!(customers.len(), 1);
    assert_eq!(customers[0].get("phone"), Some(&json!("0100")));

    let audit = run_json(&db, ["audit", "list", "--text", "AHMED"]);
    assert_eq!(audit.get("count"), Some(&json!(1)));

    let deleted = run_json(&db, ["customer", "delete", "--id", id.as_str()]);
    assert_eq!(as_str(&deleted, "name"), "Ahmed");
    assert!(as_array(&run_json(&db, ["customer", "list"]), "customers").is_empty());

    let audit = run_json(&db, ["audit", "list"]);
    let entries = as_array(&audit, "entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(as_str(&entries[0], "description"), "Deleted customer Ahmed");

    let cleared = run_json(&db, ["audit", "clear"]);
    assert_eq!(cleared.get("removed"), Some(&json!(2)));
    assert_eq!(run_json(&db, ["audit", "list"]).get("count"), Some(&json!(0)));
}

#[test]
fn legacy_file_is_migrated_once() {
    let dir = temp_dir();
    let db = dir.path().join("state.sqlite3");
    let legacy = dir.path().join("legacy.json");
    let blob = json!({
        "settings": { "theme": "light", "font": 18 },
        "customers": [{ "id": "C1", "name": "Ahmed" }],
        "units": [{ "id": "U1", "name": "A-101", "code": "A-101", "price": "1,500" }]
    });
    fs::write(&legacy, blob.to_string())
        .unwrap_or_else(|err| panic!("failed to write legacy file: {err}"));

    let legacy_arg = legacy.to_string_lossy().to_string();
    let listed = run_json(&db, ["--legacy-file", legacy_arg.as_str(), "customer", "list"]);
    let customers = as_array(&listed, "customers");
    assert_eq!(customers, &vec![json!({ "id": "C1", "name": "Ahmed" })]);

    let units = run_json(&db, ["unit", "list"]);
    assert_eq!(as_array(&units, "units")[0].get("price"), Some(&json!(1500.0)));

    let settings = run_json(&db, ["settings", "show"]);
    assert_eq!(settings.pointer("/settings/theme"), Some(&json!("light")));
    assert_eq!(settings.pointer("/settings/fontSize"), Some(&json!(18)));

    fs::write(&legacy, json!({ "customers": [{ "id": "C9", "name": "Other" }] }).to_string())
        .unwrap_or_else(|err| panic!("failed to rewrite legacy file: {err}"));
    let listed = run_json(&db, ["--legacy-file", legacy_arg.as_str(), "customer", "list"]);
    assert_eq!(as_array(&listed, "customers").len(), 1);
    assert_eq!(as_str(&as_array(&listed, "customers")[0], "id"), "C1");
}

#[test]
fn export_and_import_round_trip() {
    let dir = temp_dir();
    let db = dir.path().join("state.sqlite3");
    let export = dir.path().join("backup.json");
    let export_arg = export.to_string_lossy().to_string();

    run_json(&db, ["unit", "add", "--name", "Tower A 101", "--code", "A-101"]);
    let exported = run_json(&db, ["db", "export", "--out", export_arg.as_str()]);
    assert_eq!(exported.get("records"), Some(&json!(2)));

    let other = dir.path().join("other.sqlite3");
    let imported = run_json(&other, ["db", "import", "--in", export_arg.as_str()]);
    assert_eq!(imported.get("imported_records"), Some(&json!(2)));

    let units = run_json(&other, ["unit", "list"]);
    assert_eq!(as_str(&as_array(&units, "units")[0], "code"), "A-101");

    let backup = dir.path().join("copy.sqlite3");
    let backup_arg = backup.to_string_lossy().to_string();
    run_json(&db, ["db", "backup", "--out", backup_arg.as_str()]);
    let restored = run_json(&backup, ["unit", "list"]);
    assert_eq!(as_array(&restored, "units").len(), 1);
}

#[test]
fn settings_password_lock_and_unlock() {
    let dir = temp_dir();
    let db = dir.path().join("state.sqlite3");

    let set = run_json(&db, ["settings", "set", "--theme", "light", "--font-size", "20"]);
    assert_eq!(set.pointer("/settings/fontSize"), Some(&json!(20)));

    let password = run_json(&db, ["settings", "password", "--value", "1234"]);
    assert_eq!(password.get("password_set"), Some(&json!(true)));
    let hash = password
        .pointer("/settings/passwordHash")
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("password hash missing: {password}"));
    assert_eq!(hash.len(), 64);
    assert_ne!(hash, "1234");

    let locked = run_json(&db, ["settings", "lock"]);
    assert_eq!(locked.get("locked"), Some(&json!(true)));

    let cleared = run_estate(&db, ["settings", "password"]);
    assert!(!cleared.status.success());
    let shown = run_json(&db, ["settings", "show"]);
    assert_eq!(shown.get("password_set"), Some(&json!(true)));
    assert_eq!(shown.get("locked"), Some(&json!(true)));

    let wrong = run_estate(&db, ["settings", "unlock", "--password", "0000"]);
    assert!(!wrong.status.success());

    let unlocked = run_json(&db, ["settings", "unlock", "--password", "1234"]);
    assert_eq!(unlocked.get("locked"), Some(&json!(false)));
}
