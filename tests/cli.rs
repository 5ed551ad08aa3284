use assert_cmd::Command;
use predicates::prelude::*;

fn lobsterd() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("lobsterd").unwrap()
}

/// Point the CLI at a scratch config dir so tests never touch /etc.
fn lobsterd_in(dir: &std::path::Path) -> Command {
    let mut cmd = lobsterd();
    cmd.env("LOBSTERD_CONFIG_DIR", dir);
    cmd
}

#[test]
fn test_help_exits_successfully() {
    lobsterd().arg("--help").assert().success();
}

#[test]
fn test_version_mentions_binary_name() {
    lobsterd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("lobsterd"));
}

#[test]
fn test_no_args_shows_usage() {
    lobsterd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_subcommand_fails() {
    lobsterd()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_help_lists_all_subcommands() {
    let assert = lobsterd().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for cmd in [
        "init", "spawn", "evict", "molt", "list", "snap", "watch", "tank", "logs", "exec",
    ] {
        assert!(
            output.contains(cmd),
            "help output should list {:?} subcommand",
            cmd
        );
    }
}

#[test]
fn test_spawn_rejects_invalid_name() {
    let dir = tempfile::tempdir().unwrap();
    lobsterd_in(dir.path())
        .args(["spawn", "Not-A-Label"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("lowercase"));
}

#[test]
fn test_spawn_invalid_name_json_error_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let assert = lobsterd_in(dir.path())
        .args(["spawn", "Not-A-Label", "--json"])
        .assert()
        .failure();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let v: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(v["error"]["code"], "ValidationFailed");
    assert!(v["error"]["message"].as_str().unwrap().contains("tenant name"));
}

#[test]
fn test_list_empty_registry() {
    let dir = tempfile::tempdir().unwrap();
    lobsterd_in(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("no tenants"));
}

#[test]
fn test_list_json_empty_registry_has_allocators() {
    let dir = tempfile::tempdir().unwrap();
    let assert = lobsterd_in(dir.path())
        .args(["list", "--json"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let v: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(v["tenants"], serde_json::json!([]));
    assert_eq!(v["nextUid"], 10000);
    assert_eq!(v["nextGatewayPort"], 9000);
}

#[test]
fn test_molt_unknown_tenant_fails() {
    let dir = tempfile::tempdir().unwrap();
    lobsterd_in(dir.path())
        .args(["molt", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tenant not found"));
}

#[test]
fn test_evict_aborts_without_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    lobsterd_in(dir.path())
        .args(["evict", "alice"])
        .write_stdin("n\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("aborted"));
}

#[test]
fn test_evict_unknown_tenant_with_yes_fails() {
    let dir = tempfile::tempdir().unwrap();
    lobsterd_in(dir.path())
        .args(["evict", "ghost", "-y"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tenant not found"));
}

#[test]
fn test_snap_unknown_tenant_fails() {
    let dir = tempfile::tempdir().unwrap();
    lobsterd_in(dir.path())
        .args(["snap", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tenant not found"));
}

#[test]
fn test_tank_empty_fleet() {
    let dir = tempfile::tempdir().unwrap();
    lobsterd_in(dir.path())
        .arg("tank")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 tenants"));
}

#[test]
fn test_init_help_mentions_proxy() {
    lobsterd()
        .args(["init", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("proxy"));
}
