//! Invocation protocol tests for the plugin binary
//!
//! Only paths that never change the kernel are exercised here: VERSION, the
//! environment checks, and DEL for a container whose namespace is gone.

use assert_cmd::Command;
use predicates::prelude::*;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Plugin binary with a clean CNI environment.
fn plugin() -> Command {
    let mut cmd = Command::cargo_bin("macvlan").expect("Failed to find macvlan binary");
    for var in [
        "CNI_COMMAND",
        "CNI_CONTAINERID",
        "CNI_NETNS",
        "CNI_IFNAME",
        "CNI_ARGS",
        "CNI_PATH",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn error_document(output: &[u8]) -> serde_json::Value {
    serde_json::from_slice(output).expect("stdout should hold an error document")
}

#[test]
fn test_version_command() {
    let output = plugin().env("CNI_COMMAND", "VERSION").output().unwrap();
    assert!(output.status.success());

    let document: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(document["cniVersion"], "0.2.0");
    assert_eq!(
        document["supportedVersions"],
        serde_json::json!(["0.1.0", "0.2.0"])
    );
}

#[test]
fn test_version_flag_equivalent() {
    plugin()
        .args(["--command", "VERSION"])
        .assert()
        .success()
        .stdout(predicate::str::contains("supportedVersions"));
}

#[test]
fn test_missing_command_is_invalid_environment() {
    let output = plugin().write_stdin("{}").output().unwrap();
    assert_eq!(output.status.code(), Some(1));

    let document = error_document(&output.stdout);
    assert_eq!(document["code"], 4);
    assert_eq!(document["cniVersion"], "0.2.0");
}

#[test]
fn test_unknown_command() {
    let output = plugin().env("CNI_COMMAND", "CHECK").output().unwrap();
    assert_eq!(output.status.code(), Some(1));

    let document = error_document(&output.stdout);
    assert_eq!(document["code"], 4);
    assert!(document["msg"].as_str().unwrap().contains("CHECK"));
}

#[test]
fn test_add_without_netns_names_the_variable() {
    let output = plugin()
        .env("CNI_COMMAND", "ADD")
        .env("CNI_CONTAINERID", "c0ffee")
        .env("CNI_IFNAME", "eth1")
        .env("CNI_PATH", "/opt/cni/bin")
        .write_stdin(r#"{"cniVersion": "0.1.0", "master": "eth0"}"#)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let document = error_document(&output.stdout);
    assert_eq!(document["code"], 4);
    assert_eq!(document["cniVersion"], "0.1.0");
    assert!(document["msg"].as_str().unwrap().contains("CNI_NETNS"));
}

#[test]
fn test_logs_stay_off_stdout() {
    plugin()
        .env("CNI_COMMAND", "DEL")
        .env("RUST_LOG", "debug")
        .write_stdin("{}")
        .assert()
        .failure()
        .stdout(predicate::str::starts_with("{"))
        .stderr(predicate::str::contains("CNI_CONTAINERID"));
}

/// IPAM plugin that records its command and namespace, then succeeds.
const IPAM_STUB: &str = r#"#!/bin/sh
cat >/dev/null
echo "$CNI_COMMAND [$CNI_NETNS]" >> "$(dirname "$0")/calls"
"#;

fn install_ipam_stub(dir: &Path) {
    let script = dir.join("stub-ipam");
    std::fs::write(&script, IPAM_STUB).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[test]
fn test_del_with_empty_netns_releases_addresses() {
    let dir = tempfile::tempdir().unwrap();
    install_ipam_stub(dir.path());

    plugin()
        .env("CNI_COMMAND", "DEL")
        .env("CNI_CONTAINERID", "c0ffee")
        .env("CNI_NETNS", "")
        .env("CNI_IFNAME", "eth1")
        .env("CNI_ARGS", "")
        .env("CNI_PATH", dir.path())
        .write_stdin(r#"{"master": "eth0", "ipam": {"type": "stub-ipam"}}"#)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    let calls = std::fs::read_to_string(dir.path().join("calls")).unwrap();
    assert_eq!(calls, "DEL []\n");
}
