#![allow(deprecated)] // cargo_bin is deprecated but still functional

use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use twinstore_core::ContentHash;

/// Two filesystem replicas, "east" and "west", under one temp dir.
struct Fixture {
    temp: TempDir,
    config_path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let east = temp.path().join("east");
        let west = temp.path().join("west");
        fs::create_dir_all(&east).unwrap();
        fs::create_dir_all(&west).unwrap();

        let config_path = temp.path().join("twinstore.toml");
        fs::write(
            &config_path,
            format!(
                r#"
[[replicas]]
name = "east"
storage = {{ type = "filesystem", path = "{}" }}

[[replicas]]
name = "west"
storage = {{ type = "filesystem", path = "{}" }}

[metadata]
path = "{}"
"#,
                east.display(),
                west.display(),
                temp.path().join("twinstore.db").display()
            ),
        )
        .unwrap();

        Self { temp, config_path }
    }

    fn twinctl(&self) -> Command {
        let mut cmd = Command::cargo_bin("twinctl").unwrap();
        cmd.arg("--config").arg(&self.config_path);
        cmd
    }

    /// Write a blob straight into a replica's directory; returns its hash.
    fn write_blob(&self, replica: &str, data: &[u8]) -> String {
        let hash = ContentHash::compute(data).to_hex();
        let path = self.replica_root(replica).join("blobs").join(&hash);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
        hash
    }

    fn replica_root(&self, replica: &str) -> PathBuf {
        self.temp.path().join(replica)
    }
}

#[test]
fn verify_empty_replica_is_clean() {
    let fx = Fixture::new();

    fx.twinctl()
        .args(["verify", "--kind", "blob"])
        .assert()
        .success()
        .stdout(contains("Verified: 0"))
        .stdout(contains("Mismatches: none"));
}

#[test]
fn verify_reports_missing_then_advances_checkpoint() {
    let fx = Fixture::new();
    let hash = fx.write_blob("east", b"replicated payload");

    fx.twinctl()
        .args(["verify", "--kind", "blob"])
        .assert()
        .code(1)
        .stdout(contains("Verified: 1"))
        .stdout(contains("missing"))
        .stdout(contains(hash.as_str()))
        .stdout(contains("Checkpoint unchanged"));

    fx.twinctl()
        .args(["checkpoint", "show"])
        .assert()
        .success()
        .stdout(contains("No checkpoints recorded."));

    fx.write_blob("west", b"replicated payload");

    fx.twinctl()
        .args(["verify", "--kind", "blob"])
        .assert()
        .success()
        .stdout(contains("Mismatches: none"))
        .stdout(contains("Checkpoint advanced to"));

    fx.twinctl()
        .args(["checkpoint", "show"])
        .assert()
        .success()
        .stdout(contains("blob"));
}

#[test]
fn verify_detects_differing_content() {
    let fx = Fixture::new();
    let hash = fx.write_blob("east", b"original bytes");
    // Same key on west, different content.
    fs::create_dir_all(fx.replica_root("west").join("blobs")).unwrap();
    fs::write(
        fx.replica_root("west").join("blobs").join(&hash),
        b"tampered bytes",
    )
    .unwrap();

    fx.twinctl()
        .args(["verify", "--kind", "blob", "--dry-run"])
        .assert()
        .code(1)
        .stdout(contains("hash differs"))
        .stdout(contains("Checkpoint unchanged (dry run)"));
}

#[test]
fn verify_json_dry_run_leaves_checkpoint() {
    let fx = Fixture::new();
    fx.write_blob("east", b"both sides");
    fx.write_blob("west", b"both sides");

    let output = fx
        .twinctl()
        .args(["verify", "--kind", "blob", "--dry-run", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("\"checkpoint_advanced\": false"));
    assert!(stdout.contains("\"verified\": 1"));

    fx.twinctl()
        .args(["checkpoint", "show"])
        .assert()
        .success()
        .stdout(contains("No checkpoints recorded."));
}

#[test]
fn verify_from_other_source() {
    let fx = Fixture::new();
    fx.write_blob("west", b"only on west");

    fx.twinctl()
        .args(["verify", "--kind", "blob", "--source", "west"])
        .assert()
        .code(1)
        .stdout(contains("Source: west"));

    fx.twinctl()
        .args(["verify", "--kind", "blob", "--source", "nowhere"])
        .assert()
        .code(2)
        .stderr(contains("unknown replica"));
}

#[test]
fn verify_since_excludes_older_objects() {
    let fx = Fixture::new();
    fx.write_blob("east", b"old object");

    fx.twinctl()
        .args(["verify", "--kind", "blob", "--since", "2999-01-01T00:00:00Z"])
        .assert()
        .success()
        .stdout(contains("Verified: 0"));
}

#[test]
fn missing_config_is_an_error() {
    let temp = TempDir::new().unwrap();
    let missing: &Path = &temp.path().join("absent.toml");

    Command::cargo_bin("twinctl")
        .unwrap()
        .arg("--config")
        .arg(missing)
        .args(["checkpoint", "show"])
        .assert()
        .code(2)
        .stderr(contains("config file not found"));
}

#[test]
fn submit_fans_out_to_other_replicas() {
    let fx = Fixture::new();
    let hash = fx.write_blob("east", b"submit me");

    fx.twinctl()
        .args(["submit", "--kind", "blob", "--key", hash.as_str()])
        .assert()
        .success()
        .stdout(contains("Queued east -> west"));

    fx.twinctl()
        .args([
            "submit", "--kind", "blob", "--key", hash.as_str(), "--source", "west", "--dest",
            "east",
        ])
        .assert()
        .success()
        .stdout(contains("Queued west -> east"));
}

#[test]
fn submit_rejects_invalid_key() {
    let fx = Fixture::new();

    fx.twinctl()
        .args(["submit", "--kind", "blob", "--key", "not-a-hash"])
        .assert()
        .code(2)
        .stderr(contains("invalid object key"));
}

#[test]
fn dead_letter_commands_on_empty_store() {
    let fx = Fixture::new();

    fx.twinctl()
        .args(["dead-letter", "list"])
        .assert()
        .success()
        .stdout(contains("No dead letters found."));

    fx.twinctl()
        .args([
            "dead-letter",
            "redrive",
            "00000000-0000-0000-0000-000000000001",
        ])
        .assert()
        .code(2)
        .stderr(contains("dead letter not found"));
}
