//! Integration tests for the bastion binary

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use assert_cmd::Command;
use bastion_core::{GrantEdge, IdentityId, PlatformSnapshot, RoleName};
use bastion_credential::{CredentialStore, InMemoryCredentialStore};
use predicates::prelude::*;
use tempfile::TempDir;

const PASSPHRASE: &str = "cli test passphrase";

const SCENARIO_A: &str = r"
roles:
  - name: ADMIN
    kind: admin
  - name: DB_RO
    kind: access
    database: BRONZE
    level: RO
  - name: DB_RW
    kind: access
    database: BRONZE
    level: RW
  - name: ANALYST
    kind: functional
    grants: [DB_RO]
";

const FAST_POLICY: &str = r"
key_bits: 2048
pbkdf2_iterations: 1000
max_test_attempts: 3
retry:
  initial_backoff: 1ms
  max_backoff: 10ms
";

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let ws = Self {
            dir: TempDir::new().unwrap(),
        };
        ws.write("roles.yaml", SCENARIO_A);
        ws.write("policy.yaml", FAST_POLICY);
        ws
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, text: &str) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, text).unwrap();
        path
    }

    fn state(&self) -> PathBuf {
        self.path("state.json")
    }

    /// `bastion` running in the workspace against its state file.
    fn bastion(&self) -> Command {
        let mut cmd = Command::cargo_bin("bastion").unwrap();
        cmd.current_dir(self.dir.path())
            .env_remove("BASTION_CONFIG")
            .env_remove("BASTION_KEY_PASSPHRASE")
            .env("NO_COLOR", "1")
            .arg("--state")
            .arg(self.state());
        cmd
    }

    fn rotation(&self, command: &str, identity: &str) -> Command {
        let mut cmd = self.bastion();
        cmd.env("BASTION_KEY_PASSPHRASE", PASSPHRASE)
            .arg(command)
            .arg(identity)
            .arg("--policy")
            .arg(self.path("policy.yaml"));
        cmd
    }
}

fn write_state(path: &Path, platform: &PlatformSnapshot, store: &InMemoryCredentialStore) {
    let state = serde_json::json!({
        "platform": platform,
        "credentials": store.snapshot(),
    });
    fs::write(path, serde_json::to_string_pretty(&state).unwrap()).unwrap();
}

// ---------------------------------------------------------------------------
// Surface
// ---------------------------------------------------------------------------

#[test]
fn help_lists_every_command() {
    Command::cargo_bin("bastion")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("reconcile-roles"))
        .stdout(predicate::str::contains("rotate"))
        .stdout(predicate::str::contains("ack-rollback"))
        .stdout(predicate::str::contains("purge-previous"));
}

#[test]
fn version_names_the_binary() {
    Command::cargo_bin("bastion")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bastion"));
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

#[test]
fn validate_summarises_a_valid_specification() {
    let ws = Workspace::new();
    ws.bastion()
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("4 roles, 3 grant edges"));
}

#[test]
fn validate_rejects_unknown_roles_with_exit_code_one() {
    let ws = Workspace::new();
    let roles = ws.write(
        "bad.yaml",
        "roles:\n  - name: ADMIN\n    kind: admin\n  - name: ANALYST\n    kind: functional\n    grants: [NOPE]\n",
    );
    ws.bastion()
        .arg("validate")
        .arg("--roles")
        .arg(roles)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown role NOPE"));
}

#[test]
fn missing_role_file_is_a_validation_failure() {
    let ws = Workspace::new();
    ws.bastion()
        .arg("validate")
        .arg("--roles")
        .arg(ws.path("absent.yaml"))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("absent.yaml"));
}

#[test]
fn settings_file_supplies_the_roles_path() {
    let ws = Workspace::new();
    fs::create_dir(ws.path("specs")).unwrap();
    fs::copy(ws.path("roles.yaml"), ws.path("specs/team.yaml")).unwrap();
    ws.write("bastion.toml", "roles_file = \"specs/team.yaml\"\n");

    ws.bastion()
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("specs/team.yaml"));
}

// ---------------------------------------------------------------------------
// reconcile-roles
// ---------------------------------------------------------------------------

#[test]
fn dry_run_prints_the_diff_and_writes_nothing() {
    let ws = Workspace::new();
    ws.bastion()
        .args(["reconcile-roles", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("+ role  ADMIN"))
        .stdout(predicate::str::contains("+ grant DB_RO -> ANALYST"))
        .stdout(predicate::str::contains("dry run"));

    assert!(!ws.state().exists());
}

#[test]
fn second_reconcile_changes_nothing() {
    let ws = Workspace::new();
    ws.bastion()
        .arg("reconcile-roles")
        .assert()
        .success()
        .stdout(predicate::str::contains("applied 7, failed 0, skipped 0"));
    assert!(ws.state().exists());

    ws.bastion()
        .arg("reconcile-roles")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "0 roles to create, 0 grants to create, 0 grants to revoke, 3 unchanged",
        ));
}

#[test]
fn automation_role_keeps_the_grants_it_depends_on() {
    let ws = Workspace::new();
    let role = |name: &str| RoleName::new(name).unwrap();
    let lifeline = GrantEdge::role(role("DB_RW"), role("DEPLOYER"));
    let mut platform = PlatformSnapshot::default();
    platform.roles.extend([role("DB_RW"), role("DEPLOYER")]);
    platform.grants.insert(lifeline.clone());
    write_state(&ws.state(), &platform, &InMemoryCredentialStore::new());

    ws.bastion()
        .args(["reconcile-roles", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("- grant DB_RW -> DEPLOYER"));

    ws.bastion()
        .args(["reconcile-roles", "--automation-role", "deployer"])
        .assert()
        .success()
        .stdout(predicate::str::contains("! keep  DB_RW -> DEPLOYER"))
        .stdout(predicate::str::contains("- grant").not());

    let state: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(ws.state()).unwrap()).unwrap();
    let after: PlatformSnapshot = serde_json::from_value(state["platform"].clone()).unwrap();
    assert!(after.grants.contains(&lifeline));
}

// ---------------------------------------------------------------------------
// Rotation
// ---------------------------------------------------------------------------

#[test]
fn bootstrap_rotate_and_purge() {
    let ws = Workspace::new();

    ws.rotation("bootstrap", "SVC_X")
        .assert()
        .success()
        .stdout(predicate::str::contains("SVC_X: bootstrapped"));
    ws.rotation("rotate", "SVC_X")
        .assert()
        .success()
        .stdout(predicate::str::contains("SVC_X: rotated"));
    ws.bastion()
        .args(["status", "SVC_X"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"STABLE\""));
    ws.rotation("purge-previous", "SVC_X")
        .assert()
        .success()
        .stdout(predicate::str::contains("purged 1"));
}

#[test]
fn rotate_without_passphrase_exits_one() {
    let ws = Workspace::new();
    ws.bastion()
        .args(["rotate", "SVC_X"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("BASTION_KEY_PASSPHRASE"));
}

#[test]
fn rotate_before_bootstrap_exits_four() {
    let ws = Workspace::new();
    ws.rotation("rotate", "SVC_X")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("bootstrap it first"));
}

#[tokio::test]
async fn held_lease_exits_three() {
    let ws = Workspace::new();
    let identity = IdentityId::new("SVC_X").unwrap();
    let store = InMemoryCredentialStore::new();
    assert!(
        store
            .acquire_lease(&identity, "other-host", Duration::from_secs(3600))
            .await
            .unwrap()
    );
    let mut platform = PlatformSnapshot::default();
    platform.identities.insert(identity, Default::default());
    write_state(&ws.state(), &platform, &store);

    ws.rotation("rotate", "SVC_X")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("other-host"));
}
