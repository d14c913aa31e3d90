#![allow(clippy::single_match_else)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use ulid::Ulid;

const START_OF_DAY: &str = "2026-03-02T09:00:00Z";
const TWO_DAYS_LATER: &str = "2026-03-04T09:00:00Z";

fn apf_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_apf") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/apf");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "approval-flow-cli", "--bin", "apf"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build apf binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures").join(name)
}

struct Workspace {
    db: PathBuf,
}

impl Workspace {
    fn new(label: &str) -> Self {
        let db = std::env::temp_dir().join(format!("apf-contract-{label}-{}.sqlite3", Ulid::new()));
        Self { db }
    }

    fn run_at(&self, now: &str, args: &[&str]) -> Output {
        let mut command = Command::new(apf_binary_path());
        command
            .arg("--db")
            .arg(&self.db)
            .arg("--entities")
            .arg(fixture("entities.json"))
            .arg("--directory")
            .arg(fixture("directory.json"))
            .arg("--now")
            .arg(now)
            .args(args);
        match command.output() {
            Ok(output) => output,
            Err(err) => panic!("failed to run apf {args:?}: {err}"),
        }
    }

    fn run(&self, args: &[&str]) -> Output {
        self.run_at(START_OF_DAY, args)
    }

    fn ok(&self, args: &[&str]) -> Value {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "apf {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        stdout_json(&output)
    }

    fn register_standard(&self) {
        let file = fixture("purchase_order.yaml");
        let registered = self.ok(&["definition", "register", "--file", path_str(&file)]);
        assert_eq!(registered["created"], Value::Bool(true));
    }

    fn start(&self, entity_id: &str) -> String {
        let started = self.ok(&[
            "instance",
            "start",
            "--entity-type",
            "purchase_order",
            "--entity-id",
            entity_id,
            "--requester",
            "rita",
        ]);
        match started["instance"]["id"].as_str() {
            Some(id) => id.to_string(),
            None => panic!("start output has no instance id: {started}"),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db);
    }
}

fn path_str(path: &Path) -> &str {
    match path.to_str() {
        Some(value) => value,
        None => panic!("fixture path is not UTF-8: {}", path.display()),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn stderr_envelope(output: &Output) -> Value {
    assert!(!output.status.success(), "command unexpectedly succeeded");
    let stderr = String::from_utf8_lossy(&output.stderr);
    let line = stderr
        .lines()
        .rev()
        .find(|line| line.starts_with("{\"error\""))
        .unwrap_or_else(|| panic!("no error envelope on stderr: {stderr}"));
    match serde_json::from_str::<Value>(line) {
        Ok(value) => value["error"].clone(),
        Err(err) => panic!("error envelope is not JSON: {err}\n{line}"),
    }
}

#[test]
fn help_lists_every_command_group() {
    let output = match Command::new(apf_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["definition", "instance", "inbox", "history", "sweep"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain {required}; output={stdout}"
        );
    }
}

#[test]
fn validate_reports_cycle_and_fails_with_invalid_definition() {
    let workspace = Workspace::new("validate");
    let file = fixture("cyclic.yaml");
    let output = workspace.run(&["definition", "validate", "--file", path_str(&file)]);

    let report = stdout_json(&output);
    assert_eq!(report["valid"], Value::Bool(false));
    let codes = report["errors"]
        .as_array()
        .map(|errors| {
            errors
                .iter()
                .filter_map(|issue| issue["code"].as_str())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    assert!(codes.contains(&"cycle"), "errors: {codes:?}");

    let error = stderr_envelope(&output);
    assert_eq!(error["code"], "invalid_definition");
    assert_eq!(error["category"], "configuration");
    assert_eq!(error["retriable"], Value::Bool(false));
}

#[test]
fn mid_sized_order_is_approved_by_the_requesters_manager() {
    let workspace = Workspace::new("manager");
    workspace.register_standard();
    let id = workspace.start("po-mid");

    let inbox = workspace.ok(&["inbox", "--identity", "mark"]);
    assert_eq!(inbox.as_array().map(Vec::len), Some(1));
    assert_eq!(inbox[0]["id"], Value::String(id.clone()));

    let approved = workspace.ok(&["instance", "approve", "--instance-id", &id, "--actor", "mark"]);
    assert_eq!(approved["instance"]["state"], "approved");
    assert_eq!(approved["replayed"], Value::Bool(false));

    let inbox = workspace.ok(&["inbox", "--identity", "mark"]);
    assert_eq!(inbox.as_array().map(Vec::len), Some(0));

    let history = workspace.ok(&["history", "--state", "approved"]);
    assert_eq!(history["total"], 1);
    assert_eq!(history["items"][0]["id"], Value::String(id.clone()));

    let audit = workspace.ok(&["instance", "audit", "--instance-id", &id]);
    assert_eq!(audit["consistent"], Value::Bool(true));

    let events = workspace.ok(&["instance", "events", "--instance-id", &id]);
    let actions = events
        .as_array()
        .map(|events| {
            events
                .iter()
                .filter_map(|event| event["action"].as_str())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    assert_eq!(actions, vec!["start", "approve", "advance"]);
}

#[test]
fn small_order_is_approved_without_any_step() {
    let workspace = Workspace::new("direct");
    workspace.register_standard();
    let id = workspace.start("po-small");

    let view = workspace.ok(&["instance", "show", "--instance-id", &id]);
    assert_eq!(view["instance"]["state"], "approved");
    assert_eq!(view["instance"]["current_step_id"], Value::Null);
}

#[test]
fn finance_majority_rejects_once_quorum_is_out_of_reach() {
    let workspace = Workspace::new("finance");
    workspace.register_standard();
    let id = workspace.start("po-large");
    workspace.ok(&["instance", "approve", "--instance-id", &id, "--actor", "mark"]);

    let view = workspace.ok(&["instance", "show", "--instance-id", &id]);
    assert_eq!(view["instance"]["current_step_id"], "finance");
    assert_eq!(view["quorum"], 2);
    for member in ["bob", "carol", "dave"] {
        let inbox = workspace.ok(&["inbox", "--identity", member]);
        assert_eq!(inbox.as_array().map(Vec::len), Some(1), "inbox of {member}");
    }

    let first = workspace.ok(&[
        "instance",
        "reject",
        "--instance-id",
        &id,
        "--actor",
        "bob",
        "--comment",
        "over budget",
    ]);
    assert_eq!(first["instance"]["state"], "in_progress");

    let second = workspace.ok(&["instance", "reject", "--instance-id", &id, "--actor", "carol"]);
    assert_eq!(second["instance"]["state"], "rejected");

    let late = workspace.run(&["instance", "approve", "--instance-id", &id, "--actor", "dave"]);
    let error = stderr_envelope(&late);
    assert_eq!(error["code"], "not_in_progress");
    assert_eq!(error["category"], "request");
}

#[test]
fn second_start_for_same_entity_is_refused() {
    let workspace = Workspace::new("duplicate");
    workspace.register_standard();
    workspace.start("po-mid");

    let output = workspace.run(&[
        "instance",
        "start",
        "--entity-type",
        "purchase_order",
        "--entity-id",
        "po-mid",
        "--requester",
        "rita",
    ]);
    let error = stderr_envelope(&output);
    assert_eq!(error["code"], "duplicate_in_flight");
    assert_eq!(error["category"], "request");
}

#[test]
fn outsider_cannot_act_on_an_instance() {
    let workspace = Workspace::new("outsider");
    workspace.register_standard();
    let id = workspace.start("po-mid");

    let output = workspace.run(&["instance", "approve", "--instance-id", &id, "--actor", "mallory"]);
    let error = stderr_envelope(&output);
    assert_eq!(error["code"], "not_an_approver");

    let events = workspace.ok(&["instance", "events", "--instance-id", &id]);
    assert_eq!(events.as_array().map(Vec::len), Some(1));
}

#[test]
fn repeated_action_with_same_timestamp_replays() {
    let workspace = Workspace::new("replay");
    workspace.register_standard();
    let id = workspace.start("po-mid");
    let args = [
        "instance",
        "approve",
        "--instance-id",
        &id,
        "--actor",
        "mark",
        "--occurred-at",
        "2026-03-02T09:05:00Z",
    ];

    let first = workspace.ok(&args);
    let second = workspace.ok(&args);
    assert_eq!(first["replayed"], Value::Bool(false));
    assert_eq!(second["replayed"], Value::Bool(true));
    let ids = |outcome: &Value| {
        outcome["events"]
            .as_array()
            .map(|events| events.iter().map(|event| event["event_id"].clone()).collect::<Vec<_>>())
            .unwrap_or_default()
    };
    assert_eq!(ids(&first).len(), 2);
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(second["instance"]["version"], 2);
}

#[test]
fn sweep_expires_overdue_manager_step() {
    let workspace = Workspace::new("sweep");
    workspace.register_standard();
    let id = workspace.start("po-mid");

    let early = stdout_json(&workspace.run(&["sweep"]));
    assert_eq!(early["expired"], 0);

    let output = workspace.run_at(TWO_DAYS_LATER, &["sweep"]);
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["scanned"], 1);
    assert_eq!(report["expired"], 1);

    let view = workspace.ok(&["instance", "show", "--instance-id", &id]);
    assert_eq!(view["instance"]["state"], "expired");
}

#[test]
fn malformed_ids_and_missing_inputs_use_the_envelope() {
    let workspace = Workspace::new("inputs");
    let output = workspace.run(&["instance", "show", "--instance-id", "not-a-ulid"]);
    let error = stderr_envelope(&output);
    assert_eq!(error["code"], "configuration");

    let output = workspace.run(&["definition", "register", "--file", "/nonexistent/flow.yaml"]);
    let error = stderr_envelope(&output);
    assert_eq!(error["category"], "configuration");

    let output = match Command::new(apf_binary_path())
        .arg("--db")
        .arg(&workspace.db)
        .arg("--entities")
        .arg("/nonexistent/entities.json")
        .args(["inbox", "--identity", "mark"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run apf: {err}"),
    };
    let error = stderr_envelope(&output);
    assert_eq!(error["code"], "cli_error");

    let output = workspace.run(&["instance", "show", "--instance-id", &Ulid::new().to_string()]);
    let error = stderr_envelope(&output);
    assert_eq!(error["code"], "instance_not_found");
}
