#![allow(clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use ulid::Ulid;

const MARKER: &str =
    "<system-reminder>This content has been removed for context optimization.</system-reminder>";

const LOG: &str = concat!(
    r#"{"uuid":"u1","type":"user","message":{"role":"user","content":"Open the config"},"timestamp":"2025-01-01T10:00:00.000Z"}"#,
    "\n",
    r#"{"uuid":"a1","parentUuid":"u1","type":"assistant","message":{"content":[{"type":"text","text":"Opening it now"}]},"timestamp":"2025-01-01T10:00:01.000Z"}"#,
    "\n",
    r#"{"uuid":"a2","parentUuid":"a1","type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"/etc/app.toml"}}]},"timestamp":"2025-01-01T10:00:02.000Z"}"#,
    "\n",
    r#"{"uuid":"u2","parentUuid":"a2","type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"port = 80"}]},"toolUseResult":{"type":"text"},"timestamp":"2025-01-01T10:00:03.000Z"}"#,
    "\n",
);

struct Workspace {
    root: PathBuf,
}

impl Workspace {
    fn new(label: &str) -> Self {
        let root = std::env::temp_dir().join(format!("session-log-e2e-{label}-{}", Ulid::new()));
        if let Err(err) = fs::create_dir_all(&root) {
            panic!("failed to create workspace: {err}");
        }
        Self { root }
    }

    fn transcript(&self, text: &str) -> PathBuf {
        let path = self.root.join("transcript.jsonl");
        if let Err(err) = fs::write(&path, text) {
            panic!("failed to write transcript: {err}");
        }
        path
    }

    fn run(&self, transcript: Option<&Path>, args: &[&str]) -> Output {
        let mut command = Command::new(env!("CARGO_BIN_EXE_session-log"));
        command
            .arg("--cwd")
            .arg(&self.root)
            .arg("--projects-dir")
            .arg(self.root.join("projects"));
        if let Some(path) = transcript {
            command.arg("--transcript").arg(path);
        }
        command.args(args);

        match command.output() {
            Ok(output) => output,
            Err(err) => panic!("failed to run session-log {:?}: {err}", args),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "command failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn read(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => panic!("failed to read {}: {err}", path.display()),
    }
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(env!("CARGO_BIN_EXE_session-log"))
        .arg("--help")
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "log",
        "search",
        "count",
        "file-reads",
        "read-session",
        "delete",
        "restore",
        "replace",
        "compact",
        "repair",
        "set-session",
    ] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn log_hides_tool_records() {
    let workspace = Workspace::new("log");
    let transcript = workspace.transcript(LOG);

    let value = stdout_json(&workspace.run(Some(&transcript), &["log"]));
    assert_eq!(
        value,
        json!([
            {"line": 0, "content": "Open the config"},
            {"line": 1, "content": "Opening it now"}
        ])
    );
}

#[test]
fn file_reads_report_read_tool_results() {
    let workspace = Workspace::new("file-reads");
    let transcript = workspace.transcript(LOG);

    let value = stdout_json(&workspace.run(Some(&transcript), &["file-reads"]));
    assert_eq!(value, json!([{"line": 3, "filePath": "/etc/app.toml"}]));
}

#[test]
fn delete_and_restore_round_trip_the_file() {
    let workspace = Workspace::new("delete");
    let transcript = workspace.transcript(LOG);

    let deleted = stdout_json(&workspace.run(Some(&transcript), &["delete", "--lines", "1,3"]));
    assert_eq!(deleted, json!({"affected": 2}));
    assert!(read(&transcript).contains(MARKER));

    let again = stdout_json(&workspace.run(Some(&transcript), &["delete", "--lines", "1,3"]));
    assert_eq!(again, json!({"affected": 0}));

    let restored = stdout_json(&workspace.run(Some(&transcript), &["restore", "--lines", "1,3"]));
    assert_eq!(restored, json!({"affected": 2}));
    assert_eq!(read(&transcript), LOG);
}

#[test]
fn delete_without_targets_fails_without_writing() {
    let workspace = Workspace::new("delete-args");
    let transcript = workspace.transcript(LOG);

    let output = workspace.run(Some(&transcript), &["delete"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("either lines or from_line must be specified"),
        "unexpected stderr={stderr}"
    );
    assert_eq!(read(&transcript), LOG);
}

#[test]
fn replace_of_tool_use_only_record_is_refused() {
    let workspace = Workspace::new("replace");
    let transcript = workspace.transcript(LOG);

    let refused = stdout_json(&workspace.run(
        Some(&transcript),
        &["replace", "--line", "2", "--content", "nope"],
    ));
    assert_eq!(refused, json!({"affected": 0}));
    assert_eq!(read(&transcript), LOG);

    let output = workspace.run(
        Some(&transcript),
        &["replace", "--line", "9", "--content", "nope"],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("line 9 not found"));
}

#[test]
fn compact_inserts_summary_before_last_tool_use() {
    let workspace = Workspace::new("compact");
    let transcript = workspace.transcript(LOG);

    let value = stdout_json(&workspace.run(
        Some(&transcript),
        &["compact", "--content", "Summary so far"],
    ));
    assert_eq!(value["placement"], json!("before_tool_use"));
    assert_eq!(value["line"], json!(2));

    let lines: Vec<Value> = read(&transcript)
        .lines()
        .map(|line| match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => panic!("invalid line {line}: {err}"),
        })
        .collect();
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[2]["isCompactSummary"], json!(true));
    assert_eq!(lines[2]["message"]["content"], json!("Summary so far"));
    assert_eq!(lines[3]["parentUuid"], lines[2]["uuid"]);
    assert_eq!(lines[3]["uuid"], json!("a2"));
    assert_eq!(lines[4]["parentUuid"], json!("a2"));
}

#[test]
fn repair_fixes_inversions_and_keeps_broken_lines() {
    let workspace = Workspace::new("repair");
    let transcript = workspace.transcript(concat!(
        r#"{"uuid":"A","timestamp":"2025-01-01T10:00:00.000Z"}"#,
        "\n",
        r#"{"uuid":"B","parentUuid":"A","timestamp":"2025-01-01T09:59:00.000Z"}"#,
        "\n",
        "not json\n",
        r#"{"uuid":"C","parentUuid":"B","timestamp":"2025-01-01T10:00:30.000Z"}"#,
        "\n",
    ));

    let value = stdout_json(&workspace.run(Some(&transcript), &["repair"]));
    assert_eq!(value["changed"], json!([1]));
    assert_eq!(value["skippedLines"], json!(1));
    assert_eq!(value["converged"], json!(true));

    let text = read(&transcript);
    assert!(text.contains(r#""timestamp":"2025-01-01T10:00:15.000Z""#));
    assert!(text.contains("\nnot json\n"));
}

#[test]
fn writes_without_current_log_fail() {
    let workspace = Workspace::new("no-log");

    let listed = stdout_json(&workspace.run(None, &["log"]));
    assert_eq!(listed, json!([]));

    let output = workspace.run(None, &["delete", "--lines", "0"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no current session log found"));
}

#[test]
fn read_session_requires_window_bounds() {
    let workspace = Workspace::new("read-session");
    let project_dir = workspace
        .root
        .join("projects")
        .join(workspace.root.display().to_string().replace('/', "-"));
    if let Err(err) = fs::create_dir_all(&project_dir) {
        panic!("failed to create project dir: {err}");
    }
    if let Err(err) = fs::write(project_dir.join("older.jsonl"), LOG) {
        panic!("failed to write session: {err}");
    }

    let tail = stdout_json(&workspace.run(
        None,
        &["read-session", "older", "--mode", "tail", "--count", "1"],
    ));
    assert_eq!(tail, json!([{"line": 1, "content": "Opening it now"}]));

    let output = workspace.run(None, &["read-session", "older", "--mode", "tail"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("count is required"));
}
