use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const STATEMENT: &str = "Date,Desc,Amt\n01/15/2024,Coffee Shop,4.50\n01/16/2024,Salary,-2000.00\n";

fn ferret(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ferret").unwrap();
    cmd.env("FERRET_CONFIG_DIR", home.path())
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG");
    cmd
}

fn initialized() -> TempDir {
    let home = tempfile::tempdir().unwrap();
    ferret(&home)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized ferret"));
    home
}

/// Upload `content` and return the new session id.
fn upload(home: &TempDir, name: &str, content: &str) -> String {
    let path = home.path().join(name);
    std::fs::write(&path, content).unwrap();
    let out = ferret(home)
        .arg("upload")
        .arg(&path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8(out).unwrap();
    stdout
        .lines()
        .find_map(|l| l.strip_prefix("Next: ferret parse "))
        .map(|id| id.trim().to_string())
        .unwrap_or_else(|| panic!("no session id in: {stdout}"))
}

#[test]
fn test_commands_require_init() {
    let home = tempfile::tempdir().unwrap();
    ferret(&home)
        .args(["sessions", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Database not found"));
    ferret(&home)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Run `ferret init`"));
}

#[test]
fn test_upload_and_parse_labeled_csv() {
    let home = initialized();
    let id = upload(&home, "statement.csv", STATEMENT);

    ferret(&home)
        .args(["parse", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Parsed 2 transaction(s) via Column mapping"))
        .stdout(predicate::str::contains("Coffee Shop"))
        .stdout(predicate::str::contains("+$2,000.00"))
        .stdout(predicate::str::contains("Session state: succeeded"));

    ferret(&home)
        .args(["attempts", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Column mapping"))
        .stdout(predicate::str::contains("success"));

    // Same bytes again point back at the existing session.
    ferret(&home)
        .arg("upload")
        .arg(home.path().join("statement.csv"))
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Already uploaded as session {id}")));
}

#[test]
fn test_incomplete_mapping_is_rejected() {
    let home = initialized();
    let id = upload(&home, "statement.csv", STATEMENT);
    ferret(&home)
        .args(["mapping", "submit", &id, "--map", "date=Date"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing required fields"));
    ferret(&home)
        .args(["sessions", "show", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("State:    created"));
}

#[test]
fn test_patterns_list_shows_builtins() {
    let home = initialized();
    ferret(&home)
        .args(["patterns", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Date / Description / Amount"))
        .stdout(predicate::str::contains("built-in"));
}

#[test]
fn test_pattern_dry_run_reports_bad_regex() {
    let home = initialized();
    ferret(&home)
        .args(["patterns", "test", "(unclosed", "--group", "1=date", "--sample", "x"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Invalid pattern"));
}

#[test]
fn test_manual_annotation_commit() {
    let home = initialized();
    let id = upload(&home, "receipt.txt", "Corner Cafe\n03/02/2024 Lunch 18.40\n");

    ferret(&home)
        .args(["annotate", "commit", &id, "--entry", "2024-13-40|18.40|Lunch"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("date"));

    ferret(&home)
        .args(["annotate", "commit", &id, "--entry", "2024-03-02|18.40|Lunch"])
        .assert()
        .success()
        .stdout(predicate::str::contains("via Manual annotation"));
}

#[test]
fn test_abandon_session() {
    let home = initialized();
    let id = upload(&home, "statement.csv", STATEMENT);
    ferret(&home)
        .args(["sessions", "abandon", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Learned patterns were kept"));
    ferret(&home)
        .args(["parse", &id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("abandoned"));
}
