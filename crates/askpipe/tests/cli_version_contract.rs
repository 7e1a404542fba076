use predicates::prelude::*;

#[test]
fn askpipe_version_contract() {
    let bin = assert_cmd::cargo::cargo_bin!("askpipe");
    let out = std::process::Command::new(bin)
        .args(["version"])
        .env("ASKPIPE_LOG", "off")
        .output()
        .expect("run askpipe version");

    assert!(out.status.success(), "askpipe version failed");
    let s = String::from_utf8_lossy(&out.stdout);
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse version json");

    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["kind"].as_str(), Some("version"));
    assert_eq!(v["ok"].as_bool(), Some(true));
    assert_eq!(v["name"].as_str(), Some("askpipe"));
    assert!(!v["version"].as_str().unwrap_or("").is_empty());
}

#[test]
fn askpipe_version_text_output() {
    assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("askpipe"))
        .args(["version", "--output", "text"])
        .env("ASKPIPE_LOG", "off")
        .assert()
        .success()
        .stdout(predicate::str::starts_with(format!(
            "askpipe {}",
            env!("CARGO_PKG_VERSION")
        )));
}

#[test]
fn askpipe_rejects_unknown_mode() {
    assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("askpipe"))
        .args(["ask", "hello", "--mode", "slow"])
        .env("ASKPIPE_LOG", "off")
        .assert()
        .failure()
        .stderr(predicate::str::contains("fast|thorough"));
}
