#[test]
fn askpipe_doctor_contract_json_without_secrets() {
    let bin = assert_cmd::cargo::cargo_bin!("askpipe");
    let tmp = tempfile::tempdir().expect("tempdir");
    let secret = "sk-test-do-not-print";

    let out = std::process::Command::new(bin)
        .args(["doctor"])
        .env("ASKPIPE_LOG", "off")
        .env("ASKPIPE_CACHE_DIR", tmp.path().join("cache"))
        .env("ASKPIPE_STORE_DIR", tmp.path().join("store"))
        .env("ASKPIPE_OPENAI_API_KEY", secret)
        .env_remove("ASKPIPE_BRAVE_API_KEY")
        .env_remove("BRAVE_SEARCH_API_KEY")
        .env_remove("ASKPIPE_SEARXNG_ENDPOINT")
        .env_remove("ASKPIPE_OLLAMA_ENABLE")
        .env_remove("ASKPIPE_ENV_FILE")
        .output()
        .expect("run askpipe doctor");

    assert!(out.status.success(), "askpipe doctor failed");
    let s = String::from_utf8_lossy(&out.stdout);
    assert!(!s.contains(secret), "doctor printed a secret");
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse doctor json");

    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["kind"].as_str(), Some("doctor"));
    assert_eq!(v["name"].as_str(), Some("askpipe"));
    assert!(!v["version"].as_str().unwrap_or("").is_empty());
    assert!(v.get("elapsed_ms").is_some());

    assert_eq!(v["configured"]["search"]["brave"].as_bool(), Some(false));
    assert_eq!(v["configured"]["search"]["searxng"].as_bool(), Some(false));
    assert_eq!(v["configured"]["llm"]["openai_compat"].as_bool(), Some(true));
    assert_eq!(v["configured"]["llm"]["ollama"].as_bool(), Some(false));

    let checks = v["checks"].as_array().expect("checks array");
    for name in ["cache_dir_writable", "store_dir_writable", "pipeline_config"] {
        let c = checks
            .iter()
            .find(|c| c["name"].as_str() == Some(name))
            .unwrap_or_else(|| panic!("{name} check"));
        assert_eq!(c["ok"].as_bool(), Some(true), "{name}: {c}");
    }
    assert_eq!(v["ok"].as_bool(), Some(true));
}

#[test]
fn askpipe_doctor_reports_bad_config() {
    let bin = assert_cmd::cargo::cargo_bin!("askpipe");
    let tmp = tempfile::tempdir().expect("tempdir");
    let out = std::process::Command::new(bin)
        .args(["doctor"])
        .env("ASKPIPE_LOG", "off")
        .env("ASKPIPE_CACHE_DIR", tmp.path().join("cache"))
        .env("ASKPIPE_STORE_DIR", tmp.path().join("store"))
        .env("ASKPIPE_CONCURRENCY", "lots")
        .output()
        .expect("run askpipe doctor");

    assert!(out.status.success());
    let v: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("parse doctor json");
    assert_eq!(v["ok"].as_bool(), Some(false));
    let cfg = v["checks"]
        .as_array()
        .and_then(|a| a.iter().find(|c| c["name"] == "pipeline_config"))
        .expect("pipeline_config check");
    assert_eq!(cfg["ok"].as_bool(), Some(false));
}

#[test]
fn askpipe_env_file_fills_unset_vars_only() {
    let bin = assert_cmd::cargo::cargo_bin!("askpipe");
    let tmp = tempfile::tempdir().expect("tempdir");
    let env_file = tmp.path().join("askpipe.env");
    std::fs::write(
        &env_file,
        "# keys\nASKPIPE_SEARXNG_ENDPOINT=http://127.0.0.1:9\nASKPIPE_OLLAMA_ENABLE=1\n",
    )
    .expect("write env file");

    let out = std::process::Command::new(bin)
        .args(["doctor"])
        .env("ASKPIPE_LOG", "off")
        .env("ASKPIPE_ENV_FILE", &env_file)
        .env("ASKPIPE_CACHE_DIR", tmp.path().join("cache"))
        .env("ASKPIPE_STORE_DIR", tmp.path().join("store"))
        // Explicit process env wins over the file.
        .env("ASKPIPE_OLLAMA_ENABLE", "")
        .env_remove("ASKPIPE_SEARXNG_ENDPOINT")
        .output()
        .expect("run askpipe doctor");

    assert!(out.status.success());
    let v: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("parse doctor json");
    assert_eq!(v["configured"]["search"]["searxng"].as_bool(), Some(true));
    assert_eq!(v["configured"]["llm"]["ollama"].as_bool(), Some(false));
}
