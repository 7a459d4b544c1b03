use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn write_config(&self, content: &str) {
        let path = self.xdg_config.join("trendstream/config.toml");
        fs::create_dir_all(path.parent().expect("missing config parent"))
            .expect("failed to create config directory");
        fs::write(path, content).expect("failed to write config");
    }

    fn identity_path(&self) -> PathBuf {
        self.xdg_data.join("trendstream/identity.json")
    }

    fn session_path(&self) -> PathBuf {
        self.xdg_state.join("trendstream/session.json")
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("trendstream"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute trendstream: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "trendstream {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

/// Run a dry-run command and return the single envelope of each printed batch
fn dry_run_events(env: &CliTestEnv, args: &[&str]) -> Vec<serde_json::Value> {
    let mut full = vec!["--dry-run"];
    full.extend_from_slice(args);

    let output = run_bin(env, &full);
    assert_success(&full, &output);

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| {
            let batch: serde_json::Value =
                serde_json::from_str(line).unwrap_or_else(|e| panic!("bad batch {line}: {e}"));
            let events = batch["events"].as_array().expect("events array");
            assert_eq!(events.len(), 1, "batches carry one envelope");
            events[0].clone()
        })
        .collect()
}

#[test]
fn status_reports_defaults_and_paths() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["status"]);
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("http://localhost:8000/api/collect"));
    assert!(stdout.contains("Session Timeout:   30m"));
    assert!(stdout.contains("Country:           KR"));
    assert!(
        stdout.contains(&env.identity_path().display().to_string()),
        "expected identity path in status, got:\n{stdout}"
    );
    assert!(stdout.contains("User Id:           <none>"));
}

#[test]
fn dry_run_track_prints_enriched_envelope() {
    let env = CliTestEnv::new();

    let events = dry_run_events(
        &env,
        &[
            "--url",
            "https://blog.example.com/posts/7?utm_source=ads&utm_campaign=fall",
            "--referrer",
            "https://search.example.com/",
            "--user-agent",
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile/15E148",
            "track",
            "signup",
            "--data",
            r#"{"plan":"pro"}"#,
        ],
    );

    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event["event_type"], "signup");
    assert_eq!(event["event_data"]["plan"], "pro");
    assert_eq!(event["page_path"], "/posts/7");
    assert_eq!(event["utm_source"], "ads");
    assert!(event["utm_medium"].is_null());
    assert_eq!(event["utm_campaign"], "fall");
    assert_eq!(event["device_type"], "mobile");
    assert_eq!(event["country"], "KR");
    assert_eq!(event["referrer"], "https://search.example.com/");
    assert_eq!(event["user_id"].as_str().unwrap().len(), 32);
    assert!(event["timestamp"].as_str().unwrap().ends_with('Z'));
}

#[test]
fn identity_persists_across_invocations() {
    let env = CliTestEnv::new();

    let first = dry_run_events(&env, &["search", "rust"]);
    let second = dry_run_events(&env, &["conversion", "39000"]);

    assert!(env.identity_path().exists());
    assert!(env.session_path().exists());
    assert_eq!(first[0]["user_id"], second[0]["user_id"]);
    assert_eq!(first[0]["session_id"], second[0]["session_id"]);

    assert_eq!(second[0]["event_type"], "conversion");
    assert_eq!(second[0]["event_data"]["value"], 39000.0);
    assert_eq!(second[0]["event_data"]["currency"], "KRW");

    let output = run_bin(&env, &["status"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(first[0]["user_id"].as_str().unwrap()));
}

#[test]
fn view_post_collects_keywords() {
    let env = CliTestEnv::new();

    let events = dry_run_events(
        &env,
        &["view-post", "42", "Hello", "--keyword", "rust", "--keyword", "async"],
    );

    assert_eq!(events[0]["event_type"], "view_post");
    assert_eq!(events[0]["event_data"]["post_id"], "42");
    assert_eq!(events[0]["event_data"]["post_title"], "Hello");
    assert_eq!(
        events[0]["event_data"]["keywords"],
        serde_json::json!(["rust", "async"])
    );
}

#[test]
fn replay_runs_auto_tracking_and_respects_config() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[collector]
country = "JP"

[collector.auto_track]
click = false
"#,
    );

    let visit = env.home.join("visit.jsonl");
    fs::write(
        &visit,
        concat!(
            "# one recorded visit\n",
            r#"{"type":"click","target":{"tag":"a","text":"Next"}}"#,
            "\n",
            r#"{"type":"scroll","scroll_y":1200,"viewport_height":800,"document_height":2000}"#,
            "\n",
            r#"{"type":"unload"}"#,
            "\n",
        ),
    )
    .expect("failed to write visit");

    let events = dry_run_events(&env, &["replay", visit.to_str().unwrap()]);
    let types: Vec<&str> = events
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();

    assert_eq!(
        types,
        vec![
            "pageview",
            "scroll_depth",
            "scroll_depth",
            "scroll_depth",
            "scroll_depth",
            "page_exit"
        ]
    );
    assert!(events.iter().all(|e| e["country"] == "JP"));
    assert_eq!(events[5]["event_data"]["scroll_depth"], 100);
}

#[test]
fn unreachable_endpoint_does_not_fail() {
    let env = CliTestEnv::new();
    let args = [
        "--api-url",
        "http://127.0.0.1:9/api/collect",
        "track",
        "signup",
    ];

    let output = run_bin(&env, &args);
    assert_success(&args, &output);
}

#[test]
fn invalid_data_is_rejected() {
    let env = CliTestEnv::new();

    let output = run_bin(&env, &["--dry-run", "track", "signup", "--data", "[1]"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("JSON object"));
}
