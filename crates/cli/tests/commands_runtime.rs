use std::env;
use std::sync::{Mutex, OnceLock};

use pricebot_cli::commands::breaker::{self, BreakerAction};
use pricebot_cli::commands::{config, conversations, doctor, migrate, status};
use serde_json::Value;

#[test]
fn migrate_applies_schema_to_a_fresh_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&[("PRICEBOT_STORE_URL", store_url(&dir).as_str())], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert!(payload["message"].as_str().unwrap_or_default().starts_with("applied 1"));

        let again = parse_payload(&migrate::run().output);
        assert!(again["message"].as_str().unwrap_or_default().starts_with("applied 0"));
    });
}

#[test]
fn migrate_returns_config_failure_for_invalid_token() {
    with_env(&[("PRICEBOT_CHAT_BOT_TOKEN", "not-a-token")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn store_commands_report_unreachable_store() {
    with_env(&[("PRICEBOT_STORE_URL", "sqlite:///nonexistent-pricebot-dir/store.db")], || {
        let result = status::run();
        assert_eq!(result.exit_code, 4, "expected store connectivity failure code");
        assert_eq!(parse_payload(&result.output)["error_class"], "store_connectivity");
    });
}

#[test]
fn status_lists_builtin_circuits_and_capacity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = store_url(&dir);
    with_env(&[("PRICEBOT_STORE_URL", url.as_str()), ("PRICEBOT_MAX_CONCURRENT", "40")], || {
        let result = status::run();
        assert_eq!(result.exit_code, 0, "expected successful status: {}", result.output);

        let payload = parse_payload(&result.output);
        let names: Vec<&str> = payload["data"]["circuits"]
            .as_array()
            .expect("circuit list")
            .iter()
            .filter_map(|stats| stats["name"].as_str())
            .collect();
        assert_eq!(names, vec!["chat_transport", "nlp_service", "pricing_api"]);
        assert_eq!(payload["data"]["concurrency"]["max_concurrent"], 40);
        assert_eq!(payload["data"]["rate_limits"]["global_count"], 0);
    });
}

#[test]
fn breaker_open_and_reset_are_visible_in_status() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&[("PRICEBOT_STORE_URL", store_url(&dir).as_str())], || {
        let opened = breaker::run(BreakerAction::Open, "pricing_api");
        assert_eq!(opened.exit_code, 0, "expected breaker open: {}", opened.output);
        assert_eq!(parse_payload(&opened.output)["data"]["state"], "open");

        assert_eq!(circuit_state("pricing_api").as_deref(), Some("open"));

        let reset = breaker::run(BreakerAction::Reset, "pricing_api");
        assert_eq!(reset.exit_code, 0);
        assert_eq!(parse_payload(&reset.output)["data"]["failure_count"], 0);
        assert_eq!(circuit_state("pricing_api").as_deref(), Some("closed"));
    });
}

#[test]
fn status_discovers_circuits_created_by_operators() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&[("PRICEBOT_STORE_URL", store_url(&dir).as_str())], || {
        assert_eq!(breaker::run(BreakerAction::Open, "geocoder").exit_code, 0);
        assert_eq!(circuit_state("geocoder").as_deref(), Some("open"));
    });
}

#[test]
fn breaker_rejects_invalid_names() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&[("PRICEBOT_STORE_URL", store_url(&dir).as_str())], || {
        let result = breaker::run(BreakerAction::Open, "pricing_api:failures");
        assert_eq!(result.exit_code, 6);
        assert_eq!(parse_payload(&result.output)["error_class"], "invalid_argument");
    });
}

#[test]
fn memory_backend_refuses_shared_state_commands() {
    with_env(&[("PRICEBOT_STORE_BACKEND", "memory")], || {
        let result = conversations::cleanup();
        assert_eq!(result.exit_code, 6);
        assert_eq!(parse_payload(&result.output)["error_class"], "store_backend");

        let migrated = migrate::run();
        assert_eq!(migrated.exit_code, 0, "memory backend has nothing to migrate");
    });
}

#[test]
fn conversations_cleanup_succeeds_on_empty_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&[("PRICEBOT_STORE_URL", store_url(&dir).as_str())], || {
        let result = conversations::cleanup();
        assert_eq!(result.exit_code, 0);
        assert_eq!(parse_payload(&result.output)["message"], "removed 0 conversation slot(s)");
    });
}

#[test]
fn doctor_passes_after_migrate_and_warns_without_bot_token() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&[("PRICEBOT_STORE_URL", store_url(&dir).as_str())], || {
        let (passed, output) = doctor::run(true);
        assert!(!passed, "migrations are not applied yet");
        let report = parse_payload(&output);
        assert_eq!(report["overall_status"], "fail");

        assert_eq!(migrate::run().exit_code, 0);

        let (passed, output) = doctor::run(true);
        assert!(passed, "doctor should pass: {output}");
        let report = parse_payload(&output);
        assert_eq!(report["overall_status"], "warn");
        assert_eq!(check_status(&report, "chat_transport"), "warn");
        assert_eq!(check_status(&report, "store_connectivity"), "pass");
        assert_eq!(check_status(&report, "store_migrations"), "pass");
    });
}

#[test]
fn config_reports_env_sources_and_redacts_secrets() {
    with_env(
        &[
            ("PRICEBOT_STORE_URL", "sqlite://from-env.db"),
            ("PRICEBOT_CHAT_BOT_TOKEN", "4242:very-secret"),
        ],
        || {
            let output = config::run();
            assert!(output.contains(
                "- store.url = sqlite://from-env.db (source: env (PRICEBOT_STORE_URL))"
            ));
            assert!(output.contains(
                "- chat.bot_token = 4242:*** (source: env (PRICEBOT_CHAT_BOT_TOKEN))"
            ));
            assert!(output.contains("- server.port = 8080 (source: default)"));
            assert!(!output.contains("very-secret"));
        },
    );
}

fn circuit_state(name: &str) -> Option<String> {
    let payload = parse_payload(&status::run().output);
    payload["data"]["circuits"]
        .as_array()?
        .iter()
        .find(|stats| stats["name"] == name)
        .and_then(|stats| stats["state"].as_str())
        .map(str::to_owned)
}

fn check_status<'a>(report: &'a Value, name: &str) -> &'a str {
    report["checks"]
        .as_array()
        .and_then(|checks| checks.iter().find(|check| check["name"] == name))
        .and_then(|check| check["status"].as_str())
        .unwrap_or_default()
}

fn store_url(dir: &tempfile::TempDir) -> String {
    format!("sqlite://{}", dir.path().join("pricebot.db").display())
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    let keys = [
        "PRICEBOT_STORE_BACKEND",
        "PRICEBOT_STORE_URL",
        "PRICEBOT_STORE_MAX_CONNECTIONS",
        "PRICEBOT_STORE_TIMEOUT_SECS",
        "PRICEBOT_CHAT_BOT_TOKEN",
        "PRICEBOT_CHAT_API_BASE_URL",
        "PRICEBOT_CHAT_LOCALE",
        "PRICEBOT_NLP_BASE_URL",
        "PRICEBOT_NLP_API_KEY",
        "PRICEBOT_PRICING_API_BASE_URL",
        "PRICEBOT_SERVER_BIND_ADDRESS",
        "PRICEBOT_SERVER_PORT",
        "PRICEBOT_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "PRICEBOT_LOGGING_LEVEL",
        "PRICEBOT_LOGGING_FORMAT",
        "PRICEBOT_LOG_LEVEL",
        "PRICEBOT_LOG_FORMAT",
        "PRICEBOT_RATE_LIMIT_GLOBAL",
        "PRICEBOT_RATE_LIMIT_USER",
        "PRICEBOT_RATE_LIMIT_BYPASS",
        "PRICEBOT_MAX_CONCURRENT",
        "PRICEBOT_QUEUE_SIZE",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
