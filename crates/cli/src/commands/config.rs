use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use pricebot_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

struct Sources {
    path: Option<PathBuf>,
    doc: Option<Value>,
}

impl Sources {
    fn detect() -> Self {
        let path = ["pricebot.toml", "config/pricebot.toml"]
            .into_iter()
            .map(PathBuf::from)
            .find(|path| path.exists());
        let doc = load_config_file_doc(path.as_deref());
        Self { path, doc }
    }

    /// Env keys are checked in order; the first one set wins.
    fn line(&self, key: &str, value: &str, env_keys: &[&str]) -> String {
        format!("- {key} = {value} (source: {})", self.source(key, env_keys))
    }

    fn source(&self, key_path: &str, env_keys: &[&str]) -> String {
        if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
            return format!("env ({env_key})");
        }

        if let Some(doc) = &self.doc {
            if contains_path(doc, key_path) {
                let file_path = self
                    .path
                    .as_ref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "config file".to_string());
                return format!("file ({file_path})");
            }
        }

        "default".to_string()
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };
    let sources = Sources::detect();

    let store = &config.store;
    let chat = &config.chat;
    let services = &config.services;
    let server = &config.server;
    let rate_limit = &config.rate_limit;
    let concurrency = &config.concurrency;

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend([
        sources.line("store.backend", &format!("{:?}", store.backend), &["PRICEBOT_STORE_BACKEND"]),
        sources.line("store.url", &store.url, &["PRICEBOT_STORE_URL"]),
        sources.line(
            "store.max_connections",
            &store.max_connections.to_string(),
            &["PRICEBOT_STORE_MAX_CONNECTIONS"],
        ),
        sources.line(
            "store.timeout_secs",
            &store.timeout_secs.to_string(),
            &["PRICEBOT_STORE_TIMEOUT_SECS"],
        ),
        sources.line(
            "chat.bot_token",
            &redact_bot_token(chat.bot_token.as_ref()),
            &["PRICEBOT_CHAT_BOT_TOKEN"],
        ),
        sources.line("chat.api_base_url", &chat.api_base_url, &["PRICEBOT_CHAT_API_BASE_URL"]),
        sources.line("chat.locale", &format!("{:?}", chat.locale), &["PRICEBOT_CHAT_LOCALE"]),
        sources.line("services.nlp_base_url", &services.nlp_base_url, &["PRICEBOT_NLP_BASE_URL"]),
        sources.line(
            "services.nlp_api_key",
            if services.nlp_api_key.is_some() { "<redacted>" } else { "<unset>" },
            &["PRICEBOT_NLP_API_KEY"],
        ),
        sources.line(
            "services.pricing_api_base_url",
            &services.pricing_api_base_url,
            &["PRICEBOT_PRICING_API_BASE_URL"],
        ),
        sources.line(
            "server.bind_address",
            &server.bind_address,
            &["PRICEBOT_SERVER_BIND_ADDRESS"],
        ),
        sources.line("server.port", &server.port.to_string(), &["PRICEBOT_SERVER_PORT"]),
        sources.line(
            "server.sweep_interval_secs",
            &server.sweep_interval_secs.to_string(),
            &[],
        ),
        sources.line(
            "logging.level",
            &config.logging.level,
            &["PRICEBOT_LOGGING_LEVEL", "PRICEBOT_LOG_LEVEL"],
        ),
        sources.line(
            "logging.format",
            &format!("{:?}", config.logging.format),
            &["PRICEBOT_LOGGING_FORMAT", "PRICEBOT_LOG_FORMAT"],
        ),
        sources.line(
            "rate_limit.global_limit",
            &rate_limit.global_limit.to_string(),
            &["PRICEBOT_RATE_LIMIT_GLOBAL"],
        ),
        sources.line(
            "rate_limit.user_limit",
            &rate_limit.user_limit.to_string(),
            &["PRICEBOT_RATE_LIMIT_USER"],
        ),
        sources.line(
            "rate_limit.bypass_user_ids",
            &format!("{} id(s)", rate_limit.bypass_user_ids.len()),
            &["PRICEBOT_RATE_LIMIT_BYPASS"],
        ),
        sources.line(
            "concurrency.max_concurrent",
            &concurrency.max_concurrent.to_string(),
            &["PRICEBOT_MAX_CONCURRENT"],
        ),
        sources.line(
            "concurrency.max_queue_size",
            &concurrency.max_queue_size.to_string(),
            &["PRICEBOT_QUEUE_SIZE"],
        ),
        sources.line(
            "concurrency.overflow_policy",
            &format!("{:?}", concurrency.overflow_policy),
            &[],
        ),
        sources.line(
            "circuit.state_ttl_secs",
            &config.circuit.state_ttl_secs.to_string(),
            &[],
        ),
    ]);

    for (name, breaker) in &config.circuit.dependencies {
        lines.push(sources.line(
            &format!("circuit.dependencies.{name}"),
            &format!(
                "failure_threshold={} success_threshold={} cooldown_ms={}",
                breaker.failure_threshold, breaker.success_threshold, breaker.cooldown_ms
            ),
            &[],
        ));
    }

    lines.join("\n")
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

/// Keeps the public bot id, hides the secret half.
fn redact_bot_token(token: Option<&SecretString>) -> String {
    let Some(token) = token else {
        return "<unset>".to_string();
    };
    match token.expose_secret().trim().split_once(':') {
        Some((bot_id, _)) if !bot_id.is_empty() => format!("{bot_id}:***"),
        _ => "<redacted>".to_string(),
    }
}
