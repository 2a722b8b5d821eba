use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::Locale;
use crate::resilience::{
    CircuitBreakerConfig, ConcurrencyConfig, OperationType, OverflowPolicy, RateLimitConfig,
    TimeoutConfig,
};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub chat: ChatConfig,
    pub services: ServicesConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub rate_limit: RateLimitConfig,
    pub concurrency: ConcurrencyConfig,
    pub timeouts: TimeoutConfig,
    pub circuit: CircuitConfig,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// Unset means replies are logged instead of sent.
    pub bot_token: Option<SecretString>,
    pub api_base_url: String,
    pub locale: Locale,
}

#[derive(Clone, Debug)]
pub struct ServicesConfig {
    pub nlp_base_url: String,
    pub nlp_api_key: Option<SecretString>,
    pub pricing_api_base_url: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Debug)]
pub struct CircuitConfig {
    pub state_ttl_secs: u64,
    /// Per-dependency settings; names not listed use the built-in defaults.
    pub dependencies: BTreeMap<String, CircuitBreakerConfig>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub store_backend: Option<StoreBackend>,
    pub store_url: Option<String>,
    pub log_level: Option<String>,
    pub chat_bot_token: Option<String>,
    pub locale: Option<Locale>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                backend: StoreBackend::Sqlite,
                url: "sqlite://pricebot.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            chat: ChatConfig {
                bot_token: None,
                api_base_url: "https://api.telegram.org".to_string(),
                locale: Locale::En,
            },
            services: ServicesConfig {
                nlp_base_url: "http://127.0.0.1:8600".to_string(),
                nlp_api_key: None,
                pricing_api_base_url: "http://127.0.0.1:8700".to_string(),
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
                sweep_interval_secs: 60,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            rate_limit: RateLimitConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            timeouts: TimeoutConfig::default(),
            circuit: CircuitConfig { state_ttl_secs: 86_400, dependencies: BTreeMap::new() },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(ConfigError::Validation(format!(
                "unsupported store backend `{other}` (expected memory|sqlite)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("pricebot.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Breaker settings for `name`, falling back to the per-dependency
    /// defaults.
    pub fn circuit_for(&self, name: &str) -> CircuitBreakerConfig {
        self.circuit
            .dependencies
            .get(name)
            .cloned()
            .unwrap_or_else(|| CircuitBreakerConfig::defaults_for(name))
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(store) = patch.store {
            if let Some(backend) = store.backend {
                self.store.backend = backend;
            }
            if let Some(url) = store.url {
                self.store.url = url;
            }
            if let Some(max_connections) = store.max_connections {
                self.store.max_connections = max_connections;
            }
            if let Some(timeout_secs) = store.timeout_secs {
                self.store.timeout_secs = timeout_secs;
            }
        }

        if let Some(chat) = patch.chat {
            if let Some(bot_token_value) = chat.bot_token {
                self.chat.bot_token = Some(secret_value(bot_token_value));
            }
            if let Some(api_base_url) = chat.api_base_url {
                self.chat.api_base_url = api_base_url;
            }
            if let Some(locale) = chat.locale {
                self.chat.locale = locale;
            }
        }

        if let Some(services) = patch.services {
            if let Some(nlp_base_url) = services.nlp_base_url {
                self.services.nlp_base_url = nlp_base_url;
            }
            if let Some(nlp_api_key_value) = services.nlp_api_key {
                self.services.nlp_api_key = Some(secret_value(nlp_api_key_value));
            }
            if let Some(pricing_api_base_url) = services.pricing_api_base_url {
                self.services.pricing_api_base_url = pricing_api_base_url;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(sweep_interval_secs) = server.sweep_interval_secs {
                self.server.sweep_interval_secs = sweep_interval_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(rate_limit) = patch.rate_limit {
            let target = &mut self.rate_limit;
            if let Some(value) = rate_limit.global_limit {
                target.global_limit = value;
            }
            if let Some(value) = rate_limit.global_window_secs {
                target.global_window_secs = value;
            }
            if let Some(value) = rate_limit.user_limit {
                target.user_limit = value;
            }
            if let Some(value) = rate_limit.user_window_secs {
                target.user_window_secs = value;
            }
            if let Some(value) = rate_limit.top_n {
                target.top_n = value;
            }
            if let Some(value) = rate_limit.bypass_user_ids {
                target.bypass_user_ids = value;
            }
        }

        if let Some(concurrency) = patch.concurrency {
            let target = &mut self.concurrency;
            if let Some(value) = concurrency.max_concurrent {
                target.max_concurrent = value;
            }
            if let Some(value) = concurrency.backpressure_ratio {
                target.backpressure_ratio = value;
            }
            if let Some(value) = concurrency.conversation_ttl_secs {
                target.conversation_ttl_secs = value;
            }
            if let Some(value) = concurrency.max_queue_size {
                target.max_queue_size = value;
            }
            if let Some(value) = concurrency.queue_entry_ttl_secs {
                target.queue_entry_ttl_secs = value;
            }
            if let Some(value) = concurrency.overflow_policy {
                target.overflow_policy = value;
            }
        }

        if let Some(timeouts) = patch.timeouts {
            for (operation, value) in [
                (OperationType::NlpService, timeouts.nlp_service_ms),
                (OperationType::PriceLookup, timeouts.price_lookup_ms),
                (OperationType::Analytics, timeouts.analytics_ms),
                (OperationType::Webhook, timeouts.webhook_ms),
                (OperationType::Default, timeouts.default_ms),
            ] {
                if let Some(value) = value {
                    *self.timeouts.budgets_ms.get_mut(operation) = value;
                }
            }
            if let Some(value) = timeouts.max_attempts {
                self.timeouts.default_max_attempts = value;
            }
            if let Some(value) = timeouts.max_backoff_ms {
                self.timeouts.max_backoff_ms = value;
            }
        }

        if let Some(circuit) = patch.circuit {
            if let Some(state_ttl_secs) = circuit.state_ttl_secs {
                self.circuit.state_ttl_secs = state_ttl_secs;
            }
            for (name, dependency) in circuit.dependencies.unwrap_or_default() {
                let mut merged = self.circuit_for(&name);
                if let Some(value) = dependency.failure_threshold {
                    merged.failure_threshold = value;
                }
                if let Some(value) = dependency.success_threshold {
                    merged.success_threshold = value;
                    if dependency.half_open_max_probes.is_none() {
                        merged.half_open_max_probes = value;
                    }
                }
                if let Some(value) = dependency.cooldown_ms {
                    merged.cooldown_ms = value;
                }
                if let Some(value) = dependency.half_open_max_probes {
                    merged.half_open_max_probes = value;
                }
                self.circuit.dependencies.insert(name, merged);
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PRICEBOT_STORE_BACKEND") {
            self.store.backend = value.parse()?;
        }
        if let Some(value) = read_env("PRICEBOT_STORE_URL") {
            self.store.url = value;
        }
        if let Some(value) = read_env("PRICEBOT_STORE_MAX_CONNECTIONS") {
            self.store.max_connections = parse_number("PRICEBOT_STORE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("PRICEBOT_STORE_TIMEOUT_SECS") {
            self.store.timeout_secs = parse_number("PRICEBOT_STORE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PRICEBOT_CHAT_BOT_TOKEN") {
            self.chat.bot_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("PRICEBOT_CHAT_API_BASE_URL") {
            self.chat.api_base_url = value;
        }
        if let Some(value) = read_env("PRICEBOT_CHAT_LOCALE") {
            self.chat.locale = value.parse()?;
        }

        if let Some(value) = read_env("PRICEBOT_NLP_BASE_URL") {
            self.services.nlp_base_url = value;
        }
        if let Some(value) = read_env("PRICEBOT_NLP_API_KEY") {
            self.services.nlp_api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("PRICEBOT_PRICING_API_BASE_URL") {
            self.services.pricing_api_base_url = value;
        }

        if let Some(value) = read_env("PRICEBOT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("PRICEBOT_SERVER_PORT") {
            self.server.port = parse_number("PRICEBOT_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("PRICEBOT_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_number("PRICEBOT_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("PRICEBOT_LOGGING_LEVEL").or_else(|| read_env("PRICEBOT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PRICEBOT_LOGGING_FORMAT").or_else(|| read_env("PRICEBOT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        if let Some(value) = read_env("PRICEBOT_RATE_LIMIT_GLOBAL") {
            self.rate_limit.global_limit = parse_number("PRICEBOT_RATE_LIMIT_GLOBAL", &value)?;
        }
        if let Some(value) = read_env("PRICEBOT_RATE_LIMIT_USER") {
            self.rate_limit.user_limit = parse_number("PRICEBOT_RATE_LIMIT_USER", &value)?;
        }
        if let Some(value) = read_env("PRICEBOT_RATE_LIMIT_BYPASS") {
            self.rate_limit.bypass_user_ids = value
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(value) = read_env("PRICEBOT_MAX_CONCURRENT") {
            self.concurrency.max_concurrent = parse_number("PRICEBOT_MAX_CONCURRENT", &value)?;
        }
        if let Some(value) = read_env("PRICEBOT_QUEUE_SIZE") {
            self.concurrency.max_queue_size = parse_number("PRICEBOT_QUEUE_SIZE", &value)?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(backend) = overrides.store_backend {
            self.store.backend = backend;
        }
        if let Some(store_url) = overrides.store_url {
            self.store.url = store_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(bot_token) = overrides.chat_bot_token {
            self.chat.bot_token = Some(secret_value(bot_token));
        }
        if let Some(locale) = overrides.locale {
            self.chat.locale = locale;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_store(&self.store)?;
        validate_chat(&self.chat)?;
        validate_services(&self.services)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        validate_rate_limit(&self.rate_limit)?;
        validate_concurrency(&self.concurrency)?;
        validate_timeouts(&self.timeouts)?;
        validate_circuit(&self.circuit)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("pricebot.toml"), PathBuf::from("config/pricebot.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn validate_store(store: &StoreConfig) -> Result<(), ConfigError> {
    if store.backend == StoreBackend::Sqlite {
        let url = store.url.trim();
        let sqlite_url =
            url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
        if !sqlite_url {
            return Err(invalid(
                "store.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)",
            ));
        }
    }

    if store.max_connections == 0 {
        return Err(invalid("store.max_connections must be greater than zero"));
    }

    if store.timeout_secs == 0 || store.timeout_secs > 300 {
        return Err(invalid("store.timeout_secs must be in range 1..=300"));
    }

    Ok(())
}

fn validate_chat(chat: &ChatConfig) -> Result<(), ConfigError> {
    if let Some(token) = &chat.bot_token {
        let token = token.expose_secret();
        if token.trim().is_empty() || !token.contains(':') {
            return Err(invalid(
                "chat.bot_token must look like `<bot id>:<secret>` as issued by the bot API",
            ));
        }
    }

    if !is_http_url(&chat.api_base_url) {
        return Err(invalid("chat.api_base_url must start with http:// or https://"));
    }

    Ok(())
}

fn validate_services(services: &ServicesConfig) -> Result<(), ConfigError> {
    if !is_http_url(&services.nlp_base_url) {
        return Err(invalid("services.nlp_base_url must start with http:// or https://"));
    }
    if !is_http_url(&services.pricing_api_base_url) {
        return Err(invalid("services.pricing_api_base_url must start with http:// or https://"));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(invalid("server.port must be greater than zero"));
    }
    if server.graceful_shutdown_secs == 0 {
        return Err(invalid("server.graceful_shutdown_secs must be greater than zero"));
    }
    if server.sweep_interval_secs == 0 {
        return Err(invalid("server.sweep_interval_secs must be greater than zero"));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(invalid("logging.level must be one of trace|debug|info|warn|error")),
    }
}

fn validate_rate_limit(rate_limit: &RateLimitConfig) -> Result<(), ConfigError> {
    if rate_limit.global_limit == 0 || rate_limit.user_limit == 0 {
        return Err(invalid("rate_limit limits must be greater than zero"));
    }
    if rate_limit.global_window_secs == 0 || rate_limit.user_window_secs == 0 {
        return Err(invalid("rate_limit windows must be greater than zero"));
    }
    Ok(())
}

fn validate_concurrency(concurrency: &ConcurrencyConfig) -> Result<(), ConfigError> {
    if concurrency.max_concurrent == 0 {
        return Err(invalid("concurrency.max_concurrent must be greater than zero"));
    }
    if !(concurrency.backpressure_ratio > 0.0 && concurrency.backpressure_ratio <= 1.0) {
        return Err(invalid("concurrency.backpressure_ratio must be in range (0, 1]"));
    }
    if concurrency.conversation_ttl_secs == 0 || concurrency.queue_entry_ttl_secs == 0 {
        return Err(invalid("concurrency TTLs must be greater than zero"));
    }
    if concurrency.overflow_policy == OverflowPolicy::DropOldest
        && concurrency.max_queue_size == 0
    {
        return Err(invalid("concurrency.overflow_policy `drop_oldest` needs max_queue_size > 0"));
    }
    Ok(())
}

fn validate_timeouts(timeouts: &TimeoutConfig) -> Result<(), ConfigError> {
    for operation in OperationType::ALL {
        if *timeouts.budgets_ms.get(operation) == 0 {
            return Err(invalid(format!("timeouts.{operation}_ms must be greater than zero")));
        }
    }
    if timeouts.default_max_attempts == 0 {
        return Err(invalid("timeouts.max_attempts must be at least 1"));
    }
    Ok(())
}

fn validate_circuit(circuit: &CircuitConfig) -> Result<(), ConfigError> {
    if circuit.state_ttl_secs == 0 {
        return Err(invalid("circuit.state_ttl_secs must be greater than zero"));
    }
    for (name, dependency) in &circuit.dependencies {
        if dependency.failure_threshold == 0
            || dependency.success_threshold == 0
            || dependency.half_open_max_probes == 0
        {
            return Err(invalid(format!(
                "circuit.dependencies.{name} thresholds and probe budget must be at least 1"
            )));
        }
        if dependency.cooldown_ms == 0 {
            return Err(invalid(format!(
                "circuit.dependencies.{name}.cooldown_ms must be greater than zero"
            )));
        }
    }
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    store: Option<StorePatch>,
    chat: Option<ChatPatch>,
    services: Option<ServicesPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
    rate_limit: Option<RateLimitPatch>,
    concurrency: Option<ConcurrencyPatch>,
    timeouts: Option<TimeoutsPatch>,
    circuit: Option<CircuitPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct StorePatch {
    backend: Option<StoreBackend>,
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatPatch {
    bot_token: Option<String>,
    api_base_url: Option<String>,
    locale: Option<Locale>,
}

#[derive(Debug, Default, Deserialize)]
struct ServicesPatch {
    nlp_base_url: Option<String>,
    nlp_api_key: Option<String>,
    pricing_api_base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitPatch {
    global_limit: Option<u64>,
    global_window_secs: Option<u64>,
    user_limit: Option<u64>,
    user_window_secs: Option<u64>,
    top_n: Option<usize>,
    bypass_user_ids: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ConcurrencyPatch {
    max_concurrent: Option<usize>,
    backpressure_ratio: Option<f64>,
    conversation_ttl_secs: Option<u64>,
    max_queue_size: Option<usize>,
    queue_entry_ttl_secs: Option<u64>,
    overflow_policy: Option<OverflowPolicy>,
}

#[derive(Debug, Default, Deserialize)]
struct TimeoutsPatch {
    nlp_service_ms: Option<u64>,
    price_lookup_ms: Option<u64>,
    analytics_ms: Option<u64>,
    webhook_ms: Option<u64>,
    default_ms: Option<u64>,
    max_attempts: Option<u32>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CircuitPatch {
    state_ttl_secs: Option<u64>,
    dependencies: Option<BTreeMap<String, DependencyCircuitPatch>>,
}

#[derive(Debug, Default, Deserialize)]
struct DependencyCircuitPatch {
    failure_threshold: Option<u32>,
    success_threshold: Option<u32>,
    cooldown_ms: Option<u64>,
    half_open_max_probes: Option<u32>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat, StoreBackend};
    use crate::messages::Locale;
    use crate::resilience::circuit_breaker::{NLP_SERVICE, PRICING_API};
    use crate::resilience::{OperationType, OverflowPolicy};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    fn write_config(dir: &TempDir, body: &str) -> Result<std::path::PathBuf, String> {
        let path = dir.path().join("pricebot.toml");
        fs::write(&path, body).map_err(|err| err.to_string())?;
        Ok(path)
    }

    #[test]
    fn defaults_match_documented_limits() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.rate_limit.global_limit == 600, "global limit defaults to 600")?;
        ensure(config.rate_limit.user_limit == 20, "user limit defaults to 20")?;
        ensure(config.concurrency.max_concurrent == 100, "max concurrent defaults to 100")?;
        ensure(config.concurrency.max_queue_size == 50, "queue size defaults to 50")?;
        ensure(
            config.timeouts.budgets_ms.get(OperationType::NlpService) == &8_000,
            "nlp budget defaults to 8s",
        )?;
        ensure(config.chat.bot_token.is_none(), "no bot token by default")?;
        ensure(config.circuit_for(PRICING_API).failure_threshold == 3, "pricing api trips at 3")?;
        Ok(())
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_PRICEBOT_TOKEN", "12345:from-env");
        env::set_var("TEST_PRICEBOT_NLP_KEY", "nlp-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = write_config(
                &dir,
                r#"
[chat]
bot_token = "${TEST_PRICEBOT_TOKEN}"
locale = "es"

[services]
nlp_api_key = "${TEST_PRICEBOT_NLP_KEY}"
"#,
            )?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.chat.bot_token.as_ref().map(|token| token.expose_secret())
                    == Some("12345:from-env"),
                "bot token should be interpolated from environment",
            )?;
            ensure(
                config.services.nlp_api_key.as_ref().map(|key| key.expose_secret())
                    == Some("nlp-from-env"),
                "nlp key should be interpolated from environment",
            )?;
            ensure(config.chat.locale == Locale::Es, "locale should come from the file")?;
            Ok(())
        })();

        clear_vars(&["TEST_PRICEBOT_TOKEN", "TEST_PRICEBOT_NLP_KEY"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = write_config(&dir, "[chat]\nbot_token = \"${PRICEBOT_TEST_UNSET_VAR}\"\n")?;

        let error =
            match AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
            {
                Ok(_) => return Err("expected interpolation failure".to_string()),
                Err(error) => error,
            };
        ensure(
            matches!(
                error,
                ConfigError::MissingEnvInterpolation { ref var } if var == "PRICEBOT_TEST_UNSET_VAR"
            ),
            "missing variable should be named",
        )
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PRICEBOT_STORE_URL", "sqlite://from-env.db");
        env::set_var("PRICEBOT_MAX_CONCURRENT", "40");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = write_config(
                &dir,
                r#"
[store]
url = "sqlite://from-file.db"

[concurrency]
max_concurrent = 10
max_queue_size = 5
overflow_policy = "drop_oldest"

[logging]
level = "warn"
"#,
            )?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    store_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.store.url == "sqlite://from-override.db",
                "override store url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.concurrency.max_concurrent == 40, "env should win over the file")?;
            ensure(config.concurrency.max_queue_size == 5, "file should win over defaults")?;
            ensure(
                config.concurrency.overflow_policy == OverflowPolicy::DropOldest,
                "overflow policy should come from the file",
            )?;
            Ok(())
        })();

        clear_vars(&["PRICEBOT_STORE_URL", "PRICEBOT_MAX_CONCURRENT"]);
        result
    }

    #[test]
    fn circuit_overrides_merge_with_dependency_defaults() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = write_config(
            &dir,
            r#"
[circuit]
state_ttl_secs = 600

[circuit.dependencies.nlp_service]
cooldown_ms = 90000

[timeouts]
price_lookup_ms = 1500
max_attempts = 2
"#,
        )?;

        let config =
            AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                .map_err(|err| format!("config load failed: {err}"))?;

        let nlp = config.circuit_for(NLP_SERVICE);
        ensure(nlp.cooldown_ms == 90_000, "cooldown override applies")?;
        ensure(nlp.failure_threshold == 5, "unset fields keep the nlp defaults")?;
        ensure(config.circuit.state_ttl_secs == 600, "state ttl from file")?;
        ensure(
            config.timeouts.budgets_ms.get(OperationType::PriceLookup) == &1_500,
            "price lookup budget from file",
        )?;
        ensure(config.timeouts.default_max_attempts == 2, "attempts from file")
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PRICEBOT_LOG_LEVEL", "warn");
        env::set_var("PRICEBOT_LOG_FORMAT", "json");
        env::set_var("PRICEBOT_STORE_BACKEND", "memory");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            ensure(config.store.backend == StoreBackend::Memory, "backend from env")?;
            Ok(())
        })();

        clear_vars(&["PRICEBOT_LOG_LEVEL", "PRICEBOT_LOG_FORMAT", "PRICEBOT_STORE_BACKEND"]);
        result
    }

    #[test]
    fn invalid_numeric_env_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PRICEBOT_RATE_LIMIT_USER", "twenty");
        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("expected env parse failure".to_string()),
            Err(error) => ensure(
                matches!(
                    error,
                    ConfigError::InvalidEnvOverride { ref key, .. }
                        if key == "PRICEBOT_RATE_LIMIT_USER"
                ),
                "bad value should name the variable",
            ),
        };

        clear_vars(&["PRICEBOT_RATE_LIMIT_USER"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PRICEBOT_CHAT_BOT_TOKEN", "not-a-bot-token");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("chat.bot_token")
            );
            ensure(has_message, "validation failure should mention chat.bot_token")
        })();

        clear_vars(&["PRICEBOT_CHAT_BOT_TOKEN"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("PRICEBOT_CHAT_BOT_TOKEN", "999:super-secret-value");
        env::set_var("PRICEBOT_NLP_API_KEY", "nlp-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("super-secret-value"),
                "debug output should not contain bot token",
            )?;
            ensure(!debug.contains("nlp-secret-value"), "debug output should not contain nlp key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["PRICEBOT_CHAT_BOT_TOKEN", "PRICEBOT_NLP_API_KEY"]);
        result
    }
}
