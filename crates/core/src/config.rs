use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub memory: MemoryConfig,
    pub audit: AuditConfig,
    pub routing: RoutingConfig,
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct MemoryConfig {
    pub backend: MemoryBackend,
    pub embedding_dimensions: usize,
    pub similarity_threshold: f32,
    pub max_examples: usize,
    pub adaptive: bool,
    pub min_threshold: f32,
    pub threshold_step: f32,
    pub min_examples: usize,
    pub replay_threshold: f32,
}

#[derive(Clone, Debug)]
pub struct AuditConfig {
    pub sink: AuditSinkKind,
    pub jsonl_path: PathBuf,
    pub signing_key: Option<SecretString>,
    pub log_all_tools: bool,
}

#[derive(Clone, Debug)]
pub struct RoutingConfig {
    pub quota_messages: u32,
    pub quota_window_secs: u64,
}

#[derive(Clone, Debug)]
pub struct IdentityConfig {
    pub default_email: String,
    pub default_group: String,
    pub admin_emails: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBackend {
    InMemory,
    Sqlite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSinkKind {
    InMemory,
    Jsonl,
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
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub memory_backend: Option<MemoryBackend>,
    pub audit_sink: Option<AuditSinkKind>,
    pub audit_jsonl_path: Option<PathBuf>,
    pub audit_signing_key: Option<String>,
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
            database: DatabaseConfig {
                url: "sqlite://tollgate.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            memory: MemoryConfig {
                backend: MemoryBackend::InMemory,
                embedding_dimensions: 256,
                similarity_threshold: 0.7,
                max_examples: 5,
                adaptive: false,
                min_threshold: 0.3,
                threshold_step: 0.1,
                min_examples: 1,
                replay_threshold: 0.97,
            },
            audit: AuditConfig {
                sink: AuditSinkKind::InMemory,
                jsonl_path: PathBuf::from("logs/audit.jsonl"),
                signing_key: None,
                log_all_tools: true,
            },
            routing: RoutingConfig { quota_messages: 50, quota_window_secs: 3600 },
            identity: IdentityConfig {
                default_email: "guest@example.com".to_string(),
                default_group: "user".to_string(),
                admin_emails: Vec::new(),
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for MemoryBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in_memory" | "memory" => Ok(Self::InMemory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(ConfigError::Validation(format!(
                "unsupported memory backend `{other}` (expected in_memory|sqlite)"
            ))),
        }
    }
}

impl std::str::FromStr for AuditSinkKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in_memory" | "memory" => Ok(Self::InMemory),
            "jsonl" => Ok(Self::Jsonl),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(ConfigError::Validation(format!(
                "unsupported audit sink `{other}` (expected in_memory|jsonl|sqlite)"
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

impl AuditConfig {
    /// Key material for the audit chain; empty when no key is configured.
    pub fn signing_key_bytes(&self) -> Vec<u8> {
        self.signing_key
            .as_ref()
            .map(|key| key.expose_secret().as_bytes().to_vec())
            .unwrap_or_default()
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("tollgate.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(memory) = patch.memory {
            if let Some(backend) = memory.backend {
                self.memory.backend = backend;
            }
            if let Some(embedding_dimensions) = memory.embedding_dimensions {
                self.memory.embedding_dimensions = embedding_dimensions;
            }
            if let Some(similarity_threshold) = memory.similarity_threshold {
                self.memory.similarity_threshold = similarity_threshold;
            }
            if let Some(max_examples) = memory.max_examples {
                self.memory.max_examples = max_examples;
            }
            if let Some(adaptive) = memory.adaptive {
                self.memory.adaptive = adaptive;
            }
            if let Some(min_threshold) = memory.min_threshold {
                self.memory.min_threshold = min_threshold;
            }
            if let Some(threshold_step) = memory.threshold_step {
                self.memory.threshold_step = threshold_step;
            }
            if let Some(min_examples) = memory.min_examples {
                self.memory.min_examples = min_examples;
            }
            if let Some(replay_threshold) = memory.replay_threshold {
                self.memory.replay_threshold = replay_threshold;
            }
        }

        if let Some(audit) = patch.audit {
            if let Some(sink) = audit.sink {
                self.audit.sink = sink;
            }
            if let Some(jsonl_path) = audit.jsonl_path {
                self.audit.jsonl_path = jsonl_path;
            }
            if let Some(signing_key_value) = audit.signing_key {
                self.audit.signing_key = Some(secret_value(signing_key_value));
            }
            if let Some(log_all_tools) = audit.log_all_tools {
                self.audit.log_all_tools = log_all_tools;
            }
        }

        if let Some(routing) = patch.routing {
            if let Some(quota_messages) = routing.quota_messages {
                self.routing.quota_messages = quota_messages;
            }
            if let Some(quota_window_secs) = routing.quota_window_secs {
                self.routing.quota_window_secs = quota_window_secs;
            }
        }

        if let Some(identity) = patch.identity {
            if let Some(default_email) = identity.default_email {
                self.identity.default_email = default_email;
            }
            if let Some(default_group) = identity.default_group {
                self.identity.default_group = default_group;
            }
            if let Some(admin_emails) = identity.admin_emails {
                self.identity.admin_emails = admin_emails;
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
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TOLLGATE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TOLLGATE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("TOLLGATE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("TOLLGATE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TOLLGATE_MEMORY_BACKEND") {
            self.memory.backend = value.parse()?;
        }
        if let Some(value) = read_env("TOLLGATE_MEMORY_SIMILARITY_THRESHOLD") {
            self.memory.similarity_threshold =
                parse_f32("TOLLGATE_MEMORY_SIMILARITY_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_MEMORY_MAX_EXAMPLES") {
            self.memory.max_examples = parse_usize("TOLLGATE_MEMORY_MAX_EXAMPLES", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_MEMORY_ADAPTIVE") {
            self.memory.adaptive = parse_bool("TOLLGATE_MEMORY_ADAPTIVE", &value)?;
        }

        if let Some(value) = read_env("TOLLGATE_AUDIT_SINK") {
            self.audit.sink = value.parse()?;
        }
        if let Some(value) = read_env("TOLLGATE_AUDIT_JSONL_PATH") {
            self.audit.jsonl_path = PathBuf::from(value);
        }
        if let Some(value) = read_env("TOLLGATE_AUDIT_SIGNING_KEY") {
            self.audit.signing_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TOLLGATE_AUDIT_LOG_ALL_TOOLS") {
            self.audit.log_all_tools = parse_bool("TOLLGATE_AUDIT_LOG_ALL_TOOLS", &value)?;
        }

        if let Some(value) = read_env("TOLLGATE_ROUTING_QUOTA_MESSAGES") {
            self.routing.quota_messages = parse_u32("TOLLGATE_ROUTING_QUOTA_MESSAGES", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_ROUTING_QUOTA_WINDOW_SECS") {
            self.routing.quota_window_secs =
                parse_u64("TOLLGATE_ROUTING_QUOTA_WINDOW_SECS", &value)?;
        }

        if let Some(value) = read_env("TOLLGATE_IDENTITY_DEFAULT_EMAIL") {
            self.identity.default_email = value;
        }
        if let Some(value) = read_env("TOLLGATE_IDENTITY_ADMIN_EMAILS") {
            self.identity.admin_emails = value
                .split(',')
                .map(str::trim)
                .filter(|email| !email.is_empty())
                .map(str::to_string)
                .collect();
        }

        let log_level =
            read_env("TOLLGATE_LOGGING_LEVEL").or_else(|| read_env("TOLLGATE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TOLLGATE_LOGGING_FORMAT").or_else(|| read_env("TOLLGATE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(memory_backend) = overrides.memory_backend {
            self.memory.backend = memory_backend;
        }
        if let Some(audit_sink) = overrides.audit_sink {
            self.audit.sink = audit_sink;
        }
        if let Some(audit_jsonl_path) = overrides.audit_jsonl_path {
            self.audit.jsonl_path = audit_jsonl_path;
        }
        if let Some(audit_signing_key) = overrides.audit_signing_key {
            self.audit.signing_key = Some(secret_value(audit_signing_key));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_memory(&self.memory)?;
        validate_audit(&self.audit)?;
        validate_routing(&self.routing)?;
        validate_identity(&self.identity)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("tollgate.toml"), PathBuf::from("config/tollgate.toml")]
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

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_memory(memory: &MemoryConfig) -> Result<(), ConfigError> {
    if memory.embedding_dimensions == 0 {
        return Err(ConfigError::Validation(
            "memory.embedding_dimensions must be greater than zero".to_string(),
        ));
    }

    for (key, value) in [
        ("memory.similarity_threshold", memory.similarity_threshold),
        ("memory.min_threshold", memory.min_threshold),
        ("memory.replay_threshold", memory.replay_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::Validation(format!("{key} must be in range 0.0..=1.0")));
        }
    }

    if memory.min_threshold > memory.similarity_threshold {
        return Err(ConfigError::Validation(
            "memory.min_threshold must not exceed memory.similarity_threshold".to_string(),
        ));
    }

    if memory.threshold_step <= 0.0 || memory.threshold_step > 1.0 {
        return Err(ConfigError::Validation(
            "memory.threshold_step must be in range (0.0, 1.0]".to_string(),
        ));
    }

    if memory.max_examples == 0 {
        return Err(ConfigError::Validation(
            "memory.max_examples must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_audit(audit: &AuditConfig) -> Result<(), ConfigError> {
    if audit.sink != AuditSinkKind::Jsonl {
        return Ok(());
    }

    if audit.jsonl_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "audit.jsonl_path is required when audit.sink = \"jsonl\"".to_string(),
        ));
    }

    let missing_key = audit
        .signing_key
        .as_ref()
        .map(|value| value.expose_secret().trim().is_empty())
        .unwrap_or(true);
    if missing_key {
        return Err(ConfigError::Validation(
            "audit.signing_key is required for the jsonl sink (set TOLLGATE_AUDIT_SIGNING_KEY)"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_routing(routing: &RoutingConfig) -> Result<(), ConfigError> {
    if routing.quota_messages == 0 {
        return Err(ConfigError::Validation(
            "routing.quota_messages must be greater than zero".to_string(),
        ));
    }

    if routing.quota_window_secs == 0 {
        return Err(ConfigError::Validation(
            "routing.quota_window_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_identity(identity: &IdentityConfig) -> Result<(), ConfigError> {
    if identity.default_group.trim().is_empty() {
        return Err(ConfigError::Validation(
            "identity.default_group must not be empty".to_string(),
        ));
    }

    if let Some(bad) = identity.admin_emails.iter().find(|email| !email.contains('@')) {
        return Err(ConfigError::Validation(format!(
            "identity.admin_emails contains `{bad}`, which is not an email address"
        )));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.parse::<f32>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    memory: Option<MemoryPatch>,
    audit: Option<AuditPatch>,
    routing: Option<RoutingPatch>,
    identity: Option<IdentityPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryPatch {
    backend: Option<MemoryBackend>,
    embedding_dimensions: Option<usize>,
    similarity_threshold: Option<f32>,
    max_examples: Option<usize>,
    adaptive: Option<bool>,
    min_threshold: Option<f32>,
    threshold_step: Option<f32>,
    min_examples: Option<usize>,
    replay_threshold: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct AuditPatch {
    sink: Option<AuditSinkKind>,
    jsonl_path: Option<PathBuf>,
    signing_key: Option<String>,
    log_all_tools: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RoutingPatch {
    quota_messages: Option<u32>,
    quota_window_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct IdentityPatch {
    default_email: Option<String>,
    default_group: Option<String>,
    admin_emails: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
