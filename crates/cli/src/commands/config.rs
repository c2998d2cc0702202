use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use toml::Value;

use tollgate_core::config::{AppConfig, LoadOptions};

use crate::commands::{load_config, CommandResult};

pub fn run(options: &LoadOptions) -> CommandResult {
    let config = match load_config("config", options) {
        Ok(config) => config,
        Err(result) => return result,
    };

    let config_file_path = detect_config_path(options.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_keys) in entries(&config) {
        let source =
            field_source(key, &env_keys, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key, &value, source));
    }

    CommandResult::success("config", lines.join("\n"))
}

fn entries(config: &AppConfig) -> Vec<(&'static str, String, Vec<&'static str>)> {
    let signing_key = match &config.audit.signing_key {
        Some(key) => redact_secret(key.expose_secret()),
        None => "<unset>".to_string(),
    };

    vec![
        ("database.url", config.database.url.clone(), vec!["TOLLGATE_DATABASE_URL"]),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            vec!["TOLLGATE_DATABASE_MAX_CONNECTIONS"],
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            vec!["TOLLGATE_DATABASE_TIMEOUT_SECS"],
        ),
        ("memory.backend", format!("{:?}", config.memory.backend), vec!["TOLLGATE_MEMORY_BACKEND"]),
        ("memory.embedding_dimensions", config.memory.embedding_dimensions.to_string(), Vec::new()),
        (
            "memory.similarity_threshold",
            config.memory.similarity_threshold.to_string(),
            vec!["TOLLGATE_MEMORY_SIMILARITY_THRESHOLD"],
        ),
        (
            "memory.max_examples",
            config.memory.max_examples.to_string(),
            vec!["TOLLGATE_MEMORY_MAX_EXAMPLES"],
        ),
        ("memory.adaptive", config.memory.adaptive.to_string(), vec!["TOLLGATE_MEMORY_ADAPTIVE"]),
        ("memory.replay_threshold", config.memory.replay_threshold.to_string(), Vec::new()),
        ("audit.sink", format!("{:?}", config.audit.sink), vec!["TOLLGATE_AUDIT_SINK"]),
        (
            "audit.jsonl_path",
            config.audit.jsonl_path.display().to_string(),
            vec!["TOLLGATE_AUDIT_JSONL_PATH"],
        ),
        ("audit.signing_key", signing_key, vec!["TOLLGATE_AUDIT_SIGNING_KEY"]),
        (
            "audit.log_all_tools",
            config.audit.log_all_tools.to_string(),
            vec!["TOLLGATE_AUDIT_LOG_ALL_TOOLS"],
        ),
        (
            "routing.quota_messages",
            config.routing.quota_messages.to_string(),
            vec!["TOLLGATE_ROUTING_QUOTA_MESSAGES"],
        ),
        (
            "routing.quota_window_secs",
            config.routing.quota_window_secs.to_string(),
            vec!["TOLLGATE_ROUTING_QUOTA_WINDOW_SECS"],
        ),
        (
            "identity.default_email",
            config.identity.default_email.clone(),
            vec!["TOLLGATE_IDENTITY_DEFAULT_EMAIL"],
        ),
        ("identity.default_group", config.identity.default_group.clone(), Vec::new()),
        (
            "identity.admin_emails",
            if config.identity.admin_emails.is_empty() {
                "<none>".to_string()
            } else {
                config.identity.admin_emails.join(", ")
            },
            vec!["TOLLGATE_IDENTITY_ADMIN_EMAILS"],
        ),
        (
            "logging.level",
            config.logging.level.clone(),
            vec!["TOLLGATE_LOGGING_LEVEL", "TOLLGATE_LOG_LEVEL"],
        ),
        (
            "logging.format",
            format!("{:?}", config.logging.format),
            vec!["TOLLGATE_LOGGING_FORMAT", "TOLLGATE_LOG_FORMAT"],
        ),
    ]
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    [PathBuf::from("tollgate.toml"), PathBuf::from("config/tollgate.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
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

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_secret(secret: &str) -> String {
    if secret.trim().is_empty() {
        "<empty>".to_string()
    } else {
        "<redacted>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{contains_path, redact_secret};

    #[test]
    fn nested_keys_are_located_in_the_file_document() {
        let doc: toml::Value = "[audit]\nsink = \"jsonl\"\n".parse().expect("toml");
        assert!(contains_path(&doc, "audit.sink"));
        assert!(!contains_path(&doc, "audit.signing_key"));
        assert!(!contains_path(&doc, "routing.quota_messages"));
    }

    #[test]
    fn secrets_never_render_their_value() {
        assert_eq!(redact_secret("chain-key"), "<redacted>");
        assert_eq!(redact_secret("  "), "<empty>");
    }
}
