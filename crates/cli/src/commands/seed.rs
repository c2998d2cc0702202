use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use tollgate_core::config::LoadOptions;
use tollgate_core::memory::{ClearFilter, MemoryStore, NewUsage};

use crate::commands::{
    finish, load_config, memory_store, open_database, runtime, CommandResult, Failure,
};

/// On-disk format shared by `seed --file` and `audit export`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedFile {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usage: Vec<SeedUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub text: Vec<SeedText>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeedUsage {
    pub question: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default = "default_success")]
    pub success: bool,
    /// Last so that TOML writes it after the scalar keys.
    #[serde(default)]
    pub args: Map<String, Value>,
}

fn default_success() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeedText {
    pub content: String,
}

impl SeedFile {
    pub fn read(path: &Path) -> Result<Self, Failure> {
        let raw = fs::read_to_string(path).map_err(|error| {
            ("seed_file", format!("could not read `{}`: {error}", path.display()), 6u8)
        })?;
        toml::from_str(&raw).map_err(|error| {
            ("seed_file", format!("could not parse `{}`: {error}", path.display()), 6u8)
        })
    }
}

pub fn run(options: &LoadOptions, file: &Path, clear: bool) -> CommandResult {
    let config = match load_config("seed", options) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let seed = match SeedFile::read(file) {
        Ok(seed) => seed,
        Err((error_class, message, exit_code)) => {
            return CommandResult::failure("seed", error_class, message, exit_code)
        }
    };
    let runtime = match runtime("seed") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let store = memory_store(&config, &pool)?;
        let outcome = load(store.as_ref(), seed, clear).await;
        pool.close().await;
        outcome
    });

    finish("seed", result)
}

async fn load(store: &dyn MemoryStore, seed: SeedFile, clear: bool) -> Result<String, Failure> {
    let failed =
        |error: tollgate_core::memory::MemoryError| ("seed_execution", error.to_string(), 7u8);

    let mut cleared = 0;
    if clear {
        cleared += store.clear_usage(&ClearFilter::default()).await.map_err(failed)?;
        cleared += store.clear_text(None).await.map_err(failed)?;
    }

    let mut per_tool: BTreeMap<String, usize> = BTreeMap::new();
    for usage in &seed.usage {
        let arguments = Value::Object(usage.args.clone());
        let mut new_usage =
            NewUsage::new(usage.question.clone(), usage.tool_name.clone(), arguments)
                .with_metadata("source", Value::String("seed".to_string()));
        if !usage.success {
            new_usage = new_usage.failed();
        }
        if let Some(category) = &usage.category {
            new_usage = new_usage.with_metadata("category", Value::String(category.clone()));
        }
        store.write_usage(new_usage).await.map_err(failed)?;
        *per_tool.entry(usage.tool_name.clone()).or_default() += 1;
    }
    for text in &seed.text {
        store.write_text(&text.content).await.map_err(failed)?;
    }

    info!(
        event_name = "cli.seed.completed",
        usage_records = seed.usage.len(),
        text_records = seed.text.len(),
        cleared,
        "memory seeded"
    );

    let mut message = format!(
        "seeded {} usage record(s) and {} text record(s)",
        seed.usage.len(),
        seed.text.len()
    );
    if clear {
        message.push_str(&format!(" after clearing {cleared} record(s)"));
    }
    for (tool, count) in per_tool {
        message.push_str(&format!("\n  - {tool}: {count}"));
    }
    Ok(message)
}
