pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::memory::RecordKind;
use tollgate_core::config::{AppConfig, LoadOptions};

#[derive(Debug, Parser)]
#[command(
    name = "tollgate",
    about = "Tollgate operator CLI",
    long_about = "Operate the tollgate request-mediation stack: migrations, memory seeding, \
                  audit trail reports and config inspection.",
    after_help = "Examples:\n  tollgate migrate\n  \
                  tollgate seed --file seeds/finance.toml --clear\n  \
                  tollgate audit verify --log logs/audit.jsonl\n  \
                  tollgate memory search-usage \"monthly revenue\""
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a tollgate.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load usage examples and text memories from a TOML seed file")]
    Seed {
        #[arg(long, help = "Seed file with [[usage]] and [[text]] tables")]
        file: PathBuf,
        #[arg(long, help = "Remove all stored memories before seeding")]
        clear: bool,
    },
    #[command(subcommand, about = "Report on, export from, or verify a JSONL audit trail")]
    Audit(AuditCommand),
    #[command(subcommand, about = "Search or list stored memories")]
    Memory(MemoryCommand),
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    #[command(about = "Summarize tool outcomes, failures and principals")]
    Summary {
        #[arg(long, help = "Audit log path (defaults to audit.jsonl_path)")]
        log: Option<PathBuf>,
    },
    #[command(about = "Export successful tool usages as a seed file")]
    Export {
        #[arg(long, help = "Audit log path (defaults to audit.jsonl_path)")]
        log: Option<PathBuf>,
        #[arg(long, default_value = "run_sql")]
        tool: String,
        #[arg(long, help = "Write the seed file here instead of printing it")]
        output: Option<PathBuf>,
    },
    #[command(about = "Verify the hash chain and signatures of an audit log")]
    Verify {
        #[arg(long, help = "Audit log path (defaults to audit.jsonl_path)")]
        log: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
enum MemoryCommand {
    #[command(about = "Find stored tool usages similar to a question")]
    SearchUsage {
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        #[arg(long, help = "Similarity threshold (defaults to memory.similarity_threshold)")]
        threshold: Option<f32>,
        #[arg(long)]
        tool: Option<String>,
    },
    #[command(about = "Find text memories similar to a query")]
    SearchText {
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        #[arg(long)]
        threshold: Option<f32>,
    },
    #[command(about = "List the most recent memories")]
    Recent {
        #[arg(long, value_enum, default_value = "text")]
        kind: RecordKind,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = LoadOptions {
        config_path: cli.config.clone(),
        require_file: cli.config.is_some(),
        ..LoadOptions::default()
    };

    let logging = AppConfig::load(options.clone()).unwrap_or_default();
    init_logging(&logging);

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(&options),
        Command::Seed { file, clear } => commands::seed::run(&options, &file, clear),
        Command::Audit(AuditCommand::Summary { log }) => {
            commands::audit::summary(&options, log.as_deref())
        }
        Command::Audit(AuditCommand::Export { log, tool, output }) => {
            commands::audit::export(&options, log.as_deref(), &tool, output.as_deref())
        }
        Command::Audit(AuditCommand::Verify { log }) => {
            commands::audit::verify(&options, log.as_deref())
        }
        Command::Memory(MemoryCommand::SearchUsage { query, limit, threshold, tool }) => {
            commands::memory::search_usage(&options, &query, limit, threshold, tool.as_deref())
        }
        Command::Memory(MemoryCommand::SearchText { query, limit, threshold }) => {
            commands::memory::search_text(&options, &query, limit, threshold)
        }
        Command::Memory(MemoryCommand::Recent { kind, limit }) => {
            commands::memory::recent(&options, kind, limit)
        }
        Command::Config => commands::config::run(&options),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Logs go to stderr so stdout carries only the command payload.
fn init_logging(config: &AppConfig) {
    use tracing::Level;
    use tollgate_core::config::LogFormat::*;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    let _ = match config.logging.format {
        Compact => builder.compact().try_init(),
        Pretty => builder.pretty().try_init(),
        Json => builder.json().try_init(),
    };
}
