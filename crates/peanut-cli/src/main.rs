//! Peanut CLI
//!
//! Command-line interface for the Peanut chat bot

mod logging;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use peanut_config::Config;
use peanut_core::PeanutRuntime;
use peanut_ipc::EventBus;
use peanut_providers::{Backend, BackendConfig, GeminiClient, FALLBACK_SYSTEM_INSTRUCTION};
use peanut_telegram::TelegramAdapter;
use peanut_weather::{WeatherClient, WeatherSource};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

const PID_FILE: &str = "peanut.pid";
const CONFIG_TEMPLATE: &str = include_str!("../../../config/config.example.toml");

#[derive(Parser)]
#[command(name = "peanut")]
#[command(about = "Telegram chat bot backed by Gemini", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot in the foreground
    Start,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Test connections and credentials
    Test {
        #[command(subcommand)]
        action: TestCommands,
    },

    /// Log management commands
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },

    /// Show version
    Version,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the example configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show current configuration with secrets redacted
    Show,
    /// Validate configuration
    Validate,
}

#[derive(Subcommand)]
enum TestCommands {
    /// Test the Gemini API key
    Backend,
    /// Test the Telegram bot token
    Telegram,
}

#[derive(Subcommand)]
enum LogCommands {
    /// Show log files and sizes
    List,
    /// Delete logs older than 7 days
    Clean,
    /// Print the current log file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(cli.config.as_deref())?;
            config.validate_for_start()?;
            let data_dir = config.data_dir();
            fs::create_dir_all(&data_dir)?;

            let pid_path = data_dir.join(PID_FILE);
            let current_pid = std::process::id();
            if let Some(running_pid) = check_running(&pid_path)? {
                if running_pid != current_pid {
                    return Err(anyhow!("Peanut is already running (PID: {})", running_pid));
                }
            }

            let log_level = config
                .core
                .log_level
                .clone()
                .filter(|_| cli.log_level == "info")
                .unwrap_or(cli.log_level);
            let _logging_guard = logging::init_logging(&data_dir.join("logs"), &log_level)?;

            write_pid_file(&pid_path, current_pid)?;
            info!("Starting Peanut in foreground...");
            let run_result = run_bot(config).await;
            clear_pid_file_if_owned(&pid_path, current_pid);
            run_result?;
        }

        Commands::Config { action } => match action {
            ConfigCommands::Init { force } => {
                create_default_config(cli.config.as_deref(), force)?;
            }
            ConfigCommands::Show => match load_config(cli.config.as_deref()) {
                Ok(config) => {
                    println!("Current configuration:");
                    println!("{}", serde_json::to_string_pretty(&redacted_config(&config)?)?);
                }
                Err(e) => eprintln!("Error loading config: {}", e),
            },
            ConfigCommands::Validate => match load_config(cli.config.as_deref()) {
                Ok(config) => match config.validate_for_start() {
                    Ok(()) => println!("Configuration is valid."),
                    Err(e) => println!("Configuration is valid but cannot start yet: {}", e),
                },
                Err(e) => eprintln!("Configuration is invalid: {}", e),
            },
        },

        Commands::Test { action } => {
            let config = load_config(cli.config.as_deref())?;
            match action {
                TestCommands::Backend => {
                    println!("Testing Gemini backend...\n");
                    test_backend(&config).await?;
                }
                TestCommands::Telegram => {
                    println!("Testing Telegram bot connection...\n");
                    test_telegram(&config).await?;
                }
            }
        }

        Commands::Logs { action } => {
            let config = load_config(cli.config.as_deref())?;
            let manager = logging::LogManager::new(config.data_dir().join("logs"));
            match action {
                LogCommands::List => {
                    let files = manager.log_files()?;
                    println!(
                        "Log files ({} total):\n",
                        logging::LogManager::format_size(manager.total_size()?)
                    );
                    for file in files {
                        let metadata = fs::metadata(&file)?;
                        let modified: chrono::DateTime<chrono::Local> = metadata.modified()?.into();
                        println!(
                            "  {} ({}, modified {})",
                            file.file_name()
                                .map(|n| n.to_string_lossy().to_string())
                                .unwrap_or_default(),
                            logging::LogManager::format_size(metadata.len()),
                            modified.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                LogCommands::Clean => {
                    let deleted = manager.cleanup_old_logs()?;
                    println!("Cleaned {} old log file(s)", deleted);
                }
                LogCommands::Path => {
                    println!("{}", manager.current_log_path().display());
                    println!("(directory: {})", manager.log_dir().display());
                }
            }
        }

        Commands::Version => {
            println!("peanut {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn build_backend(config: &Config) -> Result<GeminiClient> {
    let provider = &config.provider;
    GeminiClient::new(
        provider.api_key.clone(),
        provider.effective_base_url(),
        BackendConfig {
            model: provider.model.clone(),
            temperature: provider.temperature,
            top_p: provider.top_p,
            max_output_tokens: provider.max_output_tokens,
            system_instruction: FALLBACK_SYSTEM_INSTRUCTION.to_string(),
        },
        provider.timeout_secs.map(Duration::from_secs),
    )
}

fn build_weather(config: &Config) -> Option<Arc<dyn WeatherSource>> {
    let weather = config
        .weather
        .as_ref()
        .filter(|w| !w.api_key.trim().is_empty())?;
    Some(Arc::new(WeatherClient::new(
        weather.api_key.clone(),
        weather.effective_base_url(),
        weather.lang.clone(),
    )))
}

async fn run_bot(config: Config) -> Result<()> {
    let telegram = config
        .telegram
        .clone()
        .ok_or_else(|| anyhow!("telegram section missing"))?;

    let bus = EventBus::new();
    let adapter = Arc::new(
        TelegramAdapter::new(&telegram, config.data_dir())?.with_event_bus(bus.clone()),
    );
    let backend = Arc::new(build_backend(&config)?);
    let weather = build_weather(&config);
    if weather.is_none() {
        warn!("Weather API key not configured, /weather is disabled");
    }

    let runtime = PeanutRuntime::new(config, backend, adapter.clone(), weather).await?;

    let poller = {
        let adapter = Arc::clone(&adapter);
        tokio::spawn(async move { adapter.poll().await })
    };

    let result = tokio::select! {
        result = runtime.run(&bus) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
        joined = poller => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Telegram polling stopped: {}", e);
                Err(e)
            }
            Err(e) => Err(anyhow!("Telegram polling task failed: {}", e)),
        },
    };

    info!("Peanut stopped");
    result
}

async fn test_backend(config: &Config) -> Result<()> {
    if config.provider.api_key.trim().is_empty() {
        println!("  ✗ No provider API key configured.");
        return Ok(());
    }
    let backend = build_backend(config)?;
    match backend.health_check().await {
        Ok(true) => println!("  ✓ SUCCESS: {} reachable ({})", backend.name(), config.provider.model),
        Ok(false) => println!("  ✗ FAILED: backend rejected the API key"),
        Err(e) => println!("  ✗ FAILED: {}", e),
    }
    Ok(())
}

async fn test_telegram(config: &Config) -> Result<()> {
    let Some(telegram) = config
        .telegram
        .as_ref()
        .filter(|tg| !tg.bot_token.trim().is_empty())
    else {
        println!("  ✗ No Telegram bot token configured.");
        return Ok(());
    };
    let adapter = TelegramAdapter::new(telegram, config.data_dir())?;
    match adapter.get_me().await {
        Ok(me) => println!(
            "  ✓ SUCCESS: @{} (id {})",
            me.username.unwrap_or_else(|| "unknown".to_string()),
            me.id
        ),
        Err(e) => println!("  ✗ FAILED: {}", e),
    }
    Ok(())
}

fn config_path(config_path: Option<&str>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::default_path().ok_or_else(|| anyhow!("No config directory available")),
    }
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let path = config_path(path)?;
    Config::load(&path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn create_default_config(path: Option<&str>, force: bool) -> Result<()> {
    let path = config_path(path)?;
    if path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, CONFIG_TEMPLATE)?;

    println!("Configuration created at: {}", path.display());
    println!("\nEdit the file to add your Telegram token and Gemini API key.");
    Ok(())
}

fn redacted_config(config: &Config) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(config)?;

    for pointer in [
        "/telegram/bot_token",
        "/provider/api_key",
        "/weather/api_key",
    ] {
        if let Some(secret) = value.pointer_mut(pointer) {
            if secret.as_str().is_some_and(|s| !s.is_empty()) {
                *secret = json!("***REDACTED***");
            }
        }
    }

    Ok(value)
}

fn write_pid_file(pid_path: &Path, pid: u32) -> Result<()> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    fs::write(pid_path, format!("{}\n{}", pid, timestamp))?;
    Ok(())
}

fn clear_pid_file_if_owned(pid_path: &Path, pid: u32) {
    let Ok(content) = fs::read_to_string(pid_path) else {
        return;
    };
    let owner_pid = content
        .lines()
        .next()
        .and_then(|value| value.trim().parse::<u32>().ok());
    if owner_pid == Some(pid) {
        let _ = fs::remove_file(pid_path);
    }
}

fn check_running(pid_path: &Path) -> Result<Option<u32>> {
    if !pid_path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(pid_path)?;
    let Some(pid) = content
        .lines()
        .next()
        .and_then(|s| s.trim().parse::<u32>().ok())
    else {
        return Ok(None);
    };

    Ok(is_process_running(pid).then_some(pid))
}

fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid)])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}
