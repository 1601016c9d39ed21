use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arcferry_core::{
    APP_NAME, JobOptions, JobSpec, ProgressSink, ProgressUpdate, Selection, Settings,
    TelegramBotApiStore, TelegramBotApiStoreConfig, run_job_with,
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "arcferry")]
#[command(about = "Archive-to-Telegram backup pipeline", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    /// Emit ndjson progress events on stdout instead of plain text.
    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    Telegram {
        #[command(subcommand)]
        cmd: TelegramCmd,
    },
    Run {
        /// Share link or direct URL of the ZIP archive.
        #[arg(long)]
        url: String,
        /// Destination chat; overrides the configured one.
        #[arg(long)]
        chat_id: Option<String>,
        /// Parent directory for the job's working directory.
        #[arg(long)]
        work_dir: Option<PathBuf>,
        #[arg(long)]
        no_photos: bool,
        #[arg(long)]
        no_videos: bool,
        #[arg(long)]
        no_gifs: bool,
        #[arg(long)]
        no_documents: bool,
        #[arg(long)]
        no_other: bool,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    Set,
}

#[derive(Subcommand)]
enum TelegramCmd {
    Validate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Config {
    telegram: Telegram,
    /// Parent for per-job working directories; defaults to the system
    /// temp directory.
    work_dir: Option<PathBuf>,
    #[serde(default)]
    pipeline: Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Telegram {
    chat_id: String,
    /// Environment variable holding the bot token.
    bot_token_env: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram: Telegram {
                chat_id: "".to_string(),
                bot_token_env: "ARCFERRY_BOT_TOKEN".to_string(),
            },
            work_dir: None,
            pipeline: Settings::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: true,
        }
    }
}

struct NdjsonProgressSink;

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: &ProgressUpdate) {
        let line = serde_json::json!({
            "type": "job.progress",
            "phase": p.phase.label(),
            "current": p.current,
            "total": p.total,
            "elapsedMs": p.elapsed.as_millis() as u64,
        });
        println!("{line}");
    }
}

struct ConsoleProgressSink;

impl ProgressSink for ConsoleProgressSink {
    fn on_progress(&self, p: &ProgressUpdate) {
        match p.total {
            Some(total) if total > 0 => {
                let pct = p.current as f64 / total as f64 * 100.0;
                eprintln!("{} {pct:.1}% ({}/{})", p.phase.label(), p.current, total);
            }
            _ => eprintln!("{} {}", p.phase.label(), p.current),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var("ARCFERRY_CONFIG_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);

    match cli.cmd {
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, cli.json),
            SettingsCmd::Set => settings_set(&config_dir, cli.json),
        },
        Command::Telegram { cmd } => match cmd {
            TelegramCmd::Validate => telegram_validate(&config_dir, cli.json).await,
        },
        Command::Run {
            url,
            chat_id,
            work_dir,
            no_photos,
            no_videos,
            no_gifs,
            no_documents,
            no_other,
        } => {
            let selection = Selection {
                photos: !no_photos,
                videos: !no_videos,
                gifs: !no_gifs,
                documents: !no_documents,
                other: !no_other,
            };
            job_run(
                &config_dir,
                url,
                chat_id,
                work_dir,
                selection,
                cli.json,
                cli.events,
            )
            .await
        }
    }
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let config = load_config(config_dir)?;
    if json {
        println!(
            "{}",
            serde_json::to_string(&config)
                .map_err(|e| CliError::new("config.invalid", e.to_string()))?
        );
    } else {
        let text = toml::to_string(&config)
            .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn settings_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let config: Config =
        toml::from_str(&input).map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    config
        .pipeline
        .validate()
        .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    save_config(config_dir, &config)?;

    if json {
        println!(
            "{}",
            serde_json::to_string(&config)
                .map_err(|e| CliError::new("config.invalid", e.to_string()))?
        );
    }
    Ok(())
}

async fn telegram_validate(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let config = load_config(config_dir)?;
    if config.telegram.chat_id.is_empty() {
        return Err(CliError::new("config.invalid", "telegram.chat_id is empty"));
    }
    let token = bot_token(&config)?;

    let client = reqwest::Client::new();
    let base = format!("https://api.telegram.org/bot{token}");

    let me: TelegramResponse<TelegramMeResult> = client
        .get(format!("{base}/getMe"))
        .send()
        .await
        .map_err(|e| CliError::retryable("telegram.unavailable", format!("getMe failed: {e}")))?
        .json()
        .await
        .map_err(|e| CliError::new("telegram.unavailable", format!("getMe json failed: {e}")))?;
    if !me.ok {
        return Err(CliError::new(
            "telegram.unauthorized",
            me.description
                .unwrap_or_else(|| "telegram returned ok=false".to_string()),
        ));
    }
    let bot_username = me.result.and_then(|r| r.username).unwrap_or_default();

    let chat: TelegramResponse<TelegramChatResult> = client
        .get(format!("{base}/getChat"))
        .query(&[("chat_id", config.telegram.chat_id.clone())])
        .send()
        .await
        .map_err(|e| CliError::retryable("telegram.unavailable", format!("getChat failed: {e}")))?
        .json()
        .await
        .map_err(|e| CliError::new("telegram.unavailable", format!("getChat json failed: {e}")))?;
    if !chat.ok {
        let msg = chat
            .description
            .unwrap_or_else(|| "telegram returned ok=false".to_string());
        return Err(CliError::new("telegram.chat_not_found", msg));
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "botUsername": bot_username,
                "chatId": config.telegram.chat_id,
            })
        );
    } else {
        println!("botUsername={bot_username}");
        println!("chatId={}", config.telegram.chat_id);
    }
    Ok(())
}

async fn job_run(
    config_dir: &Path,
    url: String,
    chat_id: Option<String>,
    work_dir: Option<PathBuf>,
    selection: Selection,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let config = load_config(config_dir)?;
    let chat_id = chat_id.unwrap_or_else(|| config.telegram.chat_id.clone());
    if chat_id.is_empty() {
        return Err(CliError::new("config.invalid", "telegram.chat_id is empty"));
    }
    let token = bot_token(&config)?;

    let work_root = work_dir
        .or_else(|| config.work_dir.clone())
        .unwrap_or_else(std::env::temp_dir);

    let store = TelegramBotApiStore::new(TelegramBotApiStoreConfig::new(token));
    let progress: Arc<dyn ProgressSink> = if events {
        Arc::new(NdjsonProgressSink)
    } else {
        Arc::new(ConsoleProgressSink)
    };
    let options = JobOptions {
        progress: Some(progress),
        media_tool: None,
    };

    let result = run_job_with(
        &store,
        &config.pipeline,
        JobSpec {
            url,
            chat_id,
            work_root,
            selection,
        },
        options,
    )
    .await
    .map_err(map_core_err)?;

    if json {
        println!(
            "{}",
            serde_json::to_string(&result)
                .map_err(|e| CliError::new("config.invalid", e.to_string()))?
        );
    } else {
        let stats = &result.stats;
        println!("jobId={}", result.job_id);
        println!(
            "uploaded={}/{} compressed={} skipped={} successRate={:.1}%",
            stats.uploaded,
            stats.total_candidates,
            stats.compressed,
            stats.skipped,
            stats.success_rate()
        );
        println!(
            "downloadMs={} extractMs={} processMs={}",
            stats.download_ms, stats.extract_ms, stats.process_ms
        );
    }
    Ok(())
}

fn bot_token(config: &Config) -> Result<String, CliError> {
    let var = &config.telegram.bot_token_env;
    match std::env::var(var) {
        Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
        _ => Err(CliError::new(
            "telegram.unauthorized",
            format!("bot token missing; set ${var}"),
        )),
    }
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join(APP_NAME)
}

fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

fn load_config(config_dir: &Path) -> Result<Config, CliError> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let config: Config =
        toml::from_str(&text).map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    Ok(config)
}

fn save_config(config_dir: &Path, config: &Config) -> Result<(), CliError> {
    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CliError::new("config.write_failed", e.to_string()))?;
    }
    let text =
        toml::to_string(config).map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    atomic_write(&path, text.as_bytes())
        .map_err(|e| CliError::new("config.write_failed", e.to_string()))?;
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

fn map_core_err(e: arcferry_core::Error) -> CliError {
    match e {
        arcferry_core::Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        arcferry_core::Error::Transport { message } => {
            CliError::retryable("download.unavailable", message)
        }
        arcferry_core::Error::Validation { message } => {
            CliError::new("download.invalid_archive", message)
        }
        arcferry_core::Error::Extraction { message } => CliError::new("extract.failed", message),
        arcferry_core::Error::Transcode { message } => CliError::new("transcode.failed", message),
        arcferry_core::Error::Upload { message } => {
            CliError::retryable("telegram.unavailable", message)
        }
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"retryable\":false}".to_string()
    });
    let _ = writeln!(std::io::stderr(), "{json}");
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    // Omitted entirely on ok=false replies.
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramMeResult {
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChatResult {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_replies_parse_without_result() {
        let reply: TelegramResponse<TelegramMeResult> =
            serde_json::from_str(r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#)
                .unwrap();
        assert!(!reply.ok);
        assert!(reply.result.is_none());
        assert_eq!(reply.description.as_deref(), Some("Unauthorized"));
    }

    #[test]
    fn ok_replies_carry_result() {
        let reply: TelegramResponse<TelegramMeResult> =
            serde_json::from_str(r#"{"ok":true,"result":{"username":"ferrybot"}}"#).unwrap();
        assert!(reply.ok);
        assert_eq!(
            reply.result.and_then(|r| r.username).as_deref(),
            Some("ferrybot")
        );
    }
}
