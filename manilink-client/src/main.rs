use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use clap::{Args, Parser, Subcommand};
use manilink_client::{
    BoundedRequest, DeliveryOrchestrator, DeliveryTarget, LinkEncoder, NotificationBoard,
    settings::{
        ClientSettings, load_settings, load_settings_or_default, save_settings_with_retry,
        settings_path,
    },
};
use manilink_core::{ConfigBuilder, Preferences, decode_local};
use tracing::{error, info};
use tracing_subscriber::fmt::MakeWriter;

const MAX_PREFERENCES_BYTES: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "manilink", version, about = "Generate and deliver addon manifest links")]
struct CliArgs {
    /// Settings file (defaults to the per-user config directory).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Overrides the addon server origin, e.g. https://addon.example.com
    #[arg(long, global = true)]
    origin: Option<String>,
    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the manifest link in the native app.
    Install(IntentArgs),
    /// Open the manifest link in the web app.
    InstallWeb(IntentArgs),
    /// Copy the manifest link to the clipboard.
    Copy(IntentArgs),
    /// Print the configuration carried by a locally-encoded segment.
    Decode { segment: String },
    /// Write the effective settings to the settings file.
    SaveSettings,
}

#[derive(Args, Debug)]
struct IntentArgs {
    /// JSON preferences; missing fields take the defaults.
    #[arg(long)]
    preferences: Option<PathBuf>,
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging(args.log_file.as_deref());

    let settings = match resolve_settings(&args) {
        Ok(settings) => settings,
        Err(err) => {
            error!("settings resolution failed: {}", err);
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let code = match args.command {
        Command::Install(intent) => run_intent(&settings, DeliveryTarget::Native, &intent).await,
        Command::InstallWeb(intent) => run_intent(&settings, DeliveryTarget::Web, &intent).await,
        Command::Copy(intent) => run_intent(&settings, DeliveryTarget::Clipboard, &intent).await,
        Command::Decode { segment } => decode_segment(&segment),
        Command::SaveSettings => {
            let path = args.settings.clone().unwrap_or_else(settings_path);
            match save_settings_with_retry(&path, &settings) {
                Ok(()) => {
                    info!("settings saved to {}", path.display());
                    println!("{}", path.display());
                    0
                }
                Err(err) => {
                    eprintln!("failed to save settings {}: {err}", path.display());
                    1
                }
            }
        }
    };
    std::process::exit(code);
}

fn resolve_settings(args: &CliArgs) -> Result<ClientSettings, String> {
    let mut settings = match (args.settings.as_deref(), &args.command) {
        // A new target file for save-settings starts from the current settings.
        (Some(path), Command::SaveSettings) if !path.exists() => load_settings(),
        (Some(path), _) => load_settings_or_default(path)
            .map_err(|err| format!("failed to load settings {}: {err}", path.display()))?,
        (None, _) => load_settings(),
    };
    if let Some(origin) = &args.origin {
        settings.origin = origin.clone();
    }
    settings.validate()?;
    Ok(settings)
}

fn load_preferences(path: Option<&Path>) -> Result<Preferences, String> {
    let Some(path) = path else {
        return Ok(Preferences::default());
    };
    let meta = std::fs::metadata(path)
        .map_err(|err| format!("failed to read preferences {}: {err}", path.display()))?;
    if meta.len() > MAX_PREFERENCES_BYTES {
        return Err(format!(
            "preferences file too large: {} bytes (max {MAX_PREFERENCES_BYTES})",
            meta.len()
        ));
    }
    let data = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read preferences {}: {err}", path.display()))?;
    serde_json::from_str(&data)
        .map_err(|err| format!("failed to parse preferences {}: {err}", path.display()))
}

async fn run_intent(
    settings: &ClientSettings,
    target: DeliveryTarget,
    intent: &IntentArgs,
) -> i32 {
    let preferences = match load_preferences(intent.preferences.as_deref()) {
        Ok(preferences) => preferences,
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };
    let builder = ConfigBuilder::from_preferences(preferences);

    let (endpoint, delivery) = match (settings.encrypt_endpoint(), settings.delivery_settings()) {
        (Ok(endpoint), Ok(delivery)) => (endpoint, delivery),
        (Err(err), _) | (_, Err(err)) => {
            eprintln!("{err}");
            return 2;
        }
    };

    let board = NotificationBoard::new(settings.notification_auto_close())
        .with_observer(|record| eprintln!("[{}] {}", record.phase, record.message));
    let encoder = LinkEncoder::new(BoundedRequest::new(settings.request_timeout()), endpoint);
    let orchestrator = DeliveryOrchestrator::new(encoder, delivery).with_notifier(Arc::new(board));

    let outcome = orchestrator.deliver_from(target, &builder).await;
    if let Some(manual) = orchestrator.manual_fallback() {
        eprintln!("Open or copy this link manually:");
        println!("{manual}");
    } else if let Some(manifest) = &outcome.manifest {
        println!("{manifest}");
    }

    if outcome.success { 0 } else { 1 }
}

fn decode_segment(segment: &str) -> i32 {
    let config = match decode_local(segment) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    };
    match serde_json::to_string_pretty(&config) {
        Ok(json) => {
            println!("{json}");
            0
        }
        Err(err) => {
            eprintln!("{err}");
            1
        }
    }
}

fn init_logging(log_file: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .init();
}
