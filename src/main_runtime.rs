use botwarden::config::{AppConfig, LoggingConfig};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_file(path)?,
        None => AppConfig::load()?,
    };
    Ok(config)
}

fn default_filter(config: &LoggingConfig) -> EnvFilter {
    let level = config.level.trim();
    if level.is_empty() || level.eq_ignore_ascii_case("info") {
        EnvFilter::new("info,botwarden=debug")
    } else {
        EnvFilter::new(level)
    }
}

/// Preflight the log directory: `tracing_appender::rolling::daily` panics
/// (and aborts in release) when it cannot create the initial file.
fn writable_log_dir(dir: &Path) -> Option<PathBuf> {
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!(
            "Warning: Could not create log directory {} ({}), file logging disabled",
            dir.display(),
            e
        );
        return None;
    }
    let probe = dir.join(".botwarden_write_test");
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            Some(dir.to_path_buf())
        }
        Err(e) => {
            eprintln!(
                "Warning: Could not write to log directory {} ({}), file logging disabled",
                dir.display(),
                e
            );
            None
        }
    }
}

pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config));

    let log_dir = config
        .log_dir
        .clone()
        .or_else(|| std::env::var("WARDEN_LOG_DIR").ok().map(PathBuf::from))
        .and_then(|dir| writable_log_dir(&dir));

    let file_layer = log_dir.as_ref().map(|dir| {
        let file_appender = tracing_appender::rolling::daily(dir, "botwarden.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Flushes on drop; the process lives until exit
        Box::leak(Box::new(guard));
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
    });

    let json_layer = config
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let console_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(dir) = log_dir {
        eprintln!("Logging to: {}/botwarden.log", dir.display());
    }
}

/// Minimal logging for client commands
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
