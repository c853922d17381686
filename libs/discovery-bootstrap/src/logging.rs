use crate::config::{LoggingConfig, Section};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, util::SubscriberInitExt, Layer};

// Keep a guard for non-blocking console to avoid being dropped.
static CONSOLE_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

const DEFAULT_MAX_SIZE_MB: u64 = 100;

// ================= level helpers =================

fn parse_tracing_level(s: &str) -> Option<Level> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        "off" | "none" => None,
        _ => Some(Level::INFO),
    }
}

fn level_filter(s: &str) -> LevelFilter {
    parse_tracing_level(s)
        .map(LevelFilter::from_level)
        .unwrap_or(LevelFilter::OFF)
}

/// Returns true if target == subsystem or target starts with "subsystem::"
fn matches_target_prefix(target: &str, subsystem: &str) -> bool {
    target == subsystem
        || (target.starts_with(subsystem) && target[subsystem.len()..].starts_with("::"))
}

// ================= rotating writer for files =================

use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};

#[derive(Clone)]
struct RotWriter(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl Write for RotWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().flush()
    }
}

// Drops writes when no file matches the target
struct RoutedWriter(Option<RotWriter>);

impl Write for RoutedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.0 {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.0 {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

/// Routes records to per-subsystem files by target prefix, falling back to the default file.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<RotWriter>,
    by_prefix: Vec<(String, RotWriter)>,
}

impl FileRouter {
    fn resolve_for(&self, target: &str) -> Option<RotWriter> {
        self.by_prefix
            .iter()
            .find(|(prefix, _)| matches_target_prefix(target, prefix))
            .map(|(_, w)| w.clone())
            .or_else(|| self.default.clone())
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_prefix.is_empty()
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = RoutedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RoutedWriter(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        RoutedWriter(self.resolve_for(meta.target()))
    }
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

/// Rotation threshold in bytes, saturating for oversized settings.
fn max_bytes(section: &Section) -> usize {
    let mb = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB);
    usize::try_from(mb)
        .unwrap_or(usize::MAX)
        .saturating_mul(1024 * 1024)
}

fn open_rotating_writer(section: &Section, base_dir: &Path) -> std::io::Result<RotWriter> {
    let log_path = resolve_log_path(&section.file, base_dir);
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let limit = FileLimit::MaxFiles(section.max_backups.unwrap_or(1));

    let rot = FileRotate::new(
        &log_path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(max_bytes(section)),
        Compression::None,
        None,
    );
    Ok(RotWriter(Arc::new(Mutex::new(rot))))
}

// ================= config extraction =================

struct ConfigData<'a> {
    default_section: Option<&'a Section>,
    subsystem_sections: Vec<(&'a str, &'a Section)>,
}

impl<'a> ConfigData<'a> {
    fn from_config(cfg: &'a LoggingConfig) -> Self {
        let mut subsystem_sections: Vec<_> = cfg
            .iter()
            .filter(|(k, _)| k.as_str() != "default")
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        // longest prefix first so nested subsystems win
        subsystem_sections.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.0.cmp(b.0)));

        Self {
            default_section: cfg.get("default"),
            subsystem_sections,
        }
    }

    fn is_empty(&self) -> bool {
        self.default_section.is_none() && self.subsystem_sections.is_empty()
    }
}

fn console_targets(config: &ConfigData) -> Targets {
    let default_level = config
        .default_section
        .map(|s| level_filter(&s.console_level))
        .unwrap_or(LevelFilter::INFO);

    config
        .subsystem_sections
        .iter()
        .fold(Targets::new().with_default(default_level), |t, (name, s)| {
            t.with_target(*name, level_filter(&s.console_level))
        })
}

fn file_targets(config: &ConfigData, has_default_file: bool) -> Targets {
    let default_level = match config.default_section {
        Some(s) if has_default_file && !s.file_level.is_empty() => level_filter(&s.file_level),
        _ if has_default_file => LevelFilter::INFO,
        _ => LevelFilter::OFF,
    };

    config
        .subsystem_sections
        .iter()
        .filter(|(_, s)| !s.file.trim().is_empty())
        .fold(Targets::new().with_default(default_level), |t, (name, s)| {
            t.with_target(*name, level_filter(&s.file_level))
        })
}

fn build_file_router(config: &ConfigData, base_dir: &Path) -> FileRouter {
    let mut router = FileRouter::default();
    let mut opened: HashMap<PathBuf, RotWriter> = HashMap::new();

    let mut open = |section: &Section, label: &str| -> Option<RotWriter> {
        if section.file.trim().is_empty() {
            return None;
        }
        let path = resolve_log_path(&section.file, base_dir);
        if let Some(w) = opened.get(&path) {
            return Some(w.clone());
        }
        match open_rotating_writer(section, base_dir) {
            Ok(w) => {
                opened.insert(path, w.clone());
                Some(w)
            }
            Err(e) => {
                eprintln!(
                    "Failed to init log file for '{label}': {} ({e})",
                    path.display()
                );
                None
            }
        }
    };

    if let Some(section) = config.default_section {
        router.default = open(section, "default");
    }
    for (name, section) in &config.subsystem_sections {
        if let Some(writer) = open(section, name) {
            router.by_prefix.push((name.to_string(), writer));
        }
    }
    router
}

// ================= public init =================

/// Install the global subscriber: console (stderr) plus optional JSON files.
///
/// Relative file paths resolve against `base_dir`. `RUST_LOG`, when set, caps every sink.
/// Calling it again after a subscriber is installed is a no-op.
pub fn init_logging(cfg: &LoggingConfig, base_dir: &Path) {
    // Bridge `log` → `tracing` *before* installing the subscriber
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    let data = ConfigData::from_config(cfg);
    if data.is_empty() {
        init_minimal();
        return;
    }

    let file_router = build_file_router(&data, base_dir);
    let console = console_targets(&data);
    let files = file_targets(&data, file_router.default.is_some());

    install_subscriber(console, files, file_router);
}

fn install_subscriber(console_targets: Targets, file_targets: Targets, file_router: FileRouter) {
    use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

    let env: Option<EnvFilter> = EnvFilter::try_from_default_env().ok();

    let (nb_stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console_layer = fmt::layer()
        .with_writer(nb_stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_level(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(console_targets);

    let file_layer = (!file_router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(file_router)
            .with_filter(file_targets)
    });

    let subscriber = Registry::default()
        .with(env)
        .with(console_layer)
        .with(file_layer);

    let _ = subscriber.try_init();
}

/// INFO to console; honors RUST_LOG.
pub fn init_minimal() {
    use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

    let env = EnvFilter::try_from_default_env().ok();
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(LevelFilter::INFO);

    let _ = Registry::default().with(env).with(fmt_layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_logging_config;

    fn section(console: &str, file: &str, file_level: &str) -> Section {
        Section {
            console_level: console.to_string(),
            file: file.to_string(),
            file_level: file_level.to_string(),
            max_backups: Some(2),
            max_size_mb: Some(1),
        }
    }

    #[test]
    fn test_max_bytes_saturates() {
        let mut s = section("info", "logs/a.log", "debug");
        assert_eq!(max_bytes(&s), 1024 * 1024);

        s.max_size_mb = None;
        assert_eq!(max_bytes(&s), 100 * 1024 * 1024);

        s.max_size_mb = Some(u64::MAX);
        assert_eq!(max_bytes(&s), usize::MAX);
    }

    #[test]
    fn test_parse_tracing_level() {
        assert_eq!(parse_tracing_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_tracing_level("warn"), Some(Level::WARN));
        assert_eq!(parse_tracing_level("off"), None);
        assert_eq!(parse_tracing_level("bogus"), Some(Level::INFO));
        assert_eq!(level_filter("none"), LevelFilter::OFF);
    }

    #[test]
    fn test_matches_target_prefix() {
        assert!(matches_target_prefix("discovery_client", "discovery_client"));
        assert!(matches_target_prefix(
            "discovery_client::registry",
            "discovery_client"
        ));
        assert!(!matches_target_prefix("discovery_clientele", "discovery_client"));
    }

    #[test]
    fn test_console_targets_per_subsystem() {
        let mut cfg = LoggingConfig::new();
        cfg.insert("default".to_string(), section("warn", "", ""));
        cfg.insert("discovery_client".to_string(), section("trace", "", ""));
        let data = ConfigData::from_config(&cfg);

        let targets = console_targets(&data);
        assert!(targets.would_enable("discovery_client::discovery", &Level::TRACE));
        assert!(targets.would_enable("other", &Level::WARN));
        assert!(!targets.would_enable("other", &Level::INFO));
    }

    #[test]
    fn test_file_targets_off_without_default_file() {
        let mut cfg = LoggingConfig::new();
        cfg.insert("default".to_string(), section("info", "", "debug"));
        cfg.insert("discovery_client".to_string(), section("info", "client.log", "debug"));
        let data = ConfigData::from_config(&cfg);

        let targets = file_targets(&data, false);
        assert!(targets.would_enable("discovery_client", &Level::DEBUG));
        assert!(!targets.would_enable("other", &Level::ERROR));
    }

    #[test]
    fn test_file_router_resolves_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = default_logging_config();
        cfg.insert(
            "discovery_client".to_string(),
            section("info", "client.log", "debug"),
        );
        let data = ConfigData::from_config(&cfg);

        let router = build_file_router(&data, dir.path());
        assert!(router.default.is_some());
        assert_eq!(router.by_prefix.len(), 1);
        assert!(router.resolve_for("discovery_client::memory").is_some());
        assert!(router.resolve_for("elsewhere").is_some());

        let mut writer = router.resolve_for("discovery_client").unwrap();
        writer.write_all(b"line\n").unwrap();
        writer.flush().unwrap();
        assert!(dir.path().join("client.log").exists());
        assert!(dir.path().join("logs").is_dir());
    }
}
