use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const DEFAULT_LEVEL: &str = "info";
const FALLBACK_LOG_NAME: &str = "canvass";

type SharedFile = Arc<Mutex<File>>;

/// Level and console switch read from `CANVASS_LOG_LEVEL` and
/// `CANVASS_LOG_CONSOLE`. `RUST_LOG` still overrides the level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub console: bool,
}

impl LogSettings {
    pub fn from_env<F>(env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let level = env("CANVASS_LOG_LEVEL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_LEVEL.to_string());
        let console = env("CANVASS_LOG_CONSOLE")
            .map(|value| !matches!(value.trim(), "0" | "false" | "no" | "off"))
            .unwrap_or(true);
        Self { level, console }
    }
}

/// Keeps the log file open for the lifetime of the process.
pub struct LogGuard {
    file: Option<SharedFile>,
    path: Option<PathBuf>,
}

impl LogGuard {
    fn detached() -> Self {
        Self {
            file: None,
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Where one formatted event goes. The console is stderr so stdout stays
/// free for `--emit json` summaries.
#[derive(Clone)]
struct LogSink {
    console: bool,
    file: Option<SharedFile>,
}

impl LogSink {
    fn for_guard(guard: &LogGuard, settings: &LogSettings) -> Self {
        // Without a file the console is the only sink, whatever the switch says.
        Self {
            console: guard.file.is_none() || settings.console,
            file: guard.file.clone(),
        }
    }

    fn each<F>(&self, mut op: F)
    where
        F: FnMut(&mut dyn Write),
    {
        if self.console {
            op(&mut io::stderr().lock());
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                op(&mut *file);
            }
        }
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.each(|out| {
            let _ = out.write_all(buf);
        });
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.each(|out| {
            let _ = out.flush();
        });
        Ok(())
    }
}

/// Installs the global subscriber, writing to `<log_dir>/<name>.log` when a
/// directory is configured. Returns `None` if a subscriber is already set.
pub fn init_logging(log_dir: Option<&Path>, name: &str) -> Option<LogGuard> {
    let settings = LogSettings::from_env(|key| std::env::var(key).ok());
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let guard = match log_dir {
        Some(dir) => open_log_file(dir, name).unwrap_or_else(|err| {
            eprintln!("log_file_error: dir={} error={err}", dir.display());
            LogGuard::detached()
        }),
        None => LogGuard::detached(),
    };
    let sink = LogSink::for_guard(&guard, &settings);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(BoxMakeWriter::new(move || sink.clone()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(guard)
}

fn open_log_file(dir: &Path, name: &str) -> io::Result<LogGuard> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(log_file_name(name));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
        path: Some(path),
    })
}

/// `<name>.log` with anything outside `[A-Za-z0-9_-]` replaced, so a binary
/// name can never walk out of the log directory.
fn log_file_name(name: &str) -> String {
    let stem: String = name
        .trim()
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '_',
        })
        .collect();
    if stem.is_empty() {
        format!("{FALLBACK_LOG_NAME}.log")
    } else {
        format!("{stem}.log")
    }
}
