pub mod config;
pub mod dispatch;
pub mod process;

use std::path::{Path, PathBuf};

/// Log file name written inside the log directory.
pub const LOG_FILE_NAME: &str = "engine-pipe.log";

/// Return the platform-standard data directory for engine-pipe.
///
/// - macOS: `~/Library/Application Support/engine-pipe/`
/// - Windows: `{FOLDERID_RoamingAppData}\engine-pipe\`
/// - Linux: `$XDG_DATA_HOME/engine-pipe/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.engine-pipe/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("engine-pipe");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".engine-pipe")
}

/// Initialize the tracing subscriber.
///
/// With a `log_dir`:
/// 1. Rotates existing logs (engine-pipe.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh engine-pipe.log with a line-flushing writer.
///
/// Without one, logs go to stderr. `json` switches to one JSON object per line.
/// The filter defaults to `engine_pipe=info,warn` and honours `RUST_LOG`.
pub fn init_tracing(log_dir: Option<&Path>, json: bool) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("engine_pipe=info,warn"));

    let already_set = |e: Box<dyn std::error::Error + Send + Sync>| {
        std::io::Error::other(format!("tracing already initialized: {e}"))
    };

    let Some(log_dir) = log_dir else {
        let builder = fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true);
        return if json {
            builder.json().try_init().map_err(already_set)
        } else {
            builder.try_init().map_err(already_set)
        };
    };

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true);
    if json {
        builder.json().try_init().map_err(already_set)?;
    } else {
        builder.try_init().map_err(already_set)?;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== engine-pipe starting ==="
    );
    Ok(())
}

/// Rotate log files: `engine-pipe.log` → `.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Keeps each log line on disk if the process dies mid-call.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
