use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Name of the link pointing at the newest session log.
const LATEST_LOG: &str = "sabotage.log";

/// Session log mirrored by `tlog!` while set.
static LOG_FILE: Mutex<Option<File>> = Mutex::new(None);

fn timestamp() -> impl fmt::Display {
    chrono::Local::now().format("%H:%M:%S%.3f")
}

/// Write one timestamped line to stderr and, if enabled, the session log.
#[doc(hidden)]
pub fn write_line(args: fmt::Arguments<'_>) {
    let line = format!("{} {}", timestamp(), args);
    eprintln!("{line}");
    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(file, "{line}");
        }
    }
}

/// Open `<log_dir>/<YYYYmmdd-HHMMSS>-sabotage.log` and mirror `tlog!` into it.
/// Returns the path of the new file.
pub fn init_file_logging(log_dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;
    let file_name = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-sabotage.log")
        .to_string();
    let log_path = log_dir.join(&file_name);
    let file = OpenOptions::new().create(true).append(true).open(&log_path)?;

    #[cfg(unix)]
    {
        let latest = log_dir.join(LATEST_LOG);
        let _ = std::fs::remove_file(&latest);
        if let Err(e) = std::os::unix::fs::symlink(&file_name, &latest) {
            eprintln!("{} [logging] Could not link {LATEST_LOG}: {e}", timestamp());
        }
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }
    write_line(format_args!("[logging] Writing {}", log_path.display()));
    Ok(log_path)
}

pub fn stop_file_logging() {
    let closed = LOG_FILE
        .lock()
        .map(|mut guard| guard.take().is_some())
        .unwrap_or(false);
    if closed {
        eprintln!("{} [logging] Session log closed", timestamp());
    }
}

pub fn file_logging_enabled() -> bool {
    LOG_FILE.lock().map(|g| g.is_some()).unwrap_or(false)
}

/// `eprintln!` with a local `HH:MM:SS.mmm` prefix, mirrored into the session log.
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::write_line(format_args!($($arg)*))
    };
}
