//! Logging and environment helpers.
//! Logging is opt-in for a library: silent unless `SLUICE_LOG` asks for it,
//! with an optional append-only log file via `SLUICE_LOG_FILE`.

use std::env;
use std::fs::OpenOptions;
use std::io::Write;

use chrono::Local;

fn is_verbose() -> bool {
    env::var("SLUICE_LOG")
        .map(|v| {
            let v = v.to_lowercase();
            v == "debug" || v == "trace" || v == "1"
        })
        .unwrap_or(false)
}

fn log_file_path() -> Option<String> {
    env::var("SLUICE_LOG_FILE").ok().filter(|p| !p.is_empty())
}

/// Log a message with a local timestamp. Printed to stderr when verbose
/// logging is enabled; appended to `SLUICE_LOG_FILE` when that is set.
pub fn log(message: &str) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let line = format!("[{}] {}", timestamp, message);

    if is_verbose() {
        eprintln!("{}", line);
    }

    if let Some(path) = log_file_path() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Log an error message. Always written to stderr.
pub fn log_error(message: &str) {
    eprintln!("{}", message);
    if let Some(path) = log_file_path() {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
            let _ = writeln!(file, "[{}] {}", timestamp, message);
        }
    }
}

/// Read a usize from the environment, falling back to `default` when the
/// variable is unset or unparsable.
pub fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

/// Read a u64 from the environment, falling back to `default`.
pub fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}
