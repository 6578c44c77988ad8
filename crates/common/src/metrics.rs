//! Append-only CSV event sink shared by every node binary.
//!
//! One file per process, one row per event. Rows carry wall-clock and
//! monotonic timestamps plus process/thread identity so runs can be merged
//! and analyzed offline. Writer access is serialized; the file is flushed
//! after every event so rows survive a crash.
//!
//! Environment knobs:
//! - `METRICS_OVERWRITE` (1/true/yes): truncate instead of append.
//! - `METRICS_FILENAME_UNIQUE` (1/true/yes): suffix the file name with
//!   `-<pid>-<startms>` so concurrent runs never share a file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::warn;

const HEADER: &str = "wall_ms,steady_ms,event,request_id,process,role,hostname,pid,\
thread_id,queue_depth,active_count,chunk_number,records,extra";

struct SinkState {
    file: File,
    process_id: String,
    role: String,
    hostname: String,
    started: Instant,
}

static SINK: OnceLock<Mutex<Option<SinkState>>> = OnceLock::new();

fn sink() -> &'static Mutex<Option<SinkState>> {
    SINK.get_or_init(|| Mutex::new(None))
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string())
}

fn wall_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Replaces path-hostile characters so ids and hostnames are safe in file names.
fn sanitize_fs(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ' ' | ':' | '\n' | '\r' | '\t' => '-',
            other => other,
        })
        .collect()
}

/// Quotes a CSV field when it contains a delimiter, quote, or newline.
pub fn csv_escape(input: &str) -> String {
    if !input.contains(['"', ',', '\n', '\r']) {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len() + 2);
    out.push('"');
    for c in input.chars() {
        if c == '"' {
            out.push_str("\"\"");
        } else {
            out.push(c);
        }
    }
    out.push('"');
    out
}

fn metrics_file_name(process_id: &str, role: &str, hostname: &str) -> String {
    let base = format!(
        "metrics-{}-{}-{}",
        sanitize_fs(role),
        sanitize_fs(process_id),
        sanitize_fs(hostname)
    );
    if env_flag("METRICS_FILENAME_UNIQUE") {
        format!("{base}-{}-{}.csv", std::process::id(), wall_ms())
    } else {
        format!("{base}.csv")
    }
}

/// Opens the sink at an explicit file path.
///
/// Open failure is a warning, never fatal; later events are dropped silently.
/// A second `init` call is a no-op.
pub fn init(path: impl AsRef<Path>, process_id: &str, role: &str) {
    let path = path.as_ref();
    let mut guard = match sink().lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    if guard.is_some() {
        return;
    }

    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let overwrite = env_flag("METRICS_OVERWRITE");
    let mut options = OpenOptions::new();
    options.create(true).write(true);
    if overwrite {
        options.truncate(true);
    } else {
        options.append(true);
    }

    let mut file = match options.open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to open metrics file");
            return;
        }
    };

    let fresh = overwrite || file.metadata().map(|m| m.len() == 0).unwrap_or(true);
    if fresh {
        let _ = writeln!(file, "{HEADER}");
        let _ = file.flush();
    }

    *guard = Some(SinkState {
        file,
        process_id: process_id.to_string(),
        role: role.to_string(),
        hostname: hostname(),
        started: Instant::now(),
    });
}

/// Opens the sink inside a directory using the canonical file-name scheme.
pub fn init_with_dir(dir: impl AsRef<Path>, process_id: &str, role: &str) {
    let dir = dir.as_ref();
    let _ = std::fs::create_dir_all(dir);
    let name = metrics_file_name(process_id, role, &hostname());
    init(dir.join(name), process_id, role);
}

/// Whether the sink is open and accepting events.
pub fn is_enabled() -> bool {
    sink().lock().map(|g| g.is_some()).unwrap_or(false)
}

/// Flushes and closes the sink.
pub fn shutdown() {
    let mut guard = match sink().lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(state) = guard.as_mut() {
        let _ = state.file.flush();
    }
    *guard = None;
}

/// Appends one event row. Unknown counters are passed as `-1`.
pub fn log_event(
    event: &str,
    request_id: &str,
    queue_depth: i64,
    active_count: i64,
    chunk_number: i64,
    records: i64,
    extra: &str,
) {
    // Timestamps and thread identity are captured outside the lock.
    let wall = wall_ms();
    let thread_id = format!("{:?}", std::thread::current().id());
    let extra_flat: String = extra
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();

    let mut guard = match sink().lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    let Some(state) = guard.as_mut() else {
        return;
    };
    let steady = state.started.elapsed().as_millis();

    let row = format!(
        "{wall},{steady},{},{},{},{},{},{},{},{queue_depth},{active_count},{chunk_number},{records},{}",
        csv_escape(event),
        csv_escape(request_id),
        csv_escape(&state.process_id),
        csv_escape(&state.role),
        csv_escape(&state.hostname),
        std::process::id(),
        csv_escape(&thread_id),
        csv_escape(&extra_flat),
    );
    let _ = writeln!(state.file, "{row}");
    let _ = state.file.flush();
}
