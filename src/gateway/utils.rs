/// Shared utility functions used across the gateway modules.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::process::Command;
use std::sync::{Mutex, OnceLock};

/// Debug logging helper (only active when LLMGATE_DEBUG=1).
/// Writes to `~/.llmgate/debug/<component>.log`.
pub fn debug_log_for(component: &str, msg: &str) {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    let enabled = ENABLED.get_or_init(|| {
        std::env::var("LLMGATE_DEBUG").map(|v| v == "1").unwrap_or(false)
    });
    if !*enabled {
        return;
    }
    if let Some(home) = dirs::home_dir() {
        let debug_dir = home.join(".llmgate").join("debug");
        let _ = std::fs::create_dir_all(&debug_dir);
        let log_path = debug_dir.join(format!("{}.log", component));
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] {}", timestamp, msg);
        }
    }
}

fn binary_cache() -> &'static Mutex<HashMap<String, Option<String>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Option<String>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Resolve a tool on PATH. First tries `which <name>`, then falls back to
/// `bash -lc "which <name>"` (for non-interactive SSH sessions where
/// ~/.profile isn't loaded). Results are cached per binary name.
pub fn resolve_binary(name: &str) -> Option<String> {
    if let Ok(cache) = binary_cache().lock() {
        if let Some(hit) = cache.get(name) {
            return hit.clone();
        }
    }
    let resolved = which_lookup(name);
    if let Ok(mut cache) = binary_cache().lock() {
        cache.insert(name.to_string(), resolved.clone());
    }
    resolved
}

fn which_lookup(name: &str) -> Option<String> {
    if let Ok(output) = Command::new("which").arg(name).output() {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Some(path);
            }
        }
    }
    if let Ok(output) = Command::new("bash")
        .args(["-lc", &format!("which {}", name)])
        .output()
    {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Some(path);
            }
        }
    }
    None
}

/// Find the nearest char boundary at or before the given byte index.
/// Returns `s.len()` if `index >= s.len()`.
pub fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Truncate a string to `max_len` bytes, cutting at a safe UTF-8 boundary.
/// Used to cap diagnostic text carried on failures.
pub fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    &s[..floor_char_boundary(s, max_len)]
}
