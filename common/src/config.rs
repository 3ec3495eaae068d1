//! Configuration parsing – reads a KEY=VALUE file (`syncam.conf`).
//!
//! The coordinator and the device agent load the same file; each ignores
//! the fields it does not need.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Application configuration, shared between coordinator and agents.
#[derive(Debug, Clone)]
pub struct Config {
    // ── coordinator ──────────────────────────────────────────────────
    pub listen_addr: String,
    /// Root of the object store (one subdirectory per capture folder).
    pub storage_dir: PathBuf,
    pub sweep_interval_secs: u64,
    pub countdown_ticks: u32,
    pub countdown_interval_ms: u64,
    /// Counter used when storage holds no previous captures.
    pub counter_baseline: u32,
    pub ping_interval_secs: u64,

    // ── agent: channel ───────────────────────────────────────────────
    /// `ws://host:port/ws`.  `None` means discover via mDNS.
    pub coordinator_url: Option<String>,
    /// Base URL of the upload endpoint.  Derived from the coordinator URL
    /// when unset.
    pub upload_url: Option<String>,
    pub reconnect_secs: u64,
    pub device_label: Option<String>,

    // ── agent: rolling buffer ────────────────────────────────────────
    /// Segment length W, in seconds.
    pub segment_secs: u64,
    pub overlap_ms: u64,
    pub light_pulse_ms: u64,
    pub has_aux_light: bool,

    // ── agent: capture device ────────────────────────────────────────
    /// ffmpeg input arguments, e.g. `-f v4l2 -i /dev/video0`.
    pub capture_input: Option<String>,
    pub segment_format: String,
    pub marker_command: Option<String>,
    pub light_on_command: Option<String>,
    pub light_off_command: Option<String>,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/syncam/syncam.conf"
    }

    pub fn segment_length(&self) -> Duration {
        Duration::from_secs(self.segment_secs)
    }

    pub fn overlap(&self) -> Duration {
        Duration::from_millis(self.overlap_ms)
    }

    /// HTTP base URL for uploads: explicit `UPLOAD_URL`, or the coordinator
    /// websocket URL with its scheme and `/ws` path swapped.
    pub fn resolved_upload_url(&self, coordinator_url: &str) -> String {
        if let Some(url) = &self.upload_url {
            return url.trim_end_matches('/').to_string();
        }
        http_base_from_ws(coordinator_url)
    }
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

/// `ws://host:8090/ws` → `http://host:8090`.
pub fn http_base_from_ws(url: &str) -> String {
    let swapped = if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        url.to_string()
    };
    swapped
        .trim_end_matches('/')
        .trim_end_matches("/ws")
        .to_string()
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let map = parse_conf(&text);
    info!("Loaded config from {}", path.display());
    Ok(from_map(&map))
}

/// Like [`load`], but a missing file yields the defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load(path)
    } else {
        info!("No config at {} – using defaults", path.display());
        Ok(Config::default())
    }
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned().filter(|s| !s.is_empty()) };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_u32 = |key: &str, default: u32| -> u32 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_bool = |key: &str| -> bool {
        get(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false)
    };

    Config {
        listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8090".into()),
        storage_dir: PathBuf::from(get("STORAGE_DIR").unwrap_or_else(|| "/data/captures".into())),
        sweep_interval_secs: get_u64("SWEEP_INTERVAL_SECS", 30).max(1),
        countdown_ticks: get_u32("COUNTDOWN_TICKS", 3),
        countdown_interval_ms: get_u64("COUNTDOWN_INTERVAL_MS", 1000),
        counter_baseline: get_u32("COUNTER_BASELINE", 0),
        ping_interval_secs: get_u64("PING_INTERVAL_SECS", 10).max(1),

        coordinator_url: get("COORDINATOR_URL"),
        upload_url: get("UPLOAD_URL"),
        reconnect_secs: get_u64("RECONNECT_SECS", 3).max(1),
        device_label: get("DEVICE_LABEL"),

        segment_secs: get_u64("SEGMENT_SECS", 10).max(1),
        overlap_ms: get_u64("OVERLAP_MS", 300),
        light_pulse_ms: get_u64("LIGHT_PULSE_MS", 500),
        has_aux_light: get_bool("HAS_AUX_LIGHT"),

        capture_input: get("CAPTURE_INPUT"),
        segment_format: get("SEGMENT_FORMAT").unwrap_or_else(|| "mp4".into()),
        marker_command: get("MARKER_COMMAND"),
        light_on_command: get("LIGHT_ON_COMMAND"),
        light_off_command: get("LIGHT_OFF_COMMAND"),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conf() {
        let text = r#"
# comment
LISTEN_ADDR=0.0.0.0:9090
COORDINATOR_URL="ws://coord.local:9090/ws"
SEGMENT_SECS=8
HAS_AUX_LIGHT=true
MARKER_COMMAND="aplay /usr/share/sounds/beep.wav"
"#;
        let map = parse_conf(text);
        assert_eq!(map["LISTEN_ADDR"], "0.0.0.0:9090");
        assert_eq!(map["COORDINATOR_URL"], "ws://coord.local:9090/ws");
        assert_eq!(map["MARKER_COMMAND"], "aplay /usr/share/sounds/beep.wav");

        let config = from_map(&map);
        assert_eq!(config.segment_length(), Duration::from_secs(8));
        assert!(config.has_aux_light);
        assert_eq!(config.overlap(), Duration::from_millis(300));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8090");
        assert_eq!(config.sweep_interval_secs, 30);
        assert_eq!(config.countdown_ticks, 3);
        assert_eq!(config.countdown_interval_ms, 1000);
        assert_eq!(config.counter_baseline, 0);
        assert!(config.coordinator_url.is_none());
        assert!(!config.has_aux_light);
        assert_eq!(config.segment_format, "mp4");
    }

    #[test]
    fn test_empty_values_fall_back() {
        let map = parse_conf("SEGMENT_SECS=\nDEVICE_LABEL=\"\"\nSEGMENT_FORMAT=webm\n");
        let config = from_map(&map);
        assert_eq!(config.segment_secs, 10);
        assert!(config.device_label.is_none());
        assert_eq!(config.segment_format, "webm");
    }

    #[test]
    fn test_upload_url_derivation() {
        assert_eq!(http_base_from_ws("ws://host:8090/ws"), "http://host:8090");
        assert_eq!(http_base_from_ws("wss://host/ws/"), "https://host");

        let mut config = Config::default();
        assert_eq!(
            config.resolved_upload_url("ws://10.0.0.2:8090/ws"),
            "http://10.0.0.2:8090"
        );
        config.upload_url = Some("http://storage:9000/".into());
        assert_eq!(config.resolved_upload_url("ws://x/ws"), "http://storage:9000");
    }

    #[test]
    fn test_load_file() {
        let dir = tempdir();
        let path = dir.join("syncam.conf");
        std::fs::write(&path, "STORAGE_DIR=/tmp/syncam-test\n").unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/syncam-test"));

        let missing = load_or_default(&dir.join("absent.conf")).unwrap();
        assert_eq!(missing.storage_dir, PathBuf::from("/data/captures"));
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("syncam_conf_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
