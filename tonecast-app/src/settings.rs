//! Persistent simulator settings (JSON file in the user config directory).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tonecast_core::config::MAX_DIGITS_CAP;
use tonecast_core::SessionConfig;

const DEFAULT_VOICE: &str = "Allison-8kHz";
const MAX_FRAME_BYTES: usize = 8_000;
const MAX_STARTUP_DELAY_MS: u64 = 2_000;
const MAX_DTMF_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub buffer_size: usize,
    pub voice: String,
    pub goto_extension: bool,
    pub dtmf_timeout_ms: u64,
    pub max_digits: usize,
    pub frame_bytes: usize,
    pub startup_delay_ms: u64,
    /// Milliseconds of synthesized audio per character of text.
    pub speech_ms_per_char: u64,
    /// Extensions that exist in the simulated dialplan context.
    pub extensions: Vec<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        let core = SessionConfig::default();
        Self {
            buffer_size: core.buffer_size,
            voice: core.voice,
            goto_extension: core.goto_extension,
            dtmf_timeout_ms: core.dtmf_timeout_ms,
            max_digits: core.max_digits,
            frame_bytes: core.frame_bytes,
            startup_delay_ms: core.startup_delay_ms,
            speech_ms_per_char: 60,
            extensions: Vec::new(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.voice = self.voice.trim().to_string();
        if self.voice.is_empty() {
            self.voice = DEFAULT_VOICE.into();
        }
        if self.frame_bytes == 0 {
            self.frame_bytes = SessionConfig::default().frame_bytes;
        }
        self.frame_bytes = self.frame_bytes.min(MAX_FRAME_BYTES);
        self.buffer_size = self.buffer_size.max(self.frame_bytes);
        self.max_digits = self.max_digits.min(MAX_DIGITS_CAP);
        self.dtmf_timeout_ms = self.dtmf_timeout_ms.min(MAX_DTMF_TIMEOUT_MS);
        self.startup_delay_ms = self.startup_delay_ms.min(MAX_STARTUP_DELAY_MS);
        self.speech_ms_per_char = self.speech_ms_per_char.clamp(1, 1_000);
        self.extensions = self
            .extensions
            .iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            buffer_size: self.buffer_size,
            voice: self.voice.clone(),
            goto_extension: self.goto_extension,
            dtmf_timeout_ms: self.dtmf_timeout_ms,
            max_digits: self.max_digits,
            frame_bytes: self.frame_bytes,
            startup_delay_ms: self.startup_delay_ms,
            ..SessionConfig::default()
        }
    }
}

pub fn default_settings_path() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("tonecast")
        .join("settings.json")
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
