//! Host settings (JSON file in the user config directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cloudvoice_core::{engine::DEFAULT_SERVICE_URL, EngineConfig, StreamType, StubConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const URL_ENV: &str = "CLOUDVOICE_URL";
pub const TOKEN_URL_ENV: &str = "CLOUDVOICE_TOKEN_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub service_url: String,
    pub token_url: Option<String>,
    pub handler: Option<String>,
    pub require_token: bool,
    pub locale: String,
    pub stream_type: StreamType,
    pub chunk_ms: u64,
    pub timeout_secs: u64,
    /// Audio frame size the WAV source emits per event.
    pub frame_ms: u64,
    /// Pace WAV playback at real time instead of as fast as possible.
    pub realtime: bool,
    pub verbose: bool,
    pub stub: StubConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.into(),
            token_url: None,
            handler: None,
            require_token: false,
            locale: "en-US".into(),
            stream_type: StreamType::Normal,
            chunk_ms: 120,
            timeout_secs: 9,
            frame_ms: 20,
            realtime: true,
            verbose: false,
            stub: StubConfig::default(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.service_url = self.service_url.trim().to_string();
        if self.service_url.is_empty() {
            self.service_url = DEFAULT_SERVICE_URL.into();
        }
        self.token_url = trimmed(self.token_url.take());
        self.handler = trimmed(self.handler.take());
        self.locale = self.locale.trim().to_string();
        if self.locale.is_empty() {
            self.locale = "en-US".into();
        }
        self.chunk_ms = self.chunk_ms.clamp(20, 1_000);
        self.timeout_secs = self.timeout_secs.clamp(1, 60);
        self.frame_ms = self.frame_ms.clamp(10, 200);
    }

    /// Apply `CLOUDVOICE_URL` / `CLOUDVOICE_TOKEN_URL` on top of the file.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = trimmed(lookup(URL_ENV)) {
            self.service_url = url;
        }
        if let Some(url) = trimmed(lookup(TOKEN_URL_ENV)) {
            self.token_url = Some(url);
        }
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            service_url: self.service_url.clone(),
            handler: self.handler.clone(),
            chunk_duration: Duration::from_millis(self.chunk_ms),
            session_timeout: Duration::from_secs(self.timeout_secs),
            require_token: self.require_token,
            verbose: self.verbose,
            ..EngineConfig::default()
        }
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("CloudVoice")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config")
            })
            .join("cloudvoice")
            .join("settings.json")
    }
}

/// Missing file means defaults; an unreadable one is logged and ignored.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<AppSettings>(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "invalid settings file; using defaults");
            AppSettings::default()
        }),
        Err(_) => AppSettings::default(),
    };
    settings.normalize();
    settings
}
