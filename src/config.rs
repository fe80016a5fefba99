//! Konfiguration
//!
//! Server-URL, ICE Server und Ton kommen aus der Umgebung bzw. der CLI.
//! Die zuletzt benutzte Server-URL wird im App-Datenverzeichnis gespeichert:
//! - Windows: `%APPDATA%/callbridge/data/last_url`
//! - macOS: `~/Library/Application Support/org.callbridge.callbridge/last_url`
//! - Linux: `~/.local/share/callbridge/last_url`

use crate::session::DEFAULT_TONE_ID;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// STUN Server, über die der ICE Agent seine öffentliche Adresse erfährt
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.stunprotocol.org:3478",
    "stun:stun.l.google.com:19302",
];

pub const ENV_SIGNALING_URL: &str = "SIGNALING_URL";
pub const ENV_ICE_SERVERS: &str = "ICE_SERVERS";
pub const ENV_TONE_ID: &str = "TONE_ID";
pub const ENV_TONE_DISABLED: &str = "TONE_DISABLED";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No signaling server URL configured")]
    MissingUrl,

    #[error("Invalid signaling URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported URL scheme '{0}', expected ws or wss")]
    UnsupportedScheme(String),

    #[error("Could not determine app data directory")]
    NoDataDirectory,

    #[error("Failed to access stored settings: {0}")]
    Io(#[from] std::io::Error),
}

/// Prüft, dass die URL eine WebSocket-URL ist
pub fn validate_url(url: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(url.trim()).map_err(|e| ConfigError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}

// ============================================================================
// PHONE CONFIG
// ============================================================================

/// Alles, was zum Verbinden gebraucht wird
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    /// `None` schaltet `callTonePlay` ab
    pub tone_id: Option<String>,
}

impl PhoneConfig {
    /// Konfiguration mit Standardwerten für eine Server-URL
    pub fn new(signaling_url: &str) -> Result<Self, ConfigError> {
        let url = validate_url(signaling_url)?;
        Ok(Self {
            signaling_url: url.to_string(),
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            tone_id: Some(DEFAULT_TONE_ID.to_string()),
        })
    }

    /// Liest die Konfiguration aus der Umgebung (`SIGNALING_URL` ist Pflicht)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_url(None)
    }

    /// Wie [`PhoneConfig::from_env`], eine übergebene URL hat aber Vorrang
    pub fn from_env_with_url(url: Option<String>) -> Result<Self, ConfigError> {
        Self::from_lookup(url, |key| std::env::var(key).ok())
    }

    fn from_lookup<F>(url: Option<String>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = url
            .or_else(|| lookup(ENV_SIGNALING_URL))
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::MissingUrl)?;
        let mut config = Self::new(&url)?;

        if let Some(servers) = lookup(ENV_ICE_SERVERS) {
            config = config.with_ice_servers(servers.split(',').map(str::to_string).collect());
        }
        if let Some(tone) = lookup(ENV_TONE_ID).filter(|t| !t.trim().is_empty()) {
            config.tone_id = Some(tone.trim().to_string());
        }
        if lookup(ENV_TONE_DISABLED).is_some_and(|v| is_truthy(&v)) {
            config.tone_id = None;
        }
        Ok(config)
    }

    /// Ersetzt die ICE Server; leere Einträge werden ignoriert
    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        let servers: Vec<String> = servers
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !servers.is_empty() {
            self.ice_servers = servers;
        }
        self
    }

    pub fn with_tone(mut self, tone_id: Option<String>) -> Self {
        self.tone_id = tone_id;
        self
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

// ============================================================================
// URL STORE
// ============================================================================

/// Merkt sich die zuletzt benutzte Server-URL
#[derive(Debug, Clone)]
pub struct UrlStore {
    path: PathBuf,
}

impl UrlStore {
    /// Store im App-Datenverzeichnis
    pub fn open() -> Result<Self, ConfigError> {
        let proj_dirs = directories::ProjectDirs::from("org", "callbridge", "callbridge")
            .ok_or(ConfigError::NoDataDirectory)?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("last_url");
        Ok(Self { path })
    }

    /// Store an einem festen Pfad
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Gespeicherte URL, `None` wenn noch keine gespeichert wurde
    pub fn load(&self) -> Result<Option<String>, ConfigError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let url = fs::read_to_string(&self.path)?;
        let url = url.trim();
        Ok((!url.is_empty()).then(|| url.to_string()))
    }

    pub fn save(&self, url: &str) -> Result<(), ConfigError> {
        // Parent-Verzeichnis erstellen falls nicht vorhanden
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, url.trim())?;
        tracing::debug!("Saved server URL to {:?}", self.path);
        Ok(())
    }
}
