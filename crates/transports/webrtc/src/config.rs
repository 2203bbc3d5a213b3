//! Configuration types for the call layer

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Public STUN servers used when no configuration is supplied
pub const DEFAULT_STUN_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Upper bound on the signaling poll interval
pub const MAX_POLL_INTERVAL_MS: u64 = 1000;

/// Main configuration for a call participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Which capture devices a call acquires
    pub media: MediaConstraints,

    /// Signaling relay settings
    pub signaling: SignalingConfig,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Capture constraints for local media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    /// Capture the microphone (default: true)
    pub audio: bool,

    /// Capture the camera (default: true)
    pub video: bool,
}

/// Signaling channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Base URL of the signaling relay (http:// or https://)
    pub relay_url: String,

    /// Mailbox poll interval in milliseconds (default: 1000, range: 10-1000)
    pub poll_interval_ms: u64,

    /// Maximum messages drained per poll (default: 50, range: 1-200)
    pub batch_limit: usize,

    /// Consecutive signaling failures tolerated before the active call is
    /// ended (default: 5, 0 = never end the call)
    pub max_consecutive_failures: u32,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn_servers: Vec::new(),
            media: MediaConstraints::default(),
            signaling: SignalingConfig::default(),
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://localhost:8080".to_string(),
            poll_interval_ms: MAX_POLL_INTERVAL_MS,
            batch_limit: 50,
            max_consecutive_failures: 5,
        }
    }
}

impl SignalingConfig {
    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl CallConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - no STUN or TURN server is configured
    /// - a STUN url does not start with `stun:`/`stuns:`
    /// - a TURN url does not start with `turn:`/`turns:`
    /// - neither audio nor video is requested
    /// - `relay_url` is not an http(s) URL
    /// - `poll_interval_ms` is not in range 10-1000
    /// - `batch_limit` is not in range 1-200
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() && self.turn_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN or TURN server is required".to_string(),
            ));
        }

        if let Some(bad) = self
            .stun_servers
            .iter()
            .find(|url| !url.starts_with("stun:") && !url.starts_with("stuns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "STUN server must start with stun: or stuns:, got {}",
                bad
            )));
        }

        if let Some(bad) = self
            .turn_servers
            .iter()
            .find(|turn| !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "TURN server must start with turn: or turns:, got {}",
                bad.url
            )));
        }

        if !self.media.audio && !self.media.video {
            return Err(Error::InvalidConfig(
                "At least one of audio or video must be enabled".to_string(),
            ));
        }

        let signaling = &self.signaling;
        if !signaling.relay_url.starts_with("http://") && !signaling.relay_url.starts_with("https://")
        {
            return Err(Error::InvalidConfig(format!(
                "relay_url must start with http:// or https://, got {}",
                signaling.relay_url
            )));
        }

        if signaling.poll_interval_ms < 10 || signaling.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(Error::InvalidConfig(format!(
                "poll_interval_ms must be in range 10-{}, got {}",
                MAX_POLL_INTERVAL_MS, signaling.poll_interval_ms
            )));
        }

        if signaling.batch_limit == 0 || signaling.batch_limit > 200 {
            return Err(Error::InvalidConfig(format!(
                "batch_limit must be in range 1-200, got {}",
                signaling.batch_limit
            )));
        }

        Ok(())
    }

    /// Load a configuration file, picking the format from its extension
    /// (`.toml`, `.yaml`/`.yml` or `.json`), then validate it.
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        use crate::Error;

        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let config: CallConfig = match ext.as_str() {
            "toml" => toml::from_str(&text)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?,
            "yaml" | "yml" => serde_yaml::from_str(&text)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?,
            "json" => serde_json::from_str(&text)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?,
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unsupported config extension '{}' for {}",
                    other,
                    path.display()
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Create a configuration preset for voice-only consultations
    ///
    /// # Example
    ///
    /// ```
    /// use campuscare_webrtc::config::CallConfig;
    ///
    /// let config = CallConfig::audio_only("http://relay.campus.local:8080");
    /// assert!(config.media.audio);
    /// assert!(!config.media.video);
    /// ```
    pub fn audio_only(relay_url: &str) -> Self {
        Self {
            media: MediaConstraints {
                audio: true,
                video: false,
            },
            signaling: SignalingConfig {
                relay_url: relay_url.to_string(),
                ..SignalingConfig::default()
            },
            ..Self::default()
        }
    }

    /// Create a configuration preset for two participants on one machine
    ///
    /// Polls the mailbox every 20ms so negotiation completes quickly.
    pub fn local_loopback() -> Self {
        Self {
            signaling: SignalingConfig {
                relay_url: "http://127.0.0.1:8080".to_string(),
                poll_interval_ms: 20,
                ..SignalingConfig::default()
            },
            ..Self::default()
        }
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Replace the STUN server list
    pub fn with_stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.stun_servers = stun_servers;
        self
    }

    /// Set the signaling relay URL
    pub fn with_relay_url(mut self, relay_url: &str) -> Self {
        self.signaling.relay_url = relay_url.to_string();
        self
    }

    /// Set the signaling poll interval
    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.signaling.poll_interval_ms = poll_interval_ms;
        self
    }

    /// Set which media kinds a call captures
    pub fn with_media(mut self, audio: bool, video: bool) -> Self {
        self.media = MediaConstraints { audio, video };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CallConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stun_servers.len(), 3);
        assert_eq!(config.signaling.poll_interval_ms, 1000);
    }

    #[test]
    fn test_no_ice_servers_fails() {
        let config = CallConfig::default().with_stun_servers(Vec::new());
        assert!(config.validate().is_err());

        let config = config.with_turn_servers(vec![TurnServerConfig {
            url: "turn:turn.campus.local:3478".to_string(),
            username: "user".to_string(),
            credential: "pass".to_string(),
        }]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_ice_urls_fail() {
        let config = CallConfig::default().with_stun_servers(vec!["stun.example.com".into()]);
        assert!(config.validate().is_err());

        let config = CallConfig::default().with_turn_servers(vec![TurnServerConfig {
            url: "stun:wrong.example.com".to_string(),
            username: String::new(),
            credential: String::new(),
        }]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_interval_bounds() {
        assert!(CallConfig::default()
            .with_poll_interval_ms(9)
            .validate()
            .is_err());
        assert!(CallConfig::default()
            .with_poll_interval_ms(1001)
            .validate()
            .is_err());
        assert!(CallConfig::default()
            .with_poll_interval_ms(10)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_invalid_relay_url_fails() {
        let config = CallConfig::default().with_relay_url("ws://localhost:8080");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_media_required() {
        let config = CallConfig::default().with_media(false, false);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets() {
        let config = CallConfig::audio_only("https://relay.example.org");
        assert!(config.validate().is_ok());
        assert!(!config.media.video);
        assert_eq!(config.signaling.relay_url, "https://relay.example.org");

        let config = CallConfig::local_loopback();
        assert!(config.validate().is_ok());
        assert_eq!(config.signaling.poll_interval(), Duration::from_millis(20));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: CallConfig = toml::from_str(
            r#"
            [signaling]
            relay_url = "http://relay:9000"
            "#,
        )
        .unwrap();
        assert_eq!(config.signaling.relay_url, "http://relay:9000");
        assert_eq!(config.signaling.batch_limit, 50);
        assert_eq!(config.stun_servers.len(), 3);
        assert!(config.media.video);
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = dir.path().join("call.yaml");
        std::fs::write(&yaml, "media:\n  video: false\n").unwrap();
        let config = CallConfig::load(&yaml).unwrap();
        assert!(!config.media.video);
        assert!(config.media.audio);

        let json = dir.path().join("call.json");
        std::fs::write(&json, r#"{"signaling":{"poll_interval_ms":5}}"#).unwrap();
        assert!(CallConfig::load(&json).is_err());

        let ini = dir.path().join("call.ini");
        std::fs::write(&ini, "").unwrap();
        assert!(CallConfig::load(&ini).is_err());
    }
}
