use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HuddleConfig {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Room relay base URL; the room id and user id are appended as
    /// `<server_url>/<room_id>?user_id=<id>`
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// TLS certificate to pin for the relay connection (system roots if absent)
    pub tls_cert: Option<String>,
}

/// ICE/TURN server configuration for NAT traversal.
///
/// Without TURN, direct paths fail behind symmetric NATs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN server)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// Credential service endpoint returning short-lived TURN credentials
    /// (e.g. "https://relay.example.com/turn-credentials"). Optional; fetch
    /// failure degrades to STUN-only.
    pub credential_url: Option<String>,
    /// Static TURN server URLs used when no credential service is configured
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN username (long-term credential mechanism)
    pub turn_username: Option<String>,
    /// TURN credential/password
    pub turn_credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Initial camera facing: "user" (front) or "environment" (rear)
    #[serde(default = "default_facing")]
    pub facing: String,
    /// Capture framerate
    #[serde(default = "default_framerate")]
    pub framerate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Seconds to wait after a connectivity drop before issuing an ICE
    /// restart offer. Drops that recover within the window send nothing.
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            tls_cert: None,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            credential_url: None,
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            facing: default_facing(),
            framerate: default_framerate(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            restart_window_secs: default_restart_window(),
        }
    }
}

fn default_server_url() -> String {
    "wss://127.0.0.1:8443/call/ws/rooms".to_string()
}

fn default_stun_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_facing() -> String {
    "user".to_string()
}

fn default_framerate() -> u32 {
    30
}

fn default_restart_window() -> u64 {
    3
}
