//! Identify payload for user-token gateway sessions.
//!
//! Discord expects the client properties to agree with the HTTP `User-Agent`
//! the account uses elsewhere, so the browser family, version and OS are
//! parsed out of that string rather than hardcoded.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Client capability bits sent by the official web client.
pub const CLIENT_CAPABILITIES: u32 = 16381;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// The `d` payload of an IDENTIFY frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthData {
    pub token: String,
    pub capabilities: u32,
    pub properties: ClientProperties,
    pub presence: Presence,
    pub compress: bool,
    pub client_state: ClientState,
}

impl AuthData {
    pub fn new(token: impl Into<String>, user_agent: &str) -> Self {
        Self {
            token: token.into(),
            capabilities: CLIENT_CAPABILITIES,
            properties: ClientProperties::from_user_agent(user_agent),
            presence: Presence::online(),
            compress: false,
            client_state: ClientState::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
    pub system_locale: String,
    pub browser_user_agent: String,
    pub browser_version: String,
    pub os_version: String,
    pub referrer: String,
    pub referring_domain: String,
    pub release_channel: String,
    pub client_build_number: u32,
}

static BROWSER_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(Edg|Chrome|Firefox|Version)/(\d+)\.(\d+)").unwrap());
static WINDOWS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Windows NT (\d+(?:\.\d+)?)").unwrap());
static MACOS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Mac OS X (\d+(?:[._]\d+)*)").unwrap());

impl ClientProperties {
    /// Derive browser family, `major.minor` version, OS and device from a
    /// desktop browser user-agent string.
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = if user_agent.trim().is_empty() {
            DEFAULT_USER_AGENT
        } else {
            user_agent
        };

        let browser = if ua.contains("Edg/") {
            "Edge"
        } else if ua.contains("Firefox/") {
            "Firefox"
        } else if ua.contains("Chrome/") {
            "Chrome"
        } else if ua.contains("Safari/") {
            "Safari"
        } else {
            "Chrome"
        };

        let browser_version = BROWSER_VERSION_RE
            .captures(ua)
            .map(|c| format!("{}.{}", &c[2], &c[3]))
            .unwrap_or_else(|| "124.0".to_string());

        let (os, os_version) = if let Some(c) = WINDOWS_RE.captures(ua) {
            ("Windows".to_string(), c[1].to_string())
        } else if let Some(c) = MACOS_RE.captures(ua) {
            ("Mac OS X".to_string(), c[1].replace('_', "."))
        } else if ua.contains("Linux") || ua.contains("X11") {
            ("Linux".to_string(), String::new())
        } else {
            ("Windows".to_string(), "10".to_string())
        };

        Self {
            os,
            browser: browser.to_string(),
            device: String::new(),
            system_locale: "en-US".to_string(),
            browser_user_agent: ua.to_string(),
            browser_version,
            os_version,
            referrer: String::new(),
            referring_domain: String::new(),
            release_channel: "stable".to_string(),
            client_build_number: 275_530,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub status: String,
    pub since: u64,
    pub activities: Vec<Value>,
    pub afk: bool,
}

impl Presence {
    pub fn online() -> Self {
        Self {
            status: "online".to_string(),
            since: 0,
            activities: Vec::new(),
            afk: false,
        }
    }
}

/// Sent empty; the server fills in per-guild versions after READY.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    pub guild_versions: Map<String, Value>,
}
