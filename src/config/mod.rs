//! Runtime configuration.
//!
//! One YAML file covers the account pool, scheduling policy, the HTTP bind
//! address, reverse-proxy overrides for Discord endpoints, callback settings
//! and the notification channels. Account records are normalized (ranges
//! clamped) immediately after load.

pub mod schema;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::account::selector::SelectRule;
use crate::account::DiscordAccount;
use crate::error::{ProxyError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Setting {
    pub server: ServerConfig,
    pub accounts: Vec<DiscordAccount>,
    /// Which selection policy picks an account per task.
    pub account_choose_rule: SelectRule,
    pub ng_discord: NgDiscord,
    pub translate_way: TranslateWay,
    /// Global default callback target; per-submission overrides win.
    pub notify_hook: Option<String>,
    /// Shared secret used to sign callback payloads.
    pub notify_secret: Option<String>,
    pub notify_pool_size: usize,
    pub store_path: String,
    pub image_storage: ImageStorage,
    pub captcha: CaptchaConfig,
    pub smtp: SmtpConfig,
}

impl Default for Setting {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            accounts: Vec::new(),
            account_choose_rule: SelectRule::BestWaitIdle,
            ng_discord: NgDiscord::default(),
            translate_way: TranslateWay::None,
            notify_hook: None,
            notify_secret: None,
            notify_pool_size: 10,
            store_path: "mjproxy.db".to_string(),
            image_storage: ImageStorage::None,
            captcha: CaptchaConfig::default(),
            smtp: SmtpConfig::default(),
        }
    }
}

impl Setting {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut setting: Setting = serde_yaml::from_str(text)
            .map_err(|e| ProxyError::Config(format!("parse config: {e}")))?;
        setting.normalize();
        Ok(setting)
    }

    pub fn normalize(&mut self) {
        if self.notify_pool_size == 0 {
            self.notify_pool_size = 10;
        }
        for account in &mut self.accounts {
            account.normalize();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8086,
        }
    }
}

/// Discord endpoints, overridable with reverse proxies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NgDiscord {
    pub server: String,
    pub cdn: String,
    pub wss: String,
    /// When set, resumes connect here instead of the `resume_gateway_url`
    /// captured from READY.
    pub resume_wss: Option<String>,
    pub upload_server: String,
}

impl Default for NgDiscord {
    fn default() -> Self {
        Self {
            server: "https://discord.com".to_string(),
            cdn: "https://cdn.discordapp.com".to_string(),
            wss: "wss://gateway.discord.gg".to_string(),
            resume_wss: None,
            upload_server: "https://discord-attachments-uploads-prd.storage.googleapis.com"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslateWay {
    None,
    Baidu,
    Gpt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStorage {
    None,
    Local,
    Oss,
}

/// Human-verification relay used when an account gets locked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptchaConfig {
    pub server: Option<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub from: String,
    pub to: String,
    pub user: String,
    pub pass: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 465,
            ssl: true,
            from: String::new(),
            to: String::new(),
            user: String::new(),
            pass: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let setting = Setting::default();
        assert_eq!(setting.server.port, 8086);
        assert_eq!(setting.account_choose_rule, SelectRule::BestWaitIdle);
        assert_eq!(setting.notify_pool_size, 10);
        assert_eq!(setting.ng_discord.wss, "wss://gateway.discord.gg");
    }

    #[test]
    fn yaml_load_applies_account_clamps() {
        let yaml = r#"
server:
  port: 9000
account_choose_rule: polling
accounts:
  - id: acc-1
    channel_id: "1111"
    guild_id: "2222"
    user_token: tok
    timeout_minutes: 120
    interval: 900.0
    core_size: 0
notify_pool_size: 0
"#;
        let setting = Setting::from_yaml(yaml).unwrap();
        assert_eq!(setting.server.port, 9000);
        assert_eq!(setting.account_choose_rule, SelectRule::Polling);
        assert_eq!(setting.notify_pool_size, 10);

        let account = &setting.accounts[0];
        assert_eq!(account.timeout_minutes, 30);
        assert_eq!(account.interval, 180.0);
        assert_eq!(account.core_size, 1);
    }

    #[test]
    fn bad_yaml_is_a_config_error() {
        let err = Setting::from_yaml("server: [not a map").unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }
}
