//! Discord account records and the pure predicates derived from them.
//!
//! Runtime scheduling state (queues, in-flight counts) lives in
//! [`runtime::AccountRuntime`]; this module is the persisted record plus
//! everything computable from it alone: time windows, sub-channel routing,
//! component-derived feature switches, and the accept-new-task predicate.

pub mod registry;
pub mod runtime;
pub mod selector;

use std::collections::HashMap;

use chrono::{Local, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::schema::{minute_of_day, parse_time};
use crate::gateway::auth::DEFAULT_USER_AGENT;
use crate::gateway::events::WireComponent;
use crate::task::{AccountMode, BotType, TaskAction};

/// Ordered daily `[start, end]` intervals in minutes-of-day. An interval with
/// `end < start` crosses midnight.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeWindows {
    windows: Vec<(u16, u16)>,
}

impl TimeWindows {
    /// Parse a spec like `"09:00-12:00,13:30-18:00"`. Empty input parses to
    /// an empty window list.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut windows = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (start, end) = part
                .split_once('-')
                .ok_or_else(|| format!("Invalid window: {part}. Expected HH:MM-HH:MM"))?;
            let (sh, sm) = parse_time(start)?;
            let (eh, em) = parse_time(end)?;
            windows.push((minute_of_day(sh, sm), minute_of_day(eh, em)));
        }
        Ok(Self { windows })
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn contains(&self, minute: u16) -> bool {
        self.windows.iter().any(|&(start, end)| {
            if end < start {
                minute >= start || minute <= end
            } else {
                minute >= start && minute <= end
            }
        })
    }
}

/// Current local time as a minute-of-day.
pub fn local_minute_of_day() -> u16 {
    let now = Local::now();
    (now.hour() * 60 + now.minute()) as u16
}

static SUB_CHANNEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https://discord\.com/channels/(\d+)/(\d+)").unwrap());

/// Parse configured sub-channel entries into `{channel_id → guild_id}`.
///
/// Entries are channel URLs, possibly comma-joined with arbitrary labels;
/// anything without the canonical URL is skipped.
pub fn parse_sub_channels(entries: &[String]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for entry in entries {
        for part in entry.split(',') {
            if let Some(caps) = SUB_CHANNEL_RE.captures(part.trim()) {
                map.insert(caps[2].to_string(), caps[1].to_string());
            }
        }
    }
    map
}

/// One configured Discord identity driving Midjourney in one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordAccount {
    pub id: String,
    pub guild_id: String,
    /// The channel this account drives; doubles as the instance id.
    pub channel_id: String,
    /// DM channel with the MJ bot, used for seed retrieval.
    pub private_channel_id: String,
    pub niji_private_channel_id: String,
    pub user_token: String,
    pub bot_token: String,
    pub user_agent: String,
    pub enable: bool,
    pub enable_mj: bool,
    pub enable_niji: bool,
    pub is_blend: bool,
    pub is_describe: bool,
    pub is_shorten: bool,
    /// -1 means unlimited.
    pub day_draw_limit: i64,
    pub day_draw_count: i64,
    /// Max concurrent in-flight tasks.
    pub core_size: u32,
    /// Soft queue target used for display/estimation.
    pub queue_size: u32,
    /// Hard cap on waiting + in-flight.
    pub max_queue_size: u32,
    pub timeout_minutes: u32,
    /// Seconds to wait between the previous dispatch and the next.
    pub interval: f64,
    pub after_interval_min: f64,
    pub after_interval_max: f64,
    pub weight: u32,
    pub sort: u32,
    /// Empty means always within work hours.
    pub work_time: String,
    /// Empty means never fishing.
    pub fishing_time: String,
    pub mode: Option<AccountMode>,
    pub allow_modes: Vec<AccountMode>,
    pub fast_exhausted: bool,
    pub enable_fast_to_relax: bool,
    pub enable_relax_to_fast: bool,
    pub remix_auto_submit: bool,
    pub sub_channels: Vec<String>,
    pub components: Vec<WireComponent>,
    pub niji_components: Vec<WireComponent>,
    /// Human-verification block; the account stays configured but refuses
    /// work until cleared.
    pub locked: bool,
    pub disabled_reason: Option<String>,
    pub remark: String,
}

impl Default for DiscordAccount {
    fn default() -> Self {
        Self {
            id: String::new(),
            guild_id: String::new(),
            channel_id: String::new(),
            private_channel_id: String::new(),
            niji_private_channel_id: String::new(),
            user_token: String::new(),
            bot_token: String::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            enable: true,
            enable_mj: true,
            enable_niji: true,
            is_blend: true,
            is_describe: true,
            is_shorten: true,
            day_draw_limit: -1,
            day_draw_count: 0,
            core_size: 3,
            queue_size: 10,
            max_queue_size: 100,
            timeout_minutes: 5,
            interval: 1.2,
            after_interval_min: 1.2,
            after_interval_max: 1.2,
            weight: 1,
            sort: 0,
            work_time: String::new(),
            fishing_time: String::new(),
            mode: None,
            allow_modes: Vec::new(),
            fast_exhausted: false,
            enable_fast_to_relax: false,
            enable_relax_to_fast: false,
            remix_auto_submit: false,
            sub_channels: Vec::new(),
            components: Vec::new(),
            niji_components: Vec::new(),
            locked: false,
            disabled_reason: None,
            remark: String::new(),
        }
    }
}

const MAX_PACING_SECS: f64 = 180.0;

impl DiscordAccount {
    /// Clamp configured values into their documented ranges. Called on load
    /// and after admin updates.
    pub fn normalize(&mut self) {
        self.core_size = self.core_size.max(1);
        self.timeout_minutes = self.timeout_minutes.clamp(5, 30);
        self.interval = self.interval.clamp(0.0, MAX_PACING_SECS);
        self.after_interval_min = self.after_interval_min.clamp(0.0, MAX_PACING_SECS);
        self.after_interval_max = self
            .after_interval_max
            .clamp(self.after_interval_min, MAX_PACING_SECS);
        if self.max_queue_size == 0 {
            self.max_queue_size = self.queue_size.max(1);
        }
        self.queue_size = self.queue_size.min(self.max_queue_size);
        if self.day_draw_limit < -1 {
            self.day_draw_limit = -1;
        }
        for spec in [&self.work_time, &self.fishing_time] {
            if let Err(e) = TimeWindows::parse(spec) {
                warn!(account_id = %self.id, "ignoring unparsable time window: {e}");
            }
        }
    }

    pub fn display_name(&self) -> &str {
        if self.remark.is_empty() {
            &self.channel_id
        } else {
            &self.remark
        }
    }

    pub fn sub_channel_map(&self) -> HashMap<String, String> {
        parse_sub_channels(&self.sub_channels)
    }

    pub fn bot_allowed(&self, bot: BotType) -> bool {
        match bot {
            BotType::Mj => self.enable_mj,
            BotType::Niji => self.enable_niji,
            BotType::InsightFace => false,
        }
    }

    pub fn supports_action(&self, action: TaskAction) -> bool {
        match action {
            TaskAction::Blend => self.is_blend,
            TaskAction::Describe => self.is_describe,
            TaskAction::Shorten => self.is_shorten,
            _ => true,
        }
    }

    pub fn mode_allowed(&self, mode: AccountMode) -> bool {
        self.allow_modes.is_empty() || self.allow_modes.contains(&mode)
    }

    pub fn day_limit_reached(&self) -> bool {
        self.day_draw_limit >= 0 && self.day_draw_count >= self.day_draw_limit
    }

    fn windows_or_empty(&self, spec: &str) -> TimeWindows {
        TimeWindows::parse(spec).unwrap_or_default()
    }

    pub fn in_work_time(&self, minute: u16) -> bool {
        let windows = self.windows_or_empty(&self.work_time);
        windows.is_empty() || windows.contains(minute)
    }

    pub fn in_fishing_time(&self, minute: u16) -> bool {
        let windows = self.windows_or_empty(&self.fishing_time);
        !windows.is_empty() && windows.contains(minute)
    }

    /// Whether this account takes new submissions right now. In-flight work
    /// continues regardless.
    pub fn is_accept_new_task(&self, minute: u16) -> bool {
        self.enable
            && !self.locked
            && !self.day_limit_reached()
            && self.in_work_time(minute)
            && !self.in_fishing_time(minute)
    }

    pub fn components_for(&self, bot: BotType) -> &[WireComponent] {
        match bot {
            BotType::Niji => &self.niji_components,
            _ => &self.components,
        }
    }

    /// Remix toggled on, read from the cached settings components.
    pub fn is_remix_on(&self, bot: BotType) -> bool {
        button_enabled(self.components_for(bot), "Remix mode")
    }

    /// Fast mode toggled on, read from the cached settings components.
    pub fn fast_mode_on(&self, bot: BotType) -> bool {
        button_enabled(self.components_for(bot), "Fast mode")
    }
}

/// A settings button reads as enabled when rendered in the success style.
fn button_enabled(rows: &[WireComponent], label: &str) -> bool {
    fn walk(components: &[WireComponent], label: &str) -> bool {
        components.iter().any(|c| {
            (c.label == label && c.style == 3) || walk(&c.components, label)
        })
    }
    walk(rows, label)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_account(work: &str, fishing: &str) -> DiscordAccount {
        DiscordAccount {
            work_time: work.to_string(),
            fishing_time: fishing.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn sub_channel_parser_extracts_exact_pairs() {
        let entries = vec![
            "https://discord.com/channels/111/222".to_string(),
            "main pool,https://discord.com/channels/333/444,misc note".to_string(),
            "not a url".to_string(),
        ];
        let map = parse_sub_channels(&entries);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("222").map(String::as_str), Some("111"));
        assert_eq!(map.get("444").map(String::as_str), Some("333"));
    }

    #[test]
    fn time_window_plain_interval() {
        let w = TimeWindows::parse("09:00-18:00").unwrap();
        assert!(w.contains(minute_of_day(9, 0)));
        assert!(w.contains(minute_of_day(12, 30)));
        assert!(!w.contains(minute_of_day(8, 59)));
        assert!(!w.contains(minute_of_day(18, 1)));
    }

    #[test]
    fn time_window_crossing_midnight() {
        let w = TimeWindows::parse("22:00-06:00").unwrap();
        assert!(w.contains(minute_of_day(23, 15)));
        assert!(w.contains(minute_of_day(2, 0)));
        assert!(w.contains(minute_of_day(6, 0)));
        assert!(!w.contains(minute_of_day(12, 0)));
    }

    #[test]
    fn empty_work_time_always_accepts() {
        let account = window_account("", "");
        assert!(account.is_accept_new_task(minute_of_day(3, 0)));
    }

    #[test]
    fn fishing_hours_refuse_new_tasks() {
        let account = window_account("", "22:00-06:00");
        assert!(!account.is_accept_new_task(minute_of_day(23, 15)));
        assert!(account.is_accept_new_task(minute_of_day(12, 0)));
    }

    #[test]
    fn day_limit_blocks_acceptance() {
        let mut account = DiscordAccount::default();
        account.day_draw_limit = 10;
        account.day_draw_count = 10;
        assert!(!account.is_accept_new_task(minute_of_day(12, 0)));

        account.day_draw_limit = -1;
        account.day_draw_count = 100_000;
        assert!(account.is_accept_new_task(minute_of_day(12, 0)));
    }

    #[test]
    fn normalize_clamps_ranges() {
        let mut account = DiscordAccount {
            core_size: 0,
            timeout_minutes: 90,
            interval: 500.0,
            after_interval_min: 200.0,
            after_interval_max: 1.0,
            queue_size: 50,
            max_queue_size: 10,
            day_draw_limit: -7,
            ..Default::default()
        };
        account.normalize();
        assert_eq!(account.core_size, 1);
        assert_eq!(account.timeout_minutes, 30);
        assert_eq!(account.interval, 180.0);
        assert_eq!(account.after_interval_min, 180.0);
        assert_eq!(account.after_interval_max, 180.0);
        assert_eq!(account.queue_size, 10);
        assert_eq!(account.day_draw_limit, -1);
    }

    #[test]
    fn normalize_clamps_low_timeout() {
        let mut account = DiscordAccount {
            timeout_minutes: 1,
            ..Default::default()
        };
        account.normalize();
        assert_eq!(account.timeout_minutes, 5);
    }

    #[test]
    fn remix_predicate_reads_button_style() {
        let on = serde_json::json!([{
            "type": 1,
            "components": [
                {"type": 2, "label": "Remix mode", "style": 3, "custom_id": "MJ::Settings::RemixMode::1"}
            ]
        }]);
        let off = serde_json::json!([{
            "type": 1,
            "components": [
                {"type": 2, "label": "Remix mode", "style": 2, "custom_id": "MJ::Settings::RemixMode::1"}
            ]
        }]);
        let mut account = DiscordAccount::default();
        account.components = serde_json::from_value(on).unwrap();
        account.niji_components = serde_json::from_value(off).unwrap();
        assert!(account.is_remix_on(BotType::Mj));
        assert!(!account.is_remix_on(BotType::Niji));
    }
}
