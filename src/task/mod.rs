//! Task records and the per-task lifecycle.
//!
//! A task walks `not-started → submitted (→ modal) → in-progress` and ends in
//! exactly one of `success`, `failure` or `cancel`. Transitions are ranked;
//! duplicate or out-of-order updates from the gateway are ignored so replayed
//! events cannot move a task backwards.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::now_ms;

/// Which Discord bot a task targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BotType {
    Mj,
    Niji,
    InsightFace,
}

impl Default for BotType {
    fn default() -> Self {
        BotType::Mj
    }
}

/// Generation speed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountMode {
    Relax,
    Fast,
    Turbo,
}

impl AccountMode {
    /// The prompt keyword that pins this mode.
    pub fn keyword(self) -> &'static str {
        match self {
            AccountMode::Relax => "--relax",
            AccountMode::Fast => "--fast",
            AccountMode::Turbo => "--turbo",
        }
    }

    /// Remove mode keywords from a prompt that the account does not allow.
    pub fn strip_disallowed(prompt: &str, allowed: &[AccountMode]) -> String {
        let mut out = prompt.to_string();
        for mode in [AccountMode::Relax, AccountMode::Fast, AccountMode::Turbo] {
            if !allowed.is_empty() && !allowed.contains(&mode) {
                out = out.replace(mode.keyword(), "");
            }
        }
        out.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskAction {
    Imagine,
    Upscale,
    Variation,
    Reroll,
    Describe,
    Blend,
    Action,
    Pan,
    Outpaint,
    Inpaint,
    Zoom,
    Show,
    Shorten,
    SwapFace,
    SwapVideoFace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    NotStarted,
    Submitted,
    Modal,
    InProgress,
    Success,
    Failure,
    Cancel,
}

impl TaskStatus {
    /// Ordering rank along the lifecycle. Terminal states share the top rank.
    fn rank(self) -> u8 {
        match self {
            TaskStatus::NotStarted => 0,
            TaskStatus::Submitted => 1,
            TaskStatus::Modal => 2,
            TaskStatus::InProgress => 3,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancel => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancel
        )
    }
}

/// A UI control discovered on a result message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Button {
    pub custom_id: String,
    pub emoji: String,
    pub label: String,
    pub style: i32,
    #[serde(rename = "type")]
    pub kind: i32,
}

impl Default for Button {
    fn default() -> Self {
        Self {
            custom_id: String::new(),
            emoji: String::new(),
            label: String::new(),
            style: 2,
            kind: 2,
        }
    }
}

/// One submission tracked end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskInfo {
    pub id: String,
    pub parent_id: String,
    pub bot_type: BotType,
    /// Effective routing target; differs from `bot_type` when a niji task is
    /// served through an mj-only account or vice versa.
    pub real_bot_type: Option<BotType>,
    pub user_id: String,
    pub client_ip: String,
    pub is_white: bool,
    pub nonce: String,
    pub interaction_metadata_id: String,
    pub message_id: String,
    pub message_ids: Vec<String>,
    pub action: TaskAction,
    pub status: TaskStatus,
    pub prompt: String,
    pub prompt_en: String,
    pub prompt_full: String,
    pub description: String,
    pub state: String,
    pub submit_time: u64,
    pub start_time: u64,
    pub finish_time: u64,
    pub image_url: String,
    pub thumbnail_url: String,
    pub progress: String,
    pub fail_reason: String,
    pub buttons: Vec<Button>,
    pub seed: String,
    pub mode: Option<AccountMode>,
    /// Channel id of the owning account.
    pub instance_id: String,
    pub sub_instance_id: String,
    /// Free-form extension map, preserved verbatim on serialization and never
    /// consulted for control flow.
    pub properties: HashMap<String, Value>,
}

impl Default for TaskInfo {
    fn default() -> Self {
        Self {
            id: String::new(),
            parent_id: String::new(),
            bot_type: BotType::Mj,
            real_bot_type: None,
            user_id: String::new(),
            client_ip: String::new(),
            is_white: false,
            nonce: String::new(),
            interaction_metadata_id: String::new(),
            message_id: String::new(),
            message_ids: Vec::new(),
            action: TaskAction::Imagine,
            status: TaskStatus::NotStarted,
            prompt: String::new(),
            prompt_en: String::new(),
            prompt_full: String::new(),
            description: String::new(),
            state: String::new(),
            submit_time: 0,
            start_time: 0,
            finish_time: 0,
            image_url: String::new(),
            thumbnail_url: String::new(),
            progress: String::new(),
            fail_reason: String::new(),
            buttons: Vec::new(),
            seed: String::new(),
            mode: None,
            instance_id: String::new(),
            sub_instance_id: String::new(),
            properties: HashMap::new(),
        }
    }
}

impl TaskInfo {
    pub fn new(action: TaskAction, bot_type: BotType, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            action,
            bot_type,
            prompt: prompt.clone(),
            prompt_en: prompt,
            submit_time: now_ms(),
            ..Default::default()
        }
    }

    pub fn effective_bot_type(&self) -> BotType {
        self.real_bot_type.unwrap_or(self.bot_type)
    }

    /// Runner handed the task to the command transport.
    pub fn mark_submitted(&mut self) -> bool {
        if self.status.rank() >= TaskStatus::Submitted.rank() {
            return false;
        }
        self.status = TaskStatus::Submitted;
        self.start_time = now_ms();
        self.progress = "0%".into();
        true
    }

    /// A modal interaction opened before the job could start.
    pub fn mark_modal(&mut self, message_id: &str) -> bool {
        if self.status != TaskStatus::Submitted {
            return false;
        }
        self.status = TaskStatus::Modal;
        if !message_id.is_empty() {
            self.message_id = message_id.to_string();
        }
        true
    }

    /// Interaction acknowledged; Midjourney accepted the job.
    pub fn mark_in_progress(&mut self) -> bool {
        if self.status.rank() >= TaskStatus::InProgress.rank()
            && self.status != TaskStatus::Modal
        {
            return false;
        }
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::InProgress;
        if self.progress.is_empty() {
            self.progress = "0%".into();
        }
        true
    }

    /// Progress/preview update while rendering. Ignored once terminal.
    pub fn update_progress(&mut self, progress: Option<&str>, image_url: Option<&str>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if let Some(p) = progress {
            self.progress = p.to_string();
        }
        if let Some(url) = image_url {
            self.image_url = url.to_string();
            self.thumbnail_url = url.to_string();
        }
        true
    }

    pub fn mark_success(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Success;
        self.progress = "100%".into();
        self.finish_time = now_ms();
        self.reclassify_from_buttons();
        true
    }

    pub fn mark_failure(&mut self, reason: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Failure;
        self.fail_reason = reason.to_string();
        self.progress = String::new();
        self.finish_time = now_ms();
        true
    }

    pub fn mark_cancelled(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Cancel;
        self.finish_time = now_ms();
        true
    }

    /// Record a correlated message id. The primary `message_id` is set exactly
    /// once; later ids only extend the ordered list.
    pub fn push_message_id(&mut self, id: &str) {
        if self.message_id.is_empty() {
            self.message_id = id.to_string();
        }
        if !self.message_ids.iter().any(|m| m == id) {
            self.message_ids.push(id.to_string());
        }
    }

    /// SHOW tasks carry no action of their own; infer it from the buttons the
    /// finished message exposes, and persist the inferred action.
    fn reclassify_from_buttons(&mut self) {
        if self.action != TaskAction::Show {
            return;
        }
        if self
            .buttons
            .iter()
            .any(|b| b.custom_id.starts_with("MJ::JOB::upsample::1"))
        {
            self.action = TaskAction::Imagine;
        } else if self
            .buttons
            .iter()
            .any(|b| b.custom_id.starts_with("MJ::Inpaint::"))
        {
            self.action = TaskAction::Upscale;
        } else if self
            .buttons
            .iter()
            .any(|b| b.custom_id.starts_with("MJ::Job::PicReader"))
        {
            self.action = TaskAction::Describe;
        }
    }
}

static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,3})%").unwrap());

/// Pull a "N%" progress marker out of message content, if present.
pub fn parse_progress(content: &str) -> Option<String> {
    PROGRESS_RE
        .captures(content)
        .map(|c| format!("{}%", &c[1]))
}
