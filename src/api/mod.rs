//! Core submission surface.
//!
//! The four operations the HTTP layer needs — submit, fetch, cancel, list —
//! plus the return-code vocabulary shared with clients. The axum router here
//! is deliberately thin; auth, rate limiting and richer REST niceties belong
//! to the outer layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::account::registry::{AccountRegistry, SubmissionOutcome};
use crate::account::selector::AccountFilter;
use crate::screen::{PromptScreener, ScreenVerdict};
use crate::store::{Store, TaskQuery};
use crate::task::{AccountMode, BotType, TaskAction, TaskInfo, TaskStatus};

/// Wire return codes.
pub mod code {
    pub const SUCCESS: i32 = 1;
    pub const NOT_FOUND: i32 = 3;
    pub const VALIDATION_ERROR: i32 = 4;
    pub const FAILURE: i32 = 9;
    pub const QUEUE_REJECT_FULL: i32 = 23;
    pub const BANNED_PROMPT: i32 = 24;
    pub const QUEUE_REJECT_NO_AVAILABLE_ACCOUNT: i32 = 25;
    pub const QUEUE_REJECT_NOT_ACCEPTING: i32 = 26;
}

const BAN_COUNTER_TTL_SECS: u64 = 86_400;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubmitTaskRequest {
    pub action: Option<TaskAction>,
    pub prompt: String,
    pub bot_type: Option<BotType>,
    pub mode: Option<AccountMode>,
    pub user_id: String,
    pub state: String,
    pub notify_hook: Option<String>,
    pub sub_instance_id: Option<String>,
    pub account_filter: Option<FilterRequest>,
    /// Extension values carried through to the task verbatim
    /// (button custom ids, uploaded attachment names, …).
    pub properties: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilterRequest {
    pub instance_id: Option<String>,
    pub modes: Vec<AccountMode>,
    pub remix: Option<bool>,
}

impl FilterRequest {
    fn into_filter(self) -> AccountFilter {
        AccountFilter {
            instance_id: self.instance_id.filter(|s| !s.is_empty()),
            modes: self.modes,
            remix: self.remix,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionResult {
    pub code: i32,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, Value>,
}

impl SubmissionResult {
    fn of(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            result: None,
            properties: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListTasksRequest {
    pub statuses: Vec<TaskStatus>,
    pub instance_id: Option<String>,
    pub user_id: Option<String>,
    pub page_size: usize,
    pub page: usize,
}

pub struct ApiService {
    registry: Arc<AccountRegistry>,
    store: Arc<dyn Store>,
    screener: Arc<dyn PromptScreener>,
}

impl ApiService {
    pub fn new(
        registry: Arc<AccountRegistry>,
        store: Arc<dyn Store>,
        screener: Arc<dyn PromptScreener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            screener,
        })
    }

    pub fn submit_task(&self, request: SubmitTaskRequest, client_ip: &str) -> SubmissionResult {
        let action = request.action.unwrap_or(TaskAction::Imagine);
        let needs_prompt = matches!(
            action,
            TaskAction::Imagine | TaskAction::Shorten | TaskAction::Show
        );
        if needs_prompt && request.prompt.trim().is_empty() {
            return SubmissionResult::of(code::VALIDATION_ERROR, "prompt cannot be empty");
        }

        if let ScreenVerdict::Banned { word } = self.screener.screen(&request.prompt) {
            self.bump_ban_counters(&request.user_id, client_ip);
            return SubmissionResult::of(
                code::BANNED_PROMPT,
                format!("Banned prompt detected: {word}"),
            );
        }

        let bot_type = request.bot_type.unwrap_or(BotType::Mj);
        let mut task = TaskInfo::new(action, bot_type, request.prompt.trim());
        task.user_id = request.user_id;
        task.client_ip = client_ip.to_string();
        task.state = request.state;
        task.mode = request.mode;
        task.sub_instance_id = request.sub_instance_id.unwrap_or_default();
        task.properties = request.properties;
        if let Some(hook) = request.notify_hook {
            task.properties
                .insert("notify_hook".to_string(), Value::String(hook));
        }
        let task_id = task.id.clone();

        let filter = request
            .account_filter
            .map(FilterRequest::into_filter)
            .unwrap_or_default();

        match self.registry.submit_task(task, &filter) {
            SubmissionOutcome::Queued { instance_id, .. } => {
                info!(%task_id, %instance_id, "task queued");
                let mut result = SubmissionResult::of(code::SUCCESS, "Submitted");
                result.result = Some(task_id);
                result.properties.insert(
                    "discordInstanceId".to_string(),
                    Value::String(instance_id),
                );
                result
            }
            SubmissionOutcome::NoAvailableAccount => SubmissionResult::of(
                code::QUEUE_REJECT_NO_AVAILABLE_ACCOUNT,
                "no account available for this task",
            ),
            SubmissionOutcome::NotAccepting => SubmissionResult::of(
                code::QUEUE_REJECT_NOT_ACCEPTING,
                "account is not accepting new tasks",
            ),
            SubmissionOutcome::QueueFull => {
                SubmissionResult::of(code::QUEUE_REJECT_FULL, "task queue is full")
            }
            SubmissionOutcome::BotDisabled => {
                SubmissionResult::of(code::FAILURE, "requested bot is disabled on this account")
            }
        }
    }

    pub fn get_task(&self, task_id: &str) -> Option<TaskInfo> {
        self.registry.find_task(task_id)
    }

    pub async fn cancel_task(&self, task_id: &str) -> bool {
        self.registry.cancel_task(task_id).await
    }

    /// Live tasks first (they may not be persisted yet), then the store,
    /// deduplicated by id.
    pub fn list_tasks(&self, request: &ListTasksRequest) -> Vec<TaskInfo> {
        let limit = if request.page_size == 0 {
            50
        } else {
            request.page_size
        };

        let mut tasks: Vec<TaskInfo> = Vec::new();
        for runtime in self.registry.runtimes() {
            if let Some(instance_id) = &request.instance_id {
                if runtime.instance_id() != *instance_id {
                    continue;
                }
            }
            for task in runtime.live_tasks() {
                let status_ok =
                    request.statuses.is_empty() || request.statuses.contains(&task.status);
                let user_ok = request
                    .user_id
                    .as_ref()
                    .map(|u| *u == task.user_id)
                    .unwrap_or(true);
                if status_ok && user_ok {
                    tasks.push(task);
                }
            }
        }
        let stored = self
            .store
            .find_tasks(&TaskQuery {
                statuses: request.statuses.clone(),
                instance_id: request.instance_id.clone(),
                user_id: request.user_id.clone(),
                limit,
                offset: request.page * limit,
            })
            .unwrap_or_default();
        for task in stored {
            if !tasks.iter().any(|t| t.id == task.id) {
                tasks.push(task);
            }
        }
        tasks.truncate(limit);
        tasks
    }

    fn bump_ban_counters(&self, user_id: &str, client_ip: &str) {
        let day = Local::now().format("%Y%m%d");
        for subject in [user_id, client_ip] {
            if subject.is_empty() {
                continue;
            }
            let key = format!("banned:{day}:{subject}");
            let _ = self.store.incr_counter(&key, BAN_COUNTER_TTL_SECS);
        }
    }
}

// ─── Router ─────────────────────────────────────────────────────────

pub fn router(service: Arc<ApiService>) -> Router {
    Router::new()
        .route("/mj/submit/task", post(submit_task_handler))
        .route("/mj/task/{id}/fetch", get(get_task_handler))
        .route("/mj/task/{id}/cancel", post(cancel_task_handler))
        .route("/mj/task/list", get(list_tasks_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

fn client_ip_from(headers: &HeaderMap) -> String {
    for name in ["x-real-ip", "x-forwarded-for"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if let Some(ip) = value.split(',').next() {
                let ip = ip.trim();
                if !ip.is_empty() {
                    return ip.to_string();
                }
            }
        }
    }
    String::new()
}

async fn submit_task_handler(
    State(service): State<Arc<ApiService>>,
    headers: HeaderMap,
    Json(request): Json<SubmitTaskRequest>,
) -> Json<SubmissionResult> {
    let client_ip = client_ip_from(&headers);
    Json(service.submit_task(request, &client_ip))
}

async fn get_task_handler(
    State(service): State<Arc<ApiService>>,
    Path(id): Path<String>,
) -> Json<Value> {
    match service.get_task(&id) {
        Some(task) => Json(serde_json::to_value(task).unwrap_or(Value::Null)),
        None => Json(serde_json::json!({
            "code": code::NOT_FOUND,
            "description": "task not found",
        })),
    }
}

async fn cancel_task_handler(
    State(service): State<Arc<ApiService>>,
    Path(id): Path<String>,
) -> Json<SubmissionResult> {
    // Give an in-flight cancel a moment to land before answering.
    let cancelled = tokio::time::timeout(Duration::from_secs(5), service.cancel_task(&id))
        .await
        .unwrap_or(false);
    if cancelled {
        Json(SubmissionResult::of(code::SUCCESS, "cancelled"))
    } else {
        Json(SubmissionResult::of(code::NOT_FOUND, "task not found"))
    }
}

async fn list_tasks_handler(
    State(service): State<Arc<ApiService>>,
    Query(request): Query<ListTasksRequest>,
) -> Json<Vec<TaskInfo>> {
    Json(service.list_tasks(&request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::selector::SelectRule;
    use crate::account::DiscordAccount;
    use crate::config::Setting;
    use crate::notify::mail::LogMailNotifier;
    use crate::notify::CallbackDispatcher;
    use crate::screen::WordListScreener;
    use crate::store::{BannedWord, SqliteStore};
    use crate::transport::{MockCommandTransport, TransportOutcome};

    fn service_with(accounts: Vec<DiscordAccount>) -> (Arc<ApiService>, Arc<SqliteStore>) {
        let mut setting = Setting::default();
        setting.account_choose_rule = SelectRule::BestWaitIdle;
        setting.normalize();

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut transport = MockCommandTransport::new();
        transport
            .expect_send()
            .returning(|_, _, _| TransportOutcome::Delivered);

        let registry = AccountRegistry::new(
            setting,
            store.clone(),
            Arc::new(transport),
            CallbackDispatcher::new(1, None, None),
            Arc::new(LogMailNotifier::new(Default::default())),
        );
        for account in accounts {
            store.save_account(&account).unwrap();
            registry.register(account);
        }
        let screener = Arc::new(WordListScreener::new(store.clone()));
        (ApiService::new(registry, store.clone(), screener), store)
    }

    fn account(id: &str) -> DiscordAccount {
        let mut account = DiscordAccount {
            id: id.to_string(),
            channel_id: format!("chan-{id}"),
            guild_id: "g".into(),
            user_token: "tok".into(),
            ..Default::default()
        };
        account.normalize();
        account
    }

    #[tokio::test]
    async fn submit_returns_task_id_and_instance() {
        let (service, _) = service_with(vec![account("a1")]);
        let result = service.submit_task(
            SubmitTaskRequest {
                prompt: "Cat".into(),
                ..Default::default()
            },
            "10.0.0.1",
        );
        assert_eq!(result.code, code::SUCCESS);
        assert!(result.result.is_some());
        assert_eq!(
            result.properties.get("discordInstanceId"),
            Some(&Value::String("chan-a1".into()))
        );
    }

    #[tokio::test]
    async fn empty_prompt_is_a_validation_error() {
        let (service, _) = service_with(vec![account("a1")]);
        let result = service.submit_task(
            SubmitTaskRequest {
                prompt: "   ".into(),
                ..Default::default()
            },
            "",
        );
        assert_eq!(result.code, code::VALIDATION_ERROR);
    }

    #[tokio::test]
    async fn no_account_yields_queue_reject() {
        let (service, _) = service_with(vec![]);
        let result = service.submit_task(
            SubmitTaskRequest {
                prompt: "Cat".into(),
                ..Default::default()
            },
            "",
        );
        assert_eq!(result.code, code::QUEUE_REJECT_NO_AVAILABLE_ACCOUNT);
    }

    #[tokio::test]
    async fn banned_prompt_rejects_and_counts() {
        let (service, store) = service_with(vec![account("a1")]);
        store
            .save_banned_word(&BannedWord {
                id: "b1".into(),
                words: vec!["forbidden".into()],
                enable: true,
            })
            .unwrap();

        let result = service.submit_task(
            SubmitTaskRequest {
                prompt: "a forbidden thing".into(),
                user_id: "u1".into(),
                ..Default::default()
            },
            "10.0.0.2",
        );
        assert_eq!(result.code, code::BANNED_PROMPT);
        assert!(result.description.contains("Banned prompt detected"));

        let day = Local::now().format("%Y%m%d");
        assert_eq!(
            store.get_counter(&format!("banned:{day}:u1")).unwrap(),
            1
        );
        assert_eq!(
            store
                .get_counter(&format!("banned:{day}:10.0.0.2"))
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn get_and_cancel_round_trip() {
        let (service, _) = service_with(vec![account("a1")]);
        let result = service.submit_task(
            SubmitTaskRequest {
                prompt: "Cat".into(),
                ..Default::default()
            },
            "",
        );
        let task_id = result.result.unwrap();

        assert!(service.get_task(&task_id).is_some());
        assert!(service.cancel_task(&task_id).await);
        assert_eq!(
            service.get_task(&task_id).unwrap().status,
            TaskStatus::Cancel
        );
        assert!(!service.cancel_task("missing").await);
    }

    #[test]
    fn client_ip_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip_from(&headers), "");

        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        assert_eq!(client_ip_from(&headers), "10.1.2.3");

        headers.insert("x-real-ip", "192.168.9.9".parse().unwrap());
        assert_eq!(client_ip_from(&headers), "192.168.9.9");
    }
}
