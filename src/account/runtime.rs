//! Per-account task executor.
//!
//! One runtime owns one account's scheduling state: the FIFO waiting queue,
//! the bounded in-flight set, pacing timers, the daily counter and the
//! correlation maps that tie gateway events back to tasks. Two loops drive
//! it: the runner dequeues and dispatches, the event loop applies gateway
//! events. Everything else (selector, HTTP surface) sees immutable
//! snapshots.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Local;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::account::{local_minute_of_day, DiscordAccount};
use crate::gateway::events::{DispatchEvent, MessageData, WireComponent};
use crate::gateway::{GatewayEvent, GatewaySession};
use crate::notify::CallbackDispatcher;
use crate::store::Store;
use crate::task::{parse_progress, AccountMode, BotType, TaskAction, TaskInfo, TaskStatus};
use crate::transport::{
    Command, CommandTransport, DispatchTarget, TransportOutcome, NIJI_APPLICATION_ID,
};
use crate::utils::generate_nonce;

/// Attempts for a terminal task write before giving up.
const TERMINAL_SAVE_ATTEMPTS: u32 = 3;
/// Attempts for a retriable command dispatch.
const DISPATCH_ATTEMPTS: u32 = 3;
/// TTL for banned-prompt counters.
const BAN_COUNTER_TTL_SECS: u64 = 86_400;

/// Outcome of [`AccountRuntime::submit`].
pub enum SubmitResult {
    Accepted(Arc<TaskHandle>),
    RejectedQueueFull,
    RejectedNotAcceptingNewTasks,
    RejectedBotDisabled,
}

/// A task owned by the runtime between submission and terminal transition.
pub struct TaskHandle {
    task: Mutex<TaskInfo>,
    done: Notify,
    deadline: Mutex<Option<Instant>>,
}

impl TaskHandle {
    fn new(task: TaskInfo) -> Arc<Self> {
        Arc::new(Self {
            task: Mutex::new(task),
            done: Notify::new(),
            deadline: Mutex::new(None),
        })
    }

    pub fn snapshot(&self) -> TaskInfo {
        lock(&self.task).clone()
    }

    pub fn id(&self) -> String {
        lock(&self.task).id.clone()
    }

    /// Wait until the task reaches a terminal state or the timeout elapses.
    /// Returns the latest snapshot either way.
    pub async fn wait(&self, limit: Duration) -> TaskInfo {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if lock(&self.task).status.is_terminal() {
                return self.snapshot();
            }
            let notified = self.done.notified();
            if lock(&self.task).status.is_terminal() {
                return self.snapshot();
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.snapshot();
            }
        }
    }
}

/// Structural account facts the selector reads. Time-dependent acceptance is
/// evaluated separately so the cache never goes stale across minutes.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub instance_id: String,
    pub enable: bool,
    pub locked: bool,
    pub core_size: u32,
    pub max_queue_size: u32,
    pub weight: u32,
    pub sort: u32,
    pub mode: Option<AccountMode>,
    pub allow_modes: Vec<AccountMode>,
    pub enable_mj: bool,
    pub enable_niji: bool,
    pub is_blend: bool,
    pub is_describe: bool,
    pub is_shorten: bool,
    pub remix_on_mj: bool,
    pub remix_on_niji: bool,
}

pub struct AccountRuntime {
    account: RwLock<DiscordAccount>,
    session: Arc<GatewaySession>,
    store: Arc<dyn Store>,
    transport: Arc<dyn CommandTransport>,
    callbacks: CallbackDispatcher,

    queue: Mutex<VecDeque<Arc<TaskHandle>>>,
    running: DashMap<String, Arc<TaskHandle>>,
    by_nonce: DashMap<String, String>,
    by_interaction: DashMap<String, String>,
    by_message: DashMap<String, String>,

    wake: Notify,
    last_dispatch: Mutex<Option<Instant>>,
    snapshot_cache: Mutex<Option<AccountSnapshot>>,
    day_marker: Mutex<String>,
    shutdown: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn today_marker() -> String {
    Local::now().format("%Y%m%d").to_string()
}

impl AccountRuntime {
    pub fn new(
        account: DiscordAccount,
        session: Arc<GatewaySession>,
        store: Arc<dyn Store>,
        transport: Arc<dyn CommandTransport>,
        callbacks: CallbackDispatcher,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            account: RwLock::new(account),
            session,
            store,
            transport,
            callbacks,
            queue: Mutex::new(VecDeque::new()),
            running: DashMap::new(),
            by_nonce: DashMap::new(),
            by_interaction: DashMap::new(),
            by_message: DashMap::new(),
            wake: Notify::new(),
            last_dispatch: Mutex::new(None),
            snapshot_cache: Mutex::new(None),
            day_marker: Mutex::new(today_marker()),
            shutdown,
        })
    }

    /// Start the runner and event loops.
    pub fn spawn(self: &Arc<Self>, events: mpsc::UnboundedReceiver<GatewayEvent>) {
        let runtime = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            runtime.runner_loop(shutdown).await;
        });

        let runtime = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            runtime.event_loop(events, shutdown).await;
        });
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.wake.notify_waiters();
    }

    // ─── Read side ──────────────────────────────────────────────────

    pub fn account(&self) -> DiscordAccount {
        self.account.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn instance_id(&self) -> String {
        self.read_account(|a| a.channel_id.clone())
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Waiting plus in-flight, the figure bounded by `max_queue_size`.
    pub fn depth(&self) -> usize {
        self.queue_len() + self.in_flight()
    }

    pub fn is_accept_new_task(&self) -> bool {
        self.read_account(|a| a.is_accept_new_task(local_minute_of_day()))
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        if let Some(cached) = lock(&self.snapshot_cache).clone() {
            return cached;
        }
        let snapshot = self.read_account(|a| AccountSnapshot {
            account_id: a.id.clone(),
            instance_id: a.channel_id.clone(),
            enable: a.enable,
            locked: a.locked,
            core_size: a.core_size,
            max_queue_size: a.max_queue_size,
            weight: a.weight,
            sort: a.sort,
            mode: a.mode,
            allow_modes: a.allow_modes.clone(),
            enable_mj: a.enable_mj,
            enable_niji: a.enable_niji,
            is_blend: a.is_blend,
            is_describe: a.is_describe,
            is_shorten: a.is_shorten,
            remix_on_mj: a.is_remix_on(BotType::Mj),
            remix_on_niji: a.is_remix_on(BotType::Niji),
        });
        *lock(&self.snapshot_cache) = Some(snapshot.clone());
        snapshot
    }

    /// Snapshots of every queued and in-flight task, submit order first.
    pub fn live_tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> =
            lock(&self.queue).iter().map(|h| h.snapshot()).collect();
        tasks.extend(self.running.iter().map(|e| e.value().snapshot()));
        tasks
    }

    pub fn get_task(&self, task_id: &str) -> Option<TaskInfo> {
        if let Some(handle) = self.running.get(task_id) {
            return Some(handle.snapshot());
        }
        lock(&self.queue)
            .iter()
            .find(|h| h.id() == task_id)
            .map(|h| h.snapshot())
    }

    fn read_account<R>(&self, f: impl FnOnce(&DiscordAccount) -> R) -> R {
        f(&self.account.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn mutate_account<R>(&self, f: impl FnOnce(&mut DiscordAccount) -> R) -> R {
        let result = f(&mut self.account.write().unwrap_or_else(|e| e.into_inner()));
        self.invalidate_snapshot();
        result
    }

    fn invalidate_snapshot(&self) {
        *lock(&self.snapshot_cache) = None;
    }

    fn persist_account_fields(&self, fields: &[&str]) {
        let account = self.account();
        if let Err(e) = self.store.update_account_fields(&account, fields) {
            warn!(account_id = %account.id, ?fields, "persist account fields: {e}");
        }
    }

    // ─── Submission ─────────────────────────────────────────────────

    pub fn submit(&self, mut task: TaskInfo) -> SubmitResult {
        {
            let account = self.account.read().unwrap_or_else(|e| e.into_inner());
            if !account.enable || account.locked {
                return SubmitResult::RejectedBotDisabled;
            }
            let bot = task.effective_bot_type();
            if !account.bot_allowed(bot) || !account.supports_action(task.action) {
                return SubmitResult::RejectedBotDisabled;
            }
            if account.day_limit_reached() {
                return SubmitResult::RejectedNotAcceptingNewTasks;
            }
            let minute = local_minute_of_day();
            if !account.in_work_time(minute) || account.in_fishing_time(minute) {
                return SubmitResult::RejectedNotAcceptingNewTasks;
            }
            if self.depth() >= account.max_queue_size as usize {
                return SubmitResult::RejectedQueueFull;
            }

            task.instance_id = account.channel_id.clone();
            match task.mode {
                Some(mode) if !account.mode_allowed(mode) => task.mode = account.mode,
                None => task.mode = account.mode,
                _ => {}
            }
            let prompt = if task.prompt_en.is_empty() {
                task.prompt.clone()
            } else {
                task.prompt_en.clone()
            };
            task.prompt_full = AccountMode::strip_disallowed(&prompt, &account.allow_modes);
        }

        let handle = TaskHandle::new(task);
        lock(&self.queue).push_back(Arc::clone(&handle));
        self.invalidate_snapshot();
        self.wake.notify_one();
        SubmitResult::Accepted(handle)
    }

    /// Best-effort cancel: queued tasks are removed outright, in-flight tasks
    /// get a cancel command before being marked.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let queued = {
            let mut queue = lock(&self.queue);
            match queue.iter().position(|h| h.id() == task_id) {
                Some(idx) => queue.remove(idx),
                None => None,
            }
        };
        if let Some(handle) = queued {
            lock(&handle.task).mark_cancelled();
            self.finalize(&handle).await;
            return true;
        }

        let Some(handle) = self.running.get(task_id).map(|h| Arc::clone(&h)) else {
            return false;
        };
        let (target, message_id) = {
            let task = lock(&handle.task);
            (self.target_for(&task), task.message_id.clone())
        };
        if !message_id.is_empty() {
            let nonce = generate_nonce();
            let outcome = self
                .transport
                .send(&target, &nonce, &Command::CancelJob { message_id })
                .await;
            debug!(task_id, ?outcome, "cancel command sent");
        }
        if lock(&handle.task).mark_cancelled() {
            self.finalize(&handle).await;
        }
        true
    }

    // ─── Runner ─────────────────────────────────────────────────────

    async fn runner_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            while self.has_capacity() {
                let Some(handle) = lock(&self.queue).pop_front() else {
                    break;
                };
                self.invalidate_snapshot();
                self.pace_before_dispatch().await;
                self.dispatch(handle).await;
                self.pause_after_dispatch().await;
            }
        }
    }

    fn has_capacity(&self) -> bool {
        let core_size = self.read_account(|a| a.core_size) as usize;
        self.in_flight() < core_size
    }

    /// Honor the configured gap since the previous dispatch.
    async fn pace_before_dispatch(&self) {
        let interval = Duration::from_secs_f64(self.read_account(|a| a.interval).max(0.0));
        let elapsed = lock(&self.last_dispatch).map(|t| t.elapsed());
        if let Some(elapsed) = elapsed {
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
    }

    async fn pause_after_dispatch(&self) {
        let (min, max) = self.read_account(|a| (a.after_interval_min, a.after_interval_max));
        let secs = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        if secs > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }
    }

    async fn dispatch(&self, handle: Arc<TaskHandle>) {
        let nonce = generate_nonce();
        let (task_id, command, target, timeout_minutes) = {
            let mut task = lock(&handle.task);
            task.mark_submitted();
            task.nonce = nonce.clone();
            let command = self.command_for(&task);
            let target = self.target_for(&task);
            let timeout_minutes = self.read_account(|a| a.timeout_minutes);
            (task.id.clone(), command, target, timeout_minutes)
        };

        let command = match command {
            Some(command) => command,
            None => {
                lock(&handle.task).mark_failure("unsupported action for this account");
                self.finalize(&handle).await;
                return;
            }
        };

        // Register correlation before sending so a fast gateway echo can
        // already find the task.
        self.by_nonce.insert(nonce.clone(), task_id.clone());
        self.running.insert(task_id.clone(), Arc::clone(&handle));
        *lock(&handle.deadline) =
            Some(Instant::now() + Duration::from_secs(timeout_minutes as u64 * 60));
        *lock(&self.last_dispatch) = Some(Instant::now());
        self.invalidate_snapshot();
        self.save_task_best_effort(&handle);

        let mut outcome = TransportOutcome::Terminal("not sent".into());
        for attempt in 0..DISPATCH_ATTEMPTS {
            outcome = self.transport.send(&target, &nonce, &command).await;
            match &outcome {
                TransportOutcome::Delivered => break,
                TransportOutcome::Retry(reason) => {
                    warn!(%task_id, attempt, "dispatch retry: {reason}");
                    tokio::time::sleep(Duration::from_millis(500 * (attempt as u64 + 1))).await;
                }
                TransportOutcome::Terminal(_) => break,
            }
        }

        match outcome {
            TransportOutcome::Delivered => {
                debug!(%task_id, "command dispatched");
            }
            TransportOutcome::Retry(reason) | TransportOutcome::Terminal(reason) => {
                lock(&handle.task).mark_failure(&format!("dispatch rejected: {reason}"));
                self.finalize(&handle).await;
            }
        }
    }

    fn command_for(&self, task: &TaskInfo) -> Option<Command> {
        let prompt = task.prompt_full.clone();
        match task.action {
            TaskAction::Imagine => Some(Command::Imagine { prompt }),
            TaskAction::Shorten => Some(Command::Shorten { prompt }),
            TaskAction::Show => Some(Command::Show {
                job_id: task.prompt.clone(),
            }),
            TaskAction::Describe => task.properties.get("uploaded_filename").and_then(|v| {
                v.as_str().map(|name| Command::Describe {
                    uploaded_filename: name.to_string(),
                })
            }),
            TaskAction::Blend => {
                let names = task
                    .properties
                    .get("uploaded_filenames")?
                    .as_array()?
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect::<Vec<_>>();
                let dimensions = task
                    .properties
                    .get("dimensions")
                    .and_then(|v| v.as_str())
                    .unwrap_or("1:1")
                    .to_string();
                Some(Command::Blend {
                    uploaded_filenames: names,
                    dimensions,
                })
            }
            TaskAction::Upscale
            | TaskAction::Variation
            | TaskAction::Reroll
            | TaskAction::Pan
            | TaskAction::Outpaint
            | TaskAction::Inpaint
            | TaskAction::Zoom
            | TaskAction::Action => {
                let custom_id = task.properties.get("custom_id")?.as_str()?.to_string();
                let message_id = task
                    .properties
                    .get("target_message_id")?
                    .as_str()?
                    .to_string();
                let message_flags = task
                    .properties
                    .get("message_flags")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                Some(Command::Action {
                    message_id,
                    custom_id,
                    message_flags,
                })
            }
            TaskAction::SwapFace | TaskAction::SwapVideoFace => None,
        }
    }

    fn target_for(&self, task: &TaskInfo) -> DispatchTarget {
        self.read_account(|account| {
            let (guild_id, channel_id) = if !task.sub_instance_id.is_empty() {
                match account.sub_channel_map().get(&task.sub_instance_id) {
                    Some(guild) => (guild.clone(), task.sub_instance_id.clone()),
                    None => (account.guild_id.clone(), account.channel_id.clone()),
                }
            } else {
                (account.guild_id.clone(), account.channel_id.clone())
            };
            DispatchTarget {
                guild_id,
                channel_id,
                user_token: account.user_token.clone(),
                user_agent: account.user_agent.clone(),
                session_id: self.session.session_id(),
                bot: task.effective_bot_type(),
            }
        })
    }

    // ─── Gateway events ─────────────────────────────────────────────

    async fn event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<GatewayEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.apply_gateway_event(event).await,
                    None => return,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    pub async fn apply_gateway_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::Dispatch(event) => self.apply_dispatch(event).await,
            GatewayEvent::SocketSuccess => {
                info!(instance_id = %self.instance_id(), "gateway session established");
            }
            GatewayEvent::Disconnected { code, reason } => {
                debug!(instance_id = %self.instance_id(), code, %reason, "gateway disconnected");
            }
            GatewayEvent::Disabled { reason } => {
                self.mutate_account(|a| {
                    a.enable = false;
                    a.disabled_reason = Some(reason.clone());
                });
            }
        }
    }

    async fn apply_dispatch(&self, event: DispatchEvent) {
        match event {
            DispatchEvent::InteractionCreate { id, nonce } => {
                if let Some(task_id) = self.task_id_by_nonce(&nonce) {
                    if let Some(handle) = self.running.get(&task_id).map(|h| Arc::clone(&h)) {
                        lock(&handle.task).interaction_metadata_id = id.clone();
                        self.by_interaction.insert(id, task_id);
                    }
                }
            }
            DispatchEvent::InteractionSuccess { id, nonce } => {
                let task_id = self
                    .task_id_by_nonce(&nonce)
                    .or_else(|| self.by_interaction.get(&id).map(|e| e.value().clone()));
                if let Some(handle) = task_id.and_then(|id| {
                    self.running.get(&id).map(|h| Arc::clone(&h))
                }) {
                    if lock(&handle.task).mark_in_progress() {
                        self.increment_day_counter();
                        self.save_task_best_effort(&handle);
                    }
                }
            }
            DispatchEvent::InteractionFailure { id, nonce } => {
                let task_id = self
                    .task_id_by_nonce(&nonce)
                    .or_else(|| self.by_interaction.get(&id).map(|e| e.value().clone()));
                if let Some(handle) = task_id.and_then(|id| {
                    self.running.get(&id).map(|h| Arc::clone(&h))
                }) {
                    if lock(&handle.task).mark_failure("interaction failed") {
                        self.finalize(&handle).await;
                    }
                }
            }
            DispatchEvent::InteractionModalCreate { id, nonce, custom_id } => {
                self.handle_modal(&id, &nonce, &custom_id).await;
            }
            DispatchEvent::MessageCreate(message) => self.handle_message(message, false).await,
            DispatchEvent::MessageUpdate(message) => self.handle_message(message, true).await,
            DispatchEvent::MessageDelete { id, .. } => {
                if let Some(task_id) = self.by_message.get(&id).map(|e| e.value().clone()) {
                    if let Some(handle) = self.running.get(&task_id).map(|h| Arc::clone(&h)) {
                        if lock(&handle.task).mark_failure("deleted by moderation") {
                            self.finalize(&handle).await;
                        }
                    }
                }
            }
            DispatchEvent::Ready { .. } | DispatchEvent::Resumed => {}
        }
    }

    fn task_id_by_nonce(&self, nonce: &str) -> Option<String> {
        if nonce.is_empty() {
            return None;
        }
        self.by_nonce.get(nonce).map(|e| e.value().clone())
    }

    async fn handle_modal(&self, message_id: &str, nonce: &str, custom_id: &str) {
        let Some(task_id) = self.task_id_by_nonce(nonce) else {
            return;
        };
        let Some(handle) = self.running.get(&task_id).map(|h| Arc::clone(&h)) else {
            return;
        };
        lock(&handle.task).mark_modal(message_id);

        if !self.read_account(|a| a.remix_auto_submit) {
            return;
        }

        // Auto-submit the modal so the job flows straight through.
        let (target, prompt) = {
            let task = lock(&handle.task);
            (self.target_for(&task), task.prompt_full.clone())
        };
        let fresh_nonce = generate_nonce();
        self.by_nonce.insert(fresh_nonce.clone(), task_id.clone());
        lock(&handle.task).nonce = fresh_nonce.clone();

        let command = Command::Modal {
            message_id: message_id.to_string(),
            custom_id: custom_id.to_string(),
            component_custom_id: "MJ::RemixModal::new_prompt".to_string(),
            prompt,
        };
        match self.transport.send(&target, &fresh_nonce, &command).await {
            TransportOutcome::Delivered => {
                debug!(%task_id, "modal auto-submitted");
            }
            TransportOutcome::Retry(reason) | TransportOutcome::Terminal(reason) => {
                if lock(&handle.task).mark_failure(&format!("modal submit failed: {reason}")) {
                    self.finalize(&handle).await;
                }
            }
        }
    }

    async fn handle_message(&self, message: MessageData, is_update: bool) {
        if !self.channel_is_ours(&message.channel_id) {
            return;
        }
        self.sync_account_from_message(&message);

        let task_id = message
            .interaction_id()
            .and_then(|id| self.by_interaction.get(id).map(|e| e.value().clone()))
            .or_else(|| self.task_id_by_nonce(&message.nonce))
            .or_else(|| self.by_message.get(&message.id).map(|e| e.value().clone()));
        let Some(task_id) = task_id else {
            return;
        };
        let Some(handle) = self.running.get(&task_id).map(|h| Arc::clone(&h)) else {
            return;
        };

        self.by_message.insert(message.id.clone(), task_id.clone());

        if let Some(reason) = error_reason(&message) {
            let failed = {
                let mut task = lock(&handle.task);
                task.push_message_id(&message.id);
                task.mark_failure(&reason)
            };
            if failed {
                self.finalize(&handle).await;
            }
            return;
        }

        let progress = parse_progress(&message.content);
        let image_url = message.first_attachment_url().map(|s| s.to_string());
        let buttons = WireComponent::flatten_buttons(&message.components);
        let finished = progress.is_none() && !buttons.is_empty();

        let became_terminal = {
            let mut task = lock(&handle.task);
            task.push_message_id(&message.id);
            if !is_update && task.status == TaskStatus::Submitted {
                // The first correlated message is proof the job started even
                // if the interaction ack was missed.
                task.mark_in_progress();
            }
            if finished {
                task.buttons = buttons;
                if let Some(url) = &image_url {
                    task.image_url = url.clone();
                    task.thumbnail_url = url.clone();
                }
                task.mark_success()
            } else {
                task.update_progress(progress.as_deref(), image_url.as_deref());
                false
            }
        };

        if became_terminal {
            self.finalize(&handle).await;
        } else {
            self.save_task_best_effort(&handle);
        }
    }

    fn channel_is_ours(&self, channel_id: &str) -> bool {
        self.read_account(|a| {
            channel_id == a.channel_id
                || channel_id == a.private_channel_id
                || channel_id == a.niji_private_channel_id
                || a.sub_channel_map().contains_key(channel_id)
        })
    }

    /// Settings/info replies refresh the account's cached capabilities.
    fn sync_account_from_message(&self, message: &MessageData) {
        let author_id = message.author.as_ref().map(|a| a.id.as_str()).unwrap_or("");
        match message.interaction_name() {
            Some("settings") if !message.components.is_empty() => {
                let niji = author_id == NIJI_APPLICATION_ID;
                self.mutate_account(|a| {
                    if niji {
                        a.niji_components = message.components.clone();
                    } else {
                        a.components = message.components.clone();
                    }
                });
                self.persist_account_fields(if niji {
                    &["niji_components"]
                } else {
                    &["components"]
                });
            }
            Some("info") => {
                if let Some(remaining) = fast_time_remaining(&message.embeds) {
                    self.apply_fast_time(remaining);
                }
            }
            _ => {}
        }

        if message
            .embeds
            .iter()
            .any(|e| e.title.starts_with("Action needed to continue"))
        {
            warn!(instance_id = %self.instance_id(), "human verification required, locking account");
            self.mutate_account(|a| a.locked = true);
            self.persist_account_fields(&["locked"]);
        }
    }

    /// Apply fast-hours information from an `/info` sync.
    fn apply_fast_time(&self, remaining_hours: f64) {
        let (to_relax, to_fast) = self.read_account(|a| {
            (
                a.enable_fast_to_relax && remaining_hours <= 0.0 && !a.fast_exhausted,
                a.enable_relax_to_fast && remaining_hours > 0.0 && a.fast_exhausted,
            )
        });
        if to_relax {
            info!(instance_id = %self.instance_id(), "fast hours exhausted, switching to relax");
            self.mutate_account(|a| {
                a.fast_exhausted = true;
                a.mode = Some(AccountMode::Relax);
            });
            self.persist_account_fields(&["fast_exhausted", "mode"]);
        } else if to_fast {
            info!(instance_id = %self.instance_id(), "fast hours restored, switching to fast");
            self.mutate_account(|a| {
                a.fast_exhausted = false;
                a.mode = Some(AccountMode::Fast);
            });
            self.persist_account_fields(&["fast_exhausted", "mode"]);
        }
    }

    /// Ask the bot for fresh settings and quota info. The replies come back
    /// as ordinary gateway messages and are absorbed by
    /// [`Self::sync_account_from_message`].
    pub async fn refresh_account_info(&self) {
        let target = self.read_account(|account| DispatchTarget {
            guild_id: account.guild_id.clone(),
            channel_id: account.channel_id.clone(),
            user_token: account.user_token.clone(),
            user_agent: account.user_agent.clone(),
            session_id: self.session.session_id(),
            bot: BotType::Mj,
        });
        for command in [Command::Info, Command::Settings] {
            let nonce = generate_nonce();
            if let TransportOutcome::Terminal(reason) =
                self.transport.send(&target, &nonce, &command).await
            {
                debug!(instance_id = %target.channel_id, "info refresh rejected: {reason}");
            }
        }
    }

    // ─── Counters & sweeps ──────────────────────────────────────────

    fn increment_day_counter(&self) {
        self.mutate_account(|a| a.day_draw_count += 1);
        self.persist_account_fields(&["day_draw_count"]);
    }

    /// Reset the daily counter when the local day changed. Idempotent; called
    /// from the midnight sweeper and the 5-minute heartbeat alike.
    pub fn reset_day_counter_if_new_day(&self) {
        let today = today_marker();
        {
            let mut marker = lock(&self.day_marker);
            if *marker == today {
                return;
            }
            *marker = today;
        }
        info!(instance_id = %self.instance_id(), "resetting daily draw counter");
        self.mutate_account(|a| a.day_draw_count = 0);
        self.persist_account_fields(&["day_draw_count"]);
    }

    /// Fail any in-flight task whose deadline passed.
    pub async fn sweep_timeouts(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<TaskHandle>> = self
            .running
            .iter()
            .filter(|entry| {
                lock(&entry.value().deadline)
                    .map(|deadline| deadline <= now)
                    .unwrap_or(false)
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for handle in expired {
            if lock(&handle.task).mark_failure("timeout") {
                warn!(task_id = %handle.id(), "task timed out");
                self.finalize(&handle).await;
            }
        }
    }

    // ─── Terminal handling ──────────────────────────────────────────

    async fn finalize(&self, handle: &Arc<TaskHandle>) {
        let task = handle.snapshot();

        if task.status == TaskStatus::Failure {
            self.bump_ban_counters(&task);
        }

        // Terminal writes must land before the callback goes out.
        let mut saved = false;
        for attempt in 0..TERMINAL_SAVE_ATTEMPTS {
            match self.store.save_task(&task) {
                Ok(()) => {
                    saved = true;
                    break;
                }
                Err(e) => {
                    warn!(task_id = %task.id, attempt, "terminal task write failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
                }
            }
        }
        if !saved {
            error!(task_id = %task.id, "terminal task write dropped after {TERMINAL_SAVE_ATTEMPTS} attempts");
        }

        self.running.remove(&task.id);
        if !task.nonce.is_empty() {
            self.by_nonce.remove(&task.nonce);
        }
        if !task.interaction_metadata_id.is_empty() {
            self.by_interaction.remove(&task.interaction_metadata_id);
        }
        for message_id in &task.message_ids {
            self.by_message.remove(message_id);
        }

        let hook_override = task
            .properties
            .get("notify_hook")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        self.callbacks.notify_task(&task, hook_override.as_deref());

        handle.done.notify_waiters();
        self.invalidate_snapshot();
        self.wake.notify_one();
    }

    fn bump_ban_counters(&self, task: &TaskInfo) {
        let reason = task.fail_reason.as_str();
        if !(reason.contains("Banned prompt") || reason.contains("Image denied")) {
            return;
        }
        let day = today_marker();
        for subject in [task.user_id.as_str(), task.client_ip.as_str()] {
            if subject.is_empty() {
                continue;
            }
            let key = format!("banned:{day}:{subject}");
            if let Err(e) = self.store.incr_counter(&key, BAN_COUNTER_TTL_SECS) {
                warn!(%key, "increment ban counter: {e}");
            }
        }
    }

    fn save_task_best_effort(&self, handle: &Arc<TaskHandle>) {
        let task = handle.snapshot();
        if let Err(e) = self.store.save_task(&task) {
            debug!(task_id = %task.id, "non-terminal task write failed: {e}");
        }
    }
}

/// Error surface of a correlated bot message: a titled embed means the job
/// was rejected rather than rendered.
fn error_reason(message: &MessageData) -> Option<String> {
    let embed = message.embeds.iter().find(|e| {
        const MARKERS: [&str; 7] = [
            "Banned prompt",
            "Invalid parameter",
            "Invalid link",
            "Image denied",
            "Queue full",
            "Job action restricted",
            "Pending mod message",
        ];
        MARKERS.iter().any(|m| e.title.starts_with(m))
    })?;
    if embed.description.is_empty() {
        Some(embed.title.clone())
    } else {
        Some(format!("{}: {}", embed.title, embed.description))
    }
}

/// Parse "Fast Time Remaining" hours from `/info` embeds.
fn fast_time_remaining(embeds: &[crate::gateway::events::Embed]) -> Option<f64> {
    use once_cell::sync::Lazy;
    use regex::Regex;
    static FAST_TIME_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\*\*Fast Time Remaining\*\*:\s*([\d.]+)\s*/").unwrap());

    embeds.iter().find_map(|embed| {
        FAST_TIME_RE
            .captures(&embed.description)
            .and_then(|c| c[1].parse::<f64>().ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::CallbackDispatcher;
    use crate::store::SqliteStore;
    use crate::transport::{MockCommandTransport, MJ_APPLICATION_ID};
    use serde_json::json;

    fn test_account() -> DiscordAccount {
        let mut account = DiscordAccount {
            id: "acc-1".into(),
            guild_id: "g1".into(),
            channel_id: "c1".into(),
            user_token: "tok".into(),
            core_size: 3,
            max_queue_size: 5,
            interval: 0.0,
            after_interval_min: 0.0,
            after_interval_max: 0.0,
            ..Default::default()
        };
        account.normalize();
        account
    }

    fn runtime_with(
        account: DiscordAccount,
        transport: MockCommandTransport,
    ) -> (Arc<AccountRuntime>, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.save_account(&account).unwrap();
        let runtime = AccountRuntime::new(
            account,
            Arc::new(GatewaySession::default()),
            store.clone() as Arc<dyn Store>,
            Arc::new(transport),
            CallbackDispatcher::new(1, None, None),
        );
        (runtime, store)
    }

    fn delivered_transport() -> MockCommandTransport {
        let mut transport = MockCommandTransport::new();
        transport
            .expect_send()
            .returning(|_, _, _| TransportOutcome::Delivered);
        transport
    }

    fn imagine_task() -> TaskInfo {
        TaskInfo::new(TaskAction::Imagine, BotType::Mj, "Cat")
    }

    fn message(value: serde_json::Value) -> MessageData {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn submit_and_drive_to_success() {
        let (runtime, store) = runtime_with(test_account(), delivered_transport());

        let handle = match runtime.submit(imagine_task()) {
            SubmitResult::Accepted(h) => h,
            _ => panic!("expected acceptance"),
        };
        let queued = lock(&runtime.queue).pop_front().unwrap();
        runtime.dispatch(queued).await;

        let nonce = handle.snapshot().nonce;
        assert!(!nonce.is_empty());
        assert_eq!(runtime.in_flight(), 1);

        runtime
            .apply_dispatch(DispatchEvent::InteractionCreate {
                id: "int-1".into(),
                nonce: nonce.clone(),
            })
            .await;
        runtime
            .apply_dispatch(DispatchEvent::InteractionSuccess {
                id: "int-1".into(),
                nonce: nonce.clone(),
            })
            .await;
        assert_eq!(handle.snapshot().status, TaskStatus::InProgress);
        assert_eq!(runtime.account().day_draw_count, 1);

        runtime
            .apply_dispatch(DispatchEvent::MessageCreate(message(json!({
                "id": "m1",
                "channel_id": "c1",
                "content": "**Cat** - 45% (fast)",
                "interaction_metadata": {"id": "int-1", "name": "imagine"},
                "attachments": [{"url": "https://cdn/x_grid_0.webp"}]
            }))))
            .await;
        let snap = handle.snapshot();
        assert_eq!(snap.progress, "45%");
        assert_eq!(snap.message_id, "m1");

        runtime
            .apply_dispatch(DispatchEvent::MessageUpdate(message(json!({
                "id": "m1",
                "channel_id": "c1",
                "content": "**Cat** - <@1> (fast)",
                "attachments": [{"url": "https://cdn/user_cat_deadbeef.png"}],
                "components": [{"type": 1, "components": [
                    {"type": 2, "custom_id": "MJ::JOB::upsample::1::deadbeef", "label": "U1", "style": 2}
                ]}]
            }))))
            .await;

        let done = handle.wait(Duration::from_millis(100)).await;
        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(done.progress, "100%");
        assert_eq!(done.image_url, "https://cdn/user_cat_deadbeef.png");
        assert_eq!(done.buttons.len(), 1);
        assert_eq!(runtime.in_flight(), 0);

        let persisted = store.get_task(&done.id).unwrap().unwrap();
        assert_eq!(persisted.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn queue_full_rejects_without_state_change() {
        let mut account = test_account();
        account.max_queue_size = 2;
        let (runtime, _) = runtime_with(account, MockCommandTransport::new());

        assert!(matches!(
            runtime.submit(imagine_task()),
            SubmitResult::Accepted(_)
        ));
        assert!(matches!(
            runtime.submit(imagine_task()),
            SubmitResult::Accepted(_)
        ));
        assert!(matches!(
            runtime.submit(imagine_task()),
            SubmitResult::RejectedQueueFull
        ));
        assert_eq!(runtime.depth(), 2);
    }

    #[tokio::test]
    async fn fishing_hours_reject_new_tasks() {
        let mut account = test_account();
        // A window covering the whole day keeps the test clock-independent.
        account.fishing_time = "00:00-23:59".into();
        let (runtime, _) = runtime_with(account, MockCommandTransport::new());

        assert!(matches!(
            runtime.submit(imagine_task()),
            SubmitResult::RejectedNotAcceptingNewTasks
        ));
    }

    #[tokio::test]
    async fn disabled_bot_rejects() {
        let mut account = test_account();
        account.enable_niji = false;
        let (runtime, _) = runtime_with(account, MockCommandTransport::new());

        let task = TaskInfo::new(TaskAction::Imagine, BotType::Niji, "Cat");
        assert!(matches!(
            runtime.submit(task),
            SubmitResult::RejectedBotDisabled
        ));
    }

    #[tokio::test]
    async fn day_limit_rejects_as_not_accepting() {
        let mut account = test_account();
        account.day_draw_limit = 1;
        account.day_draw_count = 1;
        let (runtime, _) = runtime_with(account, MockCommandTransport::new());

        assert!(matches!(
            runtime.submit(imagine_task()),
            SubmitResult::RejectedNotAcceptingNewTasks
        ));
    }

    #[tokio::test]
    async fn timeout_sweep_fails_overdue_tasks() {
        let (runtime, store) = runtime_with(test_account(), delivered_transport());

        let handle = match runtime.submit(imagine_task()) {
            SubmitResult::Accepted(h) => h,
            _ => panic!("expected acceptance"),
        };
        let queued = lock(&runtime.queue).pop_front().unwrap();
        runtime.dispatch(queued).await;

        *lock(&handle.deadline) = Some(Instant::now() - Duration::from_secs(1));
        runtime.sweep_timeouts().await;

        let snap = handle.snapshot();
        assert_eq!(snap.status, TaskStatus::Failure);
        assert_eq!(snap.fail_reason, "timeout");
        assert_eq!(runtime.in_flight(), 0);
        assert_eq!(
            store.get_task(&snap.id).unwrap().unwrap().status,
            TaskStatus::Failure
        );
    }

    #[tokio::test]
    async fn moderation_delete_fails_task() {
        let (runtime, _) = runtime_with(test_account(), delivered_transport());

        let handle = match runtime.submit(imagine_task()) {
            SubmitResult::Accepted(h) => h,
            _ => panic!("expected acceptance"),
        };
        let queued = lock(&runtime.queue).pop_front().unwrap();
        runtime.dispatch(queued).await;
        let nonce = handle.snapshot().nonce;

        runtime
            .apply_dispatch(DispatchEvent::MessageCreate(message(json!({
                "id": "m9",
                "channel_id": "c1",
                "nonce": nonce,
                "content": "(0%) rendering"
            }))))
            .await;
        runtime
            .apply_dispatch(DispatchEvent::MessageDelete {
                id: "m9".into(),
                channel_id: "c1".into(),
            })
            .await;

        let snap = handle.snapshot();
        assert_eq!(snap.status, TaskStatus::Failure);
        assert_eq!(snap.fail_reason, "deleted by moderation");
    }

    #[tokio::test]
    async fn banned_prompt_bumps_user_and_ip_counters() {
        let (runtime, store) = runtime_with(test_account(), delivered_transport());

        let mut task = imagine_task();
        task.user_id = "u1".into();
        task.client_ip = "10.0.0.9".into();
        let handle = match runtime.submit(task) {
            SubmitResult::Accepted(h) => h,
            _ => panic!("expected acceptance"),
        };
        let queued = lock(&runtime.queue).pop_front().unwrap();
        runtime.dispatch(queued).await;
        let nonce = handle.snapshot().nonce;

        runtime
            .apply_dispatch(DispatchEvent::MessageCreate(message(json!({
                "id": "m2",
                "channel_id": "c1",
                "nonce": nonce,
                "embeds": [{"title": "Banned prompt detected", "description": "bad words"}]
            }))))
            .await;

        let snap = handle.snapshot();
        assert_eq!(snap.status, TaskStatus::Failure);
        assert!(snap.fail_reason.contains("Banned prompt detected"));

        let day = today_marker();
        assert_eq!(
            store.get_counter(&format!("banned:{day}:u1")).unwrap(),
            1
        );
        assert_eq!(
            store
                .get_counter(&format!("banned:{day}:10.0.0.9"))
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn cancel_removes_queued_task() {
        let (runtime, _) = runtime_with(test_account(), MockCommandTransport::new());

        let handle = match runtime.submit(imagine_task()) {
            SubmitResult::Accepted(h) => h,
            _ => panic!("expected acceptance"),
        };
        let task_id = handle.id();

        assert!(runtime.cancel(&task_id).await);
        assert_eq!(handle.snapshot().status, TaskStatus::Cancel);
        assert_eq!(runtime.depth(), 0);
        assert!(!runtime.cancel("missing").await);
    }

    #[tokio::test]
    async fn settings_sync_updates_components() {
        let (runtime, _) = runtime_with(test_account(), delivered_transport());

        runtime
            .apply_dispatch(DispatchEvent::MessageCreate(message(json!({
                "id": "m3",
                "channel_id": "c1",
                "author": {"id": MJ_APPLICATION_ID, "bot": true},
                "interaction_metadata": {"id": "i3", "name": "settings"},
                "components": [{"type": 1, "components": [
                    {"type": 2, "label": "Remix mode", "style": 3, "custom_id": "MJ::Settings::RemixMode::1"}
                ]}]
            }))))
            .await;

        assert!(runtime.account().is_remix_on(BotType::Mj));
        assert!(runtime.snapshot().remix_on_mj);
    }

    #[tokio::test]
    async fn info_sync_switches_fast_to_relax() {
        let mut account = test_account();
        account.enable_fast_to_relax = true;
        account.mode = Some(AccountMode::Fast);
        let (runtime, _) = runtime_with(account, delivered_transport());

        runtime
            .apply_dispatch(DispatchEvent::MessageCreate(message(json!({
                "id": "m4",
                "channel_id": "c1",
                "interaction_metadata": {"id": "i4", "name": "info"},
                "embeds": [{"title": "Your info", "description": "**Fast Time Remaining**: 0.00/15.0 hours"}]
            }))))
            .await;

        let account = runtime.account();
        assert!(account.fast_exhausted);
        assert_eq!(account.mode, Some(AccountMode::Relax));
    }

    #[tokio::test]
    async fn messages_from_foreign_channels_are_ignored() {
        let (runtime, _) = runtime_with(test_account(), delivered_transport());

        let handle = match runtime.submit(imagine_task()) {
            SubmitResult::Accepted(h) => h,
            _ => panic!("expected acceptance"),
        };
        let queued = lock(&runtime.queue).pop_front().unwrap();
        runtime.dispatch(queued).await;
        let nonce = handle.snapshot().nonce;

        runtime
            .apply_dispatch(DispatchEvent::MessageCreate(message(json!({
                "id": "m5",
                "channel_id": "other-channel",
                "nonce": nonce,
                "content": "55%"
            }))))
            .await;

        assert_eq!(handle.snapshot().progress, "0%");
    }

    #[test]
    fn fast_time_parsing() {
        let embeds: Vec<crate::gateway::events::Embed> = serde_json::from_value(json!([
            {"title": "x", "description": "**Fast Time Remaining**: 7.52/15.0 hours"}
        ]))
        .unwrap();
        assert_eq!(fast_time_remaining(&embeds), Some(7.52));
        assert_eq!(fast_time_remaining(&[]), None);
    }
}
