//! Process-wide account supervision.
//!
//! The registry discovers accounts from the store at startup, wires one
//! gateway client and one runtime per account, owns the selector and exposes
//! the submission entry point. Periodic sweeps (task timeouts, daily counter
//! resets, account info refresh) run here so each runtime stays free of
//! timers of its own.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::account::runtime::{AccountRuntime, SubmitResult, TaskHandle};
use crate::account::selector::{AccountFilter, AccountSelector};
use crate::account::DiscordAccount;
use crate::config::Setting;
use crate::error::Result;
use crate::gateway::{GatewayClient, GatewayConfig};
use crate::notify::mail::MailNotifier;
use crate::notify::CallbackDispatcher;
use crate::store::Store;
use crate::task::TaskInfo;
use crate::transport::CommandTransport;

/// Pause between initial-connect retries at startup.
const BOOT_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Cadence of the timeout sweep.
const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Cadence of the idempotent daily-counter heartbeat.
const DAY_RESET_INTERVAL: Duration = Duration::from_secs(300);
/// Cadence of the settings/info refresh.
const INFO_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Outcome of a routed submission.
pub enum SubmissionOutcome {
    Queued {
        handle: Arc<TaskHandle>,
        instance_id: String,
    },
    NoAvailableAccount,
    NotAccepting,
    QueueFull,
    BotDisabled,
}

pub struct AccountRegistry {
    runtimes: DashMap<String, Arc<AccountRuntime>>,
    gateways: DashMap<String, Arc<GatewayClient>>,
    selector: AccountSelector,
    setting: Setting,
    store: Arc<dyn Store>,
    transport: Arc<dyn CommandTransport>,
    callbacks: CallbackDispatcher,
    mailer: Arc<dyn MailNotifier>,
}

impl AccountRegistry {
    pub fn new(
        setting: Setting,
        store: Arc<dyn Store>,
        transport: Arc<dyn CommandTransport>,
        callbacks: CallbackDispatcher,
        mailer: Arc<dyn MailNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtimes: DashMap::new(),
            gateways: DashMap::new(),
            selector: AccountSelector::new(setting.account_choose_rule),
            setting,
            store,
            transport,
            callbacks,
            mailer,
        })
    }

    /// Persist configured accounts, start every enabled account and launch
    /// the sweepers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        for account in &self.setting.accounts {
            self.store.save_account(account)?;
        }

        let accounts = self.store.list_accounts()?;
        info!(count = accounts.len(), "starting account registry");
        for account in accounts {
            if !account.enable {
                info!(account_id = %account.id, "account disabled, skipping");
                continue;
            }
            self.start_account(account);
        }

        self.spawn_sweepers();
        Ok(())
    }

    /// Wire one account's runtime and gateway, then connect in the
    /// background with retries.
    pub fn start_account(self: &Arc<Self>, account: DiscordAccount) {
        let (runtime, gateway) = self.register(account);
        tokio::spawn(async move {
            loop {
                match gateway.start(false).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(instance_id = %runtime.instance_id(), "initial gateway connect failed: {e}");
                        tokio::time::sleep(BOOT_RETRY_DELAY).await;
                    }
                }
            }
        });
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        account: DiscordAccount,
    ) -> (Arc<AccountRuntime>, Arc<GatewayClient>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let gateway = GatewayClient::new(
            account.id.clone(),
            account.channel_id.clone(),
            GatewayConfig {
                wss: self.setting.ng_discord.wss.clone(),
                resume_wss: self.setting.ng_discord.resume_wss.clone(),
                user_token: account.user_token.clone(),
                user_agent: account.user_agent.clone(),
            },
            events_tx,
            Arc::clone(&self.store),
            Arc::clone(&self.mailer),
        );

        let runtime = AccountRuntime::new(
            account.clone(),
            gateway.session(),
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            self.callbacks.clone(),
        );
        runtime.spawn(events_rx);

        self.gateways
            .insert(account.channel_id.clone(), Arc::clone(&gateway));
        self.runtimes
            .insert(account.channel_id.clone(), Arc::clone(&runtime));
        (runtime, gateway)
    }

    /// Stop one account's gateway and runtime and drop them from routing.
    pub async fn remove_account(&self, instance_id: &str) {
        if let Some((_, gateway)) = self.gateways.remove(instance_id) {
            gateway.close(1000).await;
        }
        if let Some((_, runtime)) = self.runtimes.remove(instance_id) {
            runtime.shutdown();
        }
        info!(instance_id, "account removed from registry");
    }

    pub async fn shutdown(&self) {
        let instance_ids: Vec<String> = self.runtimes.iter().map(|e| e.key().clone()).collect();
        for instance_id in instance_ids {
            self.remove_account(&instance_id).await;
        }
    }

    pub fn runtimes(&self) -> Vec<Arc<AccountRuntime>> {
        let mut runtimes: Vec<Arc<AccountRuntime>> =
            self.runtimes.iter().map(|e| Arc::clone(e.value())).collect();
        runtimes.sort_by_key(|r| {
            let snapshot = r.snapshot();
            (snapshot.sort, snapshot.instance_id.clone())
        });
        runtimes
    }

    pub fn runtime_for_instance(&self, instance_id: &str) -> Option<Arc<AccountRuntime>> {
        self.runtimes.get(instance_id).map(|e| Arc::clone(e.value()))
    }

    /// Route a task to an account and enqueue it.
    pub fn submit_task(&self, task: TaskInfo, filter: &AccountFilter) -> SubmissionOutcome {
        let bot = task.effective_bot_type();
        let action = task.action;

        let runtime = if let Some(pin) = &filter.instance_id {
            match self.runtime_for_instance(pin) {
                Some(runtime) => runtime,
                None => return SubmissionOutcome::NoAvailableAccount,
            }
        } else {
            match self
                .selector
                .choose(&self.runtimes(), bot, action, filter)
            {
                Some(runtime) => runtime,
                None => return SubmissionOutcome::NoAvailableAccount,
            }
        };

        let instance_id = runtime.instance_id();
        match runtime.submit(task) {
            SubmitResult::Accepted(handle) => SubmissionOutcome::Queued {
                handle,
                instance_id,
            },
            SubmitResult::RejectedQueueFull => SubmissionOutcome::QueueFull,
            SubmitResult::RejectedNotAcceptingNewTasks => SubmissionOutcome::NotAccepting,
            SubmitResult::RejectedBotDisabled => SubmissionOutcome::BotDisabled,
        }
    }

    /// Look a task up in the live runtimes first, then in the store.
    pub fn find_task(&self, task_id: &str) -> Option<TaskInfo> {
        for entry in self.runtimes.iter() {
            if let Some(task) = entry.value().get_task(task_id) {
                return Some(task);
            }
        }
        match self.store.get_task(task_id) {
            Ok(task) => task,
            Err(e) => {
                error!(task_id, "load task: {e}");
                None
            }
        }
    }

    pub async fn cancel_task(&self, task_id: &str) -> bool {
        for entry in self.runtimes.iter() {
            let runtime = Arc::clone(entry.value());
            if runtime.get_task(task_id).is_some() {
                return runtime.cancel(task_id).await;
            }
        }
        false
    }

    fn spawn_sweepers(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TIMEOUT_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                for runtime in registry.runtimes() {
                    runtime.sweep_timeouts().await;
                }
            }
        });

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DAY_RESET_INTERVAL);
            loop {
                ticker.tick().await;
                for runtime in registry.runtimes() {
                    runtime.reset_day_counter_if_new_day();
                }
            }
        });

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(INFO_REFRESH_INTERVAL);
            // The first tick fires immediately; skip it so freshly started
            // gateways have a session before the first refresh.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for runtime in registry.runtimes() {
                    let connected = registry
                        .gateways
                        .get(&runtime.instance_id())
                        .map(|g| g.is_running())
                        .unwrap_or(false);
                    if connected {
                        runtime.refresh_account_info().await;
                    }
                }
            }
        });
    }
}
