//! Account selection policies.
//!
//! Selection reads runtime snapshots only; the chosen runtime's own `submit`
//! re-validates under its lock, so a race here costs at worst a rejection,
//! never an overload. When no account is idle, ties on queue length break
//! toward the higher weight; within the idle group weight is not consulted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::account::runtime::AccountRuntime;
use crate::task::{AccountMode, BotType, TaskAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectRule {
    BestWaitIdle,
    Random,
    Weight,
    Polling,
}

/// Constraints a submission places on account choice.
#[derive(Debug, Clone, Default)]
pub struct AccountFilter {
    /// Pin to one instance (channel id).
    pub instance_id: Option<String>,
    /// Every listed mode must be allowed by the account.
    pub modes: Vec<AccountMode>,
    /// Require the remix toggle to be in this position.
    pub remix: Option<bool>,
}

pub struct AccountSelector {
    rule: SelectRule,
    cursors: DashMap<BotType, AtomicUsize>,
}

/// Load view used by the policies.
struct Candidate {
    index: usize,
    in_flight: usize,
    queue_len: usize,
    core_size: usize,
    weight: u32,
}

impl Candidate {
    fn is_idle(&self) -> bool {
        self.in_flight < self.core_size
    }
}

impl AccountSelector {
    pub fn new(rule: SelectRule) -> Self {
        Self {
            rule,
            cursors: DashMap::new(),
        }
    }

    pub fn rule(&self) -> SelectRule {
        self.rule
    }

    /// Pick an account for a task, or `None` when no candidate passes the
    /// filter and acceptance checks.
    pub fn choose(
        &self,
        runtimes: &[Arc<AccountRuntime>],
        bot: BotType,
        action: TaskAction,
        filter: &AccountFilter,
    ) -> Option<Arc<AccountRuntime>> {
        let eligible: Vec<Arc<AccountRuntime>> = runtimes
            .iter()
            .filter(|runtime| is_eligible(runtime, bot, action, filter))
            .cloned()
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let candidates: Vec<Candidate> = eligible
            .iter()
            .enumerate()
            .map(|(index, runtime)| {
                let snapshot = runtime.snapshot();
                Candidate {
                    index,
                    in_flight: runtime.in_flight(),
                    queue_len: runtime.queue_len(),
                    core_size: snapshot.core_size as usize,
                    weight: snapshot.weight,
                }
            })
            .collect();

        let picked = match self.rule {
            SelectRule::BestWaitIdle => pick_best_wait_idle(&candidates),
            SelectRule::Random => {
                let roll = rand::thread_rng().gen_range(0..candidates.len());
                Some(roll)
            }
            SelectRule::Weight => {
                let total = total_weight(&candidates);
                let roll = rand::thread_rng().gen_range(0..total);
                pick_weighted(&candidates, roll)
            }
            SelectRule::Polling => {
                let cursor = self
                    .cursors
                    .entry(bot)
                    .or_insert_with(|| AtomicUsize::new(0));
                let position = cursor.fetch_add(1, Ordering::Relaxed);
                Some(position % candidates.len())
            }
        };

        picked.map(|index| Arc::clone(&eligible[index]))
    }
}

fn is_eligible(
    runtime: &Arc<AccountRuntime>,
    bot: BotType,
    action: TaskAction,
    filter: &AccountFilter,
) -> bool {
    let snapshot = runtime.snapshot();
    if !snapshot.enable || snapshot.locked {
        return false;
    }
    if let Some(pin) = &filter.instance_id {
        if *pin != snapshot.instance_id {
            return false;
        }
    }
    let bot_ok = match bot {
        BotType::Mj => snapshot.enable_mj,
        BotType::Niji => snapshot.enable_niji,
        BotType::InsightFace => false,
    };
    if !bot_ok {
        return false;
    }
    let action_ok = match action {
        TaskAction::Blend => snapshot.is_blend,
        TaskAction::Describe => snapshot.is_describe,
        TaskAction::Shorten => snapshot.is_shorten,
        _ => true,
    };
    if !action_ok {
        return false;
    }
    if !filter.modes.is_empty()
        && !snapshot.allow_modes.is_empty()
        && !filter
            .modes
            .iter()
            .all(|mode| snapshot.allow_modes.contains(mode))
    {
        return false;
    }
    if let Some(required) = filter.remix {
        let remix_on = match bot {
            BotType::Niji => snapshot.remix_on_niji,
            _ => snapshot.remix_on_mj,
        };
        if remix_on != required {
            return false;
        }
    }
    if runtime.depth() >= snapshot.max_queue_size as usize {
        return false;
    }
    runtime.is_accept_new_task()
}

/// Idle accounts (free in-flight slot) win, least loaded first; otherwise
/// the shortest queue wins with weight as the tie-break.
fn pick_best_wait_idle(candidates: &[Candidate]) -> Option<usize> {
    let idle = candidates
        .iter()
        .filter(|c| c.is_idle())
        .min_by_key(|c| (c.in_flight, c.queue_len));
    if let Some(best) = idle {
        return Some(best.index);
    }
    candidates
        .iter()
        .min_by_key(|c| (c.queue_len, std::cmp::Reverse(c.weight)))
        .map(|c| c.index)
}

fn total_weight(candidates: &[Candidate]) -> u32 {
    candidates.iter().map(|c| c.weight.max(1)).sum()
}

/// Walk the cumulative weights until the roll lands. Weight 0 counts as 1 so
/// every candidate stays reachable.
fn pick_weighted(candidates: &[Candidate], mut roll: u32) -> Option<usize> {
    for candidate in candidates {
        let weight = candidate.weight.max(1);
        if roll < weight {
            return Some(candidate.index);
        }
        roll -= weight;
    }
    candidates.last().map(|c| c.index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::DiscordAccount;
    use crate::gateway::GatewaySession;
    use crate::notify::CallbackDispatcher;
    use crate::store::{SqliteStore, Store};
    use crate::task::TaskInfo;
    use crate::transport::MockCommandTransport;

    fn candidate(index: usize, in_flight: usize, queue_len: usize, weight: u32) -> Candidate {
        Candidate {
            index,
            in_flight,
            queue_len,
            core_size: 3,
            weight,
        }
    }

    #[test]
    fn best_wait_idle_prefers_fewest_in_flight() {
        let candidates = vec![
            candidate(0, 2, 0, 1),
            candidate(1, 0, 5, 1),
            candidate(2, 1, 0, 1),
        ];
        assert_eq!(pick_best_wait_idle(&candidates), Some(1));
    }

    #[test]
    fn best_wait_idle_ties_break_on_queue_length() {
        let candidates = vec![candidate(0, 1, 4, 1), candidate(1, 1, 2, 1)];
        assert_eq!(pick_best_wait_idle(&candidates), Some(1));
    }

    #[test]
    fn best_wait_idle_loaded_group_uses_weight() {
        // No candidate has a free slot; equal queues fall back to weight.
        let candidates = vec![
            Candidate {
                index: 0,
                in_flight: 3,
                queue_len: 4,
                core_size: 3,
                weight: 1,
            },
            Candidate {
                index: 1,
                in_flight: 3,
                queue_len: 4,
                core_size: 3,
                weight: 9,
            },
            Candidate {
                index: 2,
                in_flight: 3,
                queue_len: 6,
                core_size: 3,
                weight: 50,
            },
        ];
        assert_eq!(pick_best_wait_idle(&candidates), Some(1));
    }

    #[test]
    fn weighted_pick_walks_cumulative_weights() {
        let candidates = vec![candidate(0, 0, 0, 2), candidate(1, 0, 0, 3)];
        assert_eq!(pick_weighted(&candidates, 0), Some(0));
        assert_eq!(pick_weighted(&candidates, 1), Some(0));
        assert_eq!(pick_weighted(&candidates, 2), Some(1));
        assert_eq!(pick_weighted(&candidates, 4), Some(1));
    }

    #[test]
    fn zero_weight_stays_reachable() {
        let candidates = vec![candidate(0, 0, 0, 0)];
        assert_eq!(total_weight(&candidates), 1);
        assert_eq!(pick_weighted(&candidates, 0), Some(0));
    }

    fn runtime_for(account: DiscordAccount) -> Arc<AccountRuntime> {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.save_account(&account).unwrap();
        AccountRuntime::new(
            account,
            Arc::new(GatewaySession::default()),
            store,
            Arc::new(MockCommandTransport::new()),
            CallbackDispatcher::new(1, None, None),
        )
    }

    fn enabled_account(id: &str) -> DiscordAccount {
        let mut account = DiscordAccount {
            id: id.to_string(),
            channel_id: format!("chan-{id}"),
            ..Default::default()
        };
        account.normalize();
        account
    }

    #[tokio::test]
    async fn choose_skips_non_accepting_accounts() {
        let healthy = runtime_for(enabled_account("a1"));

        let mut fishing = enabled_account("a2");
        fishing.fishing_time = "00:00-23:59".into();
        let fishing = runtime_for(fishing);

        let mut disabled = enabled_account("a3");
        disabled.enable = false;
        let disabled = runtime_for(disabled);

        let selector = AccountSelector::new(SelectRule::BestWaitIdle);
        let runtimes = vec![fishing, disabled, Arc::clone(&healthy)];
        let chosen = selector
            .choose(
                &runtimes,
                BotType::Mj,
                TaskAction::Imagine,
                &AccountFilter::default(),
            )
            .expect("one healthy account");
        assert_eq!(chosen.instance_id(), "chan-a1");
    }

    #[tokio::test]
    async fn instance_pin_filters_to_one_account() {
        let a1 = runtime_for(enabled_account("a1"));
        let a2 = runtime_for(enabled_account("a2"));
        let runtimes = vec![a1, a2];

        let selector = AccountSelector::new(SelectRule::Random);
        let filter = AccountFilter {
            instance_id: Some("chan-a2".into()),
            ..Default::default()
        };
        let chosen = selector
            .choose(&runtimes, BotType::Mj, TaskAction::Imagine, &filter)
            .expect("pinned account accepts");
        assert_eq!(chosen.instance_id(), "chan-a2");

        let filter = AccountFilter {
            instance_id: Some("chan-missing".into()),
            ..Default::default()
        };
        assert!(selector
            .choose(&runtimes, BotType::Mj, TaskAction::Imagine, &filter)
            .is_none());
    }

    #[tokio::test]
    async fn polling_cycles_round_robin() {
        let a1 = runtime_for(enabled_account("a1"));
        let a2 = runtime_for(enabled_account("a2"));
        let runtimes = vec![a1, a2];

        let selector = AccountSelector::new(SelectRule::Polling);
        let mut seen = Vec::new();
        for _ in 0..4 {
            let chosen = selector
                .choose(
                    &runtimes,
                    BotType::Mj,
                    TaskAction::Imagine,
                    &AccountFilter::default(),
                )
                .unwrap();
            seen.push(chosen.instance_id());
        }
        assert_eq!(seen, vec!["chan-a1", "chan-a2", "chan-a1", "chan-a2"]);
    }

    #[tokio::test]
    async fn best_wait_idle_prefers_shorter_queue_end_to_end() {
        let busy = runtime_for(enabled_account("a1"));
        for _ in 0..3 {
            let task = TaskInfo::new(TaskAction::Imagine, BotType::Mj, "x");
            assert!(matches!(
                busy.submit(task),
                crate::account::runtime::SubmitResult::Accepted(_)
            ));
        }
        let free = runtime_for(enabled_account("a2"));

        let selector = AccountSelector::new(SelectRule::BestWaitIdle);
        let chosen = selector
            .choose(
                &[busy, Arc::clone(&free)],
                BotType::Mj,
                TaskAction::Imagine,
                &AccountFilter::default(),
            )
            .unwrap();
        assert_eq!(chosen.instance_id(), "chan-a2");
    }
}
