//! Callback dispatcher.
//!
//! Terminal task transitions enqueue a snapshot; a bounded worker pool posts
//! it to the task's notify hook (or the global default) with up to three
//! attempts. Delivery is best effort: a full queue or exhausted retries are
//! logged and dropped, never propagated to the task path.

pub mod mail;

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::task::TaskInfo;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug)]
struct CallbackJob {
    url: String,
    payload: Value,
}

#[derive(Clone)]
pub struct CallbackDispatcher {
    tx: mpsc::Sender<CallbackJob>,
    default_hook: Option<String>,
}

impl CallbackDispatcher {
    /// Spawn `pool_size` delivery workers sharing one bounded queue.
    pub fn new(pool_size: usize, default_hook: Option<String>, secret: Option<String>) -> Self {
        let pool_size = pool_size.max(1);
        let (tx, rx) = mpsc::channel::<CallbackJob>(pool_size * 32);
        let rx = Arc::new(Mutex::new(rx));
        let http = reqwest::Client::new();
        let secret = Arc::new(secret);

        for _ in 0..pool_size {
            let rx = Arc::clone(&rx);
            let http = http.clone();
            let secret = Arc::clone(&secret);
            tokio::spawn(async move {
                loop {
                    // Hold the lock only while waiting for the next job.
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => deliver(&http, &job, secret.as_deref()).await,
                        None => break,
                    }
                }
            });
        }

        Self { tx, default_hook }
    }

    /// Enqueue a terminal-task callback. `hook_override` is the per-submission
    /// notify hook, when the client supplied one.
    pub fn notify_task(&self, task: &TaskInfo, hook_override: Option<&str>) {
        let url = hook_override
            .filter(|u| !u.is_empty())
            .map(|u| u.to_string())
            .or_else(|| self.default_hook.clone());
        let Some(url) = url else {
            debug!(task_id = %task.id, "no notify hook configured, skipping callback");
            return;
        };

        let payload = match serde_json::to_value(task) {
            Ok(v) => v,
            Err(e) => {
                error!(task_id = %task.id, "serialize callback payload: {e}");
                return;
            }
        };

        if let Err(e) = self.tx.try_send(CallbackJob { url, payload }) {
            warn!(task_id = %task.id, "callback queue full, dropping: {e}");
        }
    }
}

async fn deliver(http: &reqwest::Client, job: &CallbackJob, secret: Option<&str>) {
    let body = job.payload.to_string();
    for attempt in 0..MAX_ATTEMPTS {
        let mut request = http
            .post(&job.url)
            .header("Content-Type", "application/json")
            .body(body.clone());
        if let Some(secret) = secret {
            request = request.header("X-Notify-Secret", sign(secret, &body));
        }

        match request.send().await {
            Ok(res) if res.status().is_success() => {
                debug!(url = %job.url, "callback delivered");
                return;
            }
            Ok(res) => {
                warn!(url = %job.url, status = %res.status(), attempt, "callback rejected");
            }
            Err(e) => {
                warn!(url = %job.url, attempt, "callback send failed: {e}");
            }
        }

        tokio::time::sleep(backoff_delay(attempt)).await;
    }
    error!(url = %job.url, "callback dropped after {MAX_ATTEMPTS} attempts");
}

/// Exponential backoff between delivery attempts.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(2u64.pow(attempt) * 500)
}

/// HMAC-SHA256 signature of the callback body, hex encoded.
pub fn sign(secret: &str, body: &str) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BotType, TaskAction};

    #[test]
    fn signature_is_stable_hex() {
        let a = sign("secret", r#"{"id":"1"}"#);
        let b = sign("secret", r#"{"id":"1"}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        assert_ne!(a, sign("other", r#"{"id":"1"}"#));
        assert_ne!(a, sign("secret", r#"{"id":"2"}"#));
    }

    #[test]
    fn backoff_grows_exponentially() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn payload_is_a_full_task_snapshot() {
        let mut task = TaskInfo::new(TaskAction::Imagine, BotType::Mj, "Cat");
        task.mark_submitted();
        task.mark_in_progress();
        task.mark_success();

        let payload = serde_json::to_value(&task).unwrap();
        assert_eq!(payload["status"], "success");
        assert_eq!(payload["action"], "IMAGINE");
        assert_eq!(payload["progress"], "100%");
        assert!(payload["finish_time"].as_u64().unwrap() > 0);
    }
}
