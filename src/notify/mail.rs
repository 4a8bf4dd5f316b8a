//! Account incident notifications.
//!
//! Delivery is a collaborator concern; the default implementation records
//! the notice in the log together with the configured recipient so an
//! external relay (or an operator tailing the log) can act on it.

use async_trait::async_trait;
use tracing::warn;

use crate::config::SmtpConfig;

#[async_trait]
pub trait MailNotifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str);
}

pub struct LogMailNotifier {
    config: SmtpConfig,
}

impl LogMailNotifier {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailNotifier for LogMailNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        if self.config.to.is_empty() {
            warn!(subject, body, "mail notification (no recipient configured)");
        } else {
            warn!(to = %self.config.to, subject, body, "mail notification");
        }
    }
}
