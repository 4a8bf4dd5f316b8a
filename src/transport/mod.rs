//! Outbound command transport.
//!
//! The runtime does not know how Midjourney commands are encoded; it hands a
//! typed [`Command`] plus a correlation nonce to a [`CommandTransport`] and
//! reads back a delivery outcome. The default implementation posts Discord
//! interactions over HTTP.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

use crate::task::BotType;

/// Midjourney bot application id.
pub const MJ_APPLICATION_ID: &str = "936929561302675456";
/// Niji journey bot application id.
pub const NIJI_APPLICATION_ID: &str = "1022952195194359889";
/// `/imagine` application command id and version.
const IMAGINE_COMMAND_ID: &str = "938956540159881230";
const IMAGINE_COMMAND_VERSION: &str = "1237876415471554623";

/// Where and as whom a command is dispatched.
#[derive(Debug, Clone)]
pub struct DispatchTarget {
    pub guild_id: String,
    pub channel_id: String,
    pub user_token: String,
    pub user_agent: String,
    pub session_id: String,
    pub bot: BotType,
}

impl DispatchTarget {
    pub fn application_id(&self) -> &'static str {
        match self.bot {
            BotType::Niji => NIJI_APPLICATION_ID,
            _ => MJ_APPLICATION_ID,
        }
    }
}

/// Typed Midjourney commands the runtime can dispatch.
#[derive(Debug, Clone)]
pub enum Command {
    Imagine { prompt: String },
    /// Press a button on a result message.
    Action {
        message_id: String,
        custom_id: String,
        message_flags: u64,
    },
    /// Submit a modal (remix prompt confirmation and friends).
    Modal {
        message_id: String,
        custom_id: String,
        component_custom_id: String,
        prompt: String,
    },
    Describe { uploaded_filename: String },
    Blend {
        uploaded_filenames: Vec<String>,
        dimensions: String,
    },
    Show { job_id: String },
    Shorten { prompt: String },
    /// Sync the account's settings components.
    Settings,
    /// Sync quota/mode information.
    Info,
    /// Best-effort cancellation of a running job.
    CancelJob { message_id: String },
}

/// Delivery classification; the runtime retries `Retry` outcomes and fails
/// the task on `Terminal`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    Delivered,
    Retry(String),
    Terminal(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn send(&self, target: &DispatchTarget, nonce: &str, command: &Command)
        -> TransportOutcome;
}

/// Posts commands as Discord HTTP interactions.
pub struct DiscordInteractionTransport {
    http: reqwest::Client,
    interactions_url: String,
}

impl DiscordInteractionTransport {
    pub fn new(server_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            interactions_url: format!("{}/api/v9/interactions", server_base.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl CommandTransport for DiscordInteractionTransport {
    async fn send(
        &self,
        target: &DispatchTarget,
        nonce: &str,
        command: &Command,
    ) -> TransportOutcome {
        let payload = build_payload(target, nonce, command);
        let response = self
            .http
            .post(&self.interactions_url)
            .header("Authorization", &target.user_token)
            .header("User-Agent", &target.user_agent)
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(res) => {
                let status = res.status();
                if !status.is_success() {
                    let body = res.text().await.unwrap_or_default();
                    debug!(%status, body, "interaction rejected");
                }
                classify_status(status)
            }
            Err(e) => TransportOutcome::Retry(format!("send interaction: {e}")),
        }
    }
}

/// 2xx delivered; rate limits and server errors are retriable; other client
/// errors are final.
pub fn classify_status(status: StatusCode) -> TransportOutcome {
    if status.is_success() {
        TransportOutcome::Delivered
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        TransportOutcome::Retry(format!("status {status}"))
    } else {
        TransportOutcome::Terminal(format!("status {status}"))
    }
}

/// Encode one command as an interaction body.
pub fn build_payload(target: &DispatchTarget, nonce: &str, command: &Command) -> Value {
    let application_id = target.application_id();
    match command {
        Command::Imagine { prompt } => application_command(
            target,
            nonce,
            json!({
                "version": IMAGINE_COMMAND_VERSION,
                "id": IMAGINE_COMMAND_ID,
                "name": "imagine",
                "type": 1,
                "options": [{"type": 3, "name": "prompt", "value": prompt}],
            }),
        ),
        Command::Shorten { prompt } => application_command(
            target,
            nonce,
            json!({
                "name": "shorten",
                "type": 1,
                "options": [{"type": 3, "name": "prompt", "value": prompt}],
            }),
        ),
        Command::Describe { uploaded_filename } => application_command(
            target,
            nonce,
            json!({
                "name": "describe",
                "type": 1,
                "options": [{"type": 11, "name": "image", "value": 0}],
                "attachments": [{
                    "id": "0",
                    "uploaded_filename": uploaded_filename,
                    "filename": uploaded_filename.rsplit('/').next().unwrap_or("image.png"),
                }],
            }),
        ),
        Command::Blend {
            uploaded_filenames,
            dimensions,
        } => {
            let options: Vec<Value> = uploaded_filenames
                .iter()
                .enumerate()
                .map(|(i, _)| json!({"type": 11, "name": format!("image{}", i + 1), "value": i}))
                .chain(std::iter::once(
                    json!({"type": 3, "name": "dimensions", "value": dimensions}),
                ))
                .collect();
            let attachments: Vec<Value> = uploaded_filenames
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    json!({
                        "id": i.to_string(),
                        "uploaded_filename": name,
                        "filename": name.rsplit('/').next().unwrap_or("image.png"),
                    })
                })
                .collect();
            application_command(
                target,
                nonce,
                json!({
                    "name": "blend",
                    "type": 1,
                    "options": options,
                    "attachments": attachments,
                }),
            )
        }
        Command::Show { job_id } => application_command(
            target,
            nonce,
            json!({
                "name": "show",
                "type": 1,
                "options": [{"type": 3, "name": "job_id", "value": job_id}],
            }),
        ),
        Command::Settings => application_command(
            target,
            nonce,
            json!({"name": "settings", "type": 1, "options": []}),
        ),
        Command::Info => application_command(
            target,
            nonce,
            json!({"name": "info", "type": 1, "options": []}),
        ),
        Command::Action {
            message_id,
            custom_id,
            message_flags,
        } => json!({
            "type": 3,
            "nonce": nonce,
            "guild_id": target.guild_id,
            "channel_id": target.channel_id,
            "message_flags": message_flags,
            "message_id": message_id,
            "application_id": application_id,
            "session_id": target.session_id,
            "data": {"component_type": 2, "custom_id": custom_id},
        }),
        Command::Modal {
            message_id,
            custom_id,
            component_custom_id,
            prompt,
        } => json!({
            "type": 5,
            "nonce": nonce,
            "guild_id": target.guild_id,
            "channel_id": target.channel_id,
            "application_id": application_id,
            "session_id": target.session_id,
            "data": {
                "id": message_id,
                "custom_id": custom_id,
                "components": [{
                    "type": 1,
                    "components": [{
                        "type": 4,
                        "custom_id": component_custom_id,
                        "value": prompt,
                    }],
                }],
            },
        }),
        Command::CancelJob { message_id } => json!({
            "type": 3,
            "nonce": nonce,
            "guild_id": target.guild_id,
            "channel_id": target.channel_id,
            "message_id": message_id,
            "application_id": application_id,
            "session_id": target.session_id,
            "data": {"component_type": 2, "custom_id": "MJ::CancelJob::ByJobid"},
        }),
    }
}

fn application_command(target: &DispatchTarget, nonce: &str, data: Value) -> Value {
    json!({
        "type": 2,
        "nonce": nonce,
        "guild_id": target.guild_id,
        "channel_id": target.channel_id,
        "application_id": target.application_id(),
        "session_id": target.session_id,
        "data": data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> DispatchTarget {
        DispatchTarget {
            guild_id: "g1".into(),
            channel_id: "c1".into(),
            user_token: "tok".into(),
            user_agent: "ua".into(),
            session_id: "sess".into(),
            bot: BotType::Mj,
        }
    }

    #[test]
    fn imagine_payload_carries_prompt_and_nonce() {
        let payload = build_payload(
            &target(),
            "9001",
            &Command::Imagine {
                prompt: "Cat".into(),
            },
        );
        assert_eq!(payload["type"], 2);
        assert_eq!(payload["nonce"], "9001");
        assert_eq!(payload["channel_id"], "c1");
        assert_eq!(payload["application_id"], MJ_APPLICATION_ID);
        assert_eq!(payload["data"]["options"][0]["value"], "Cat");
    }

    #[test]
    fn niji_routes_to_niji_application() {
        let mut t = target();
        t.bot = BotType::Niji;
        let payload = build_payload(&t, "1", &Command::Settings);
        assert_eq!(payload["application_id"], NIJI_APPLICATION_ID);
    }

    #[test]
    fn action_payload_is_component_press() {
        let payload = build_payload(
            &target(),
            "9002",
            &Command::Action {
                message_id: "m1".into(),
                custom_id: "MJ::JOB::upsample::1::h".into(),
                message_flags: 0,
            },
        );
        assert_eq!(payload["type"], 3);
        assert_eq!(payload["message_id"], "m1");
        assert_eq!(payload["data"]["custom_id"], "MJ::JOB::upsample::1::h");
    }

    #[test]
    fn modal_payload_nests_prompt_input() {
        let payload = build_payload(
            &target(),
            "9003",
            &Command::Modal {
                message_id: "m1".into(),
                custom_id: "MJ::RemixModal::1".into(),
                component_custom_id: "MJ::RemixModal::new_prompt".into(),
                prompt: "Cat --v 6".into(),
            },
        );
        assert_eq!(payload["type"], 5);
        assert_eq!(
            payload["data"]["components"][0]["components"][0]["value"],
            "Cat --v 6"
        );
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::NO_CONTENT),
            TransportOutcome::Delivered
        );
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            TransportOutcome::Retry(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            TransportOutcome::Retry(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST),
            TransportOutcome::Terminal(_)
        ));
    }
}
