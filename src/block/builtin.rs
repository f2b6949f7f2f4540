//! Built-in `core` block actions

use super::{Action, ActionContext, ActionError, BlockRegistry, CORE_BLOCK};
use crate::workflow::PauseMetadata;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

pub(super) fn register(registry: &mut BlockRegistry) {
    registry
        .register(CORE_BLOCK, "echo", Echo)
        .register(CORE_BLOCK, "approval", Approval)
        .register(CORE_BLOCK, "wait_for_webhook", WaitForWebhook)
        .register(CORE_BLOCK, "delay", Delay)
        .register(CORE_BLOCK, "fail", Fail)
        .register(CORE_BLOCK, "stop", Stop);
}

/// Returns its input unchanged
struct Echo;

#[async_trait]
impl Action for Echo {
    async fn run(&self, ctx: &mut ActionContext) -> Result<Value, ActionError> {
        Ok(ctx.props_value.clone())
    }

    fn description(&self) -> &str {
        "Return the input as output"
    }
}

/// Pauses until someone follows the approve or disapprove link
struct Approval;

#[async_trait]
impl Action for Approval {
    async fn run(&self, ctx: &mut ActionContext) -> Result<Value, ActionError> {
        if let Some(payload) = &ctx.resume_payload {
            let approved = payload
                .query_params
                .get("action")
                .is_some_and(|action| action == "approve");
            return Ok(json!({ "approved": approved }));
        }

        let base_url = ctx
            .prop("baseUrl")
            .and_then(Value::as_str)
            .unwrap_or("http://localhost:8080")
            .trim_end_matches('/')
            .to_string();
        let request_id = Uuid::new_v4().to_string();
        let link = |action: &str| {
            format!(
                "{}/runs/{}/requests/{}?action={}",
                base_url, ctx.run_id, request_id, action
            )
        };
        let links = json!({
            "approvalLink": link("approve"),
            "disapprovalLink": link("disapprove"),
        });

        ctx.pause(PauseMetadata::Webhook {
            request_id,
            response: json!({}),
        });
        Ok(links)
    }

    fn description(&self) -> &str {
        "Pause until approved or disapproved"
    }
}

/// Pauses until an external request arrives, then outputs it
struct WaitForWebhook;

#[async_trait]
impl Action for WaitForWebhook {
    async fn run(&self, ctx: &mut ActionContext) -> Result<Value, ActionError> {
        if let Some(payload) = &ctx.resume_payload {
            return serde_json::to_value(payload)
                .map_err(|e| ActionError::failed(format!("resume payload: {}", e)));
        }

        let response = ctx.prop("response").cloned().unwrap_or_else(|| json!({}));
        ctx.pause(PauseMetadata::Webhook {
            request_id: Uuid::new_v4().to_string(),
            response,
        });
        Ok(Value::Null)
    }

    fn description(&self) -> &str {
        "Pause until a webhook request arrives"
    }
}

/// Pauses for `seconds`, or until `until` (RFC 3339)
struct Delay;

#[async_trait]
impl Action for Delay {
    async fn run(&self, ctx: &mut ActionContext) -> Result<Value, ActionError> {
        if ctx.is_resuming() {
            return Ok(json!({ "resumedAt": Utc::now().to_rfc3339() }));
        }

        let resume_date_time = match (ctx.prop("until"), ctx.prop("seconds")) {
            (Some(until), _) => until
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| ActionError::invalid_input("'until' must be an RFC 3339 date"))?,
            (None, Some(seconds)) => {
                let seconds = seconds.as_i64().filter(|s| *s >= 0).ok_or_else(|| {
                    ActionError::invalid_input("'seconds' must be a non-negative integer")
                })?;
                Utc::now() + ChronoDuration::seconds(seconds)
            }
            (None, None) => {
                return Err(ActionError::invalid_input(
                    "delay needs 'seconds' or 'until'",
                ));
            }
        };

        ctx.pause(PauseMetadata::Delay { resume_date_time });
        Ok(json!({ "resumeDateTime": resume_date_time.to_rfc3339() }))
    }

    fn description(&self) -> &str {
        "Pause for a number of seconds or until a date"
    }
}

/// Always fails with `message`
struct Fail;

#[async_trait]
impl Action for Fail {
    async fn run(&self, ctx: &mut ActionContext) -> Result<Value, ActionError> {
        let message = ctx
            .prop("message")
            .and_then(Value::as_str)
            .unwrap_or("step failed");
        Err(ActionError::failed(message))
    }

    fn description(&self) -> &str {
        "Fail the step with a message"
    }
}

/// Ends the run successfully with `response` as the stop response
struct Stop;

#[async_trait]
impl Action for Stop {
    async fn run(&self, ctx: &mut ActionContext) -> Result<Value, ActionError> {
        let response = ctx.prop("response").cloned().unwrap_or(Value::Null);
        ctx.stop(response.clone());
        Ok(response)
    }

    fn description(&self) -> &str {
        "Stop the run and return a response"
    }
}
