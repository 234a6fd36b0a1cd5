// execute.rs - Run one dispatch and record its terminal outcome.
//
// Shared by approval replay and engine-forwarded allowed calls. The
// `-> executing` transition commits before any network I/O, so a crash
// mid-dispatch leaves an inspectable `executing` row and never a second call.
// Dispatch runs detached from the caller's future.

use std::sync::Arc;
use std::time::Duration;

use ctrl_ledger::{Ledger, LedgerError, RequestRecord, RequestStatus, Transition};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::dispatch::ActionDispatcher;
use crate::error::{CoordinatorError, DispatchError};

/// Maximum characters kept in a `tool.result` preview.
pub const PREVIEW_CHARS: usize = 500;

/// Short text form of a tool result for the audit trail.
pub fn preview(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.chars().take(PREVIEW_CHARS).collect()
}

/// Claim `request` for execution (`from -> executing`), dispatch it and
/// record `executed` or `failed`. Losing the claim means another caller is
/// executing it; nothing is dispatched.
///
/// Once claimed, dispatch and the terminal write run on their own task.
/// Dropping the returned future (an HTTP client hanging up mid-replay) does
/// not cancel them, so the request still reaches `executed` or `failed`.
pub(crate) async fn execute(
    ledger: &Ledger,
    request: &RequestRecord,
    from: RequestStatus,
    dispatcher: Arc<dyn ActionDispatcher>,
    timeout: Duration,
) -> Result<Value, CoordinatorError> {
    ledger.transition(
        &request.id,
        &Transition::new(from, RequestStatus::Executing)
            .with_detail("server", request.server.as_str())
            .with_detail("tool", request.tool.as_str()),
    )?;

    let task = tokio::spawn(dispatch_and_record(
        ledger.clone(),
        request.clone(),
        dispatcher,
        timeout,
    ));
    match task.await {
        Ok(result) => result,
        Err(join_error) => {
            let message = format!("dispatch task aborted: {join_error}");
            record_outcome(ledger, &request.id, &Err(message.clone()))?;
            Err(CoordinatorError::ExternalDispatchFailure { message })
        }
    }
}

async fn dispatch_and_record(
    ledger: Ledger,
    request: RequestRecord,
    dispatcher: Arc<dyn ActionDispatcher>,
    timeout: Duration,
) -> Result<Value, CoordinatorError> {
    let outcome = match tokio::time::timeout(
        timeout,
        dispatcher.dispatch(&request.server, &request.tool, &request.args),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(DispatchError::Timeout {
            secs: timeout.as_secs(),
        }),
    }
    .map_err(|e| e.to_string());

    record_outcome(&ledger, &request.id, &outcome)?;
    outcome.map_err(|message| CoordinatorError::ExternalDispatchFailure { message })
}

/// Move an `executing` request to its terminal state.
pub(crate) fn record_outcome(
    ledger: &Ledger,
    request_id: &str,
    outcome: &Result<Value, String>,
) -> Result<RequestRecord, LedgerError> {
    match outcome {
        Ok(value) => {
            let record = ledger.transition(
                request_id,
                &Transition::new(RequestStatus::Executing, RequestStatus::Executed)
                    .with_result(json!({ "result_preview": preview(value) })),
            )?;
            info!(request_id, "action executed");
            Ok(record)
        }
        Err(message) => {
            error!(request_id, error = %message, "action failed");
            ledger.transition(
                request_id,
                &Transition::new(RequestStatus::Executing, RequestStatus::Failed)
                    .with_detail("error", message.as_str()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_is_bounded_by_characters() {
        let long = "é".repeat(PREVIEW_CHARS + 20);
        let text = preview(&Value::String(long));
        assert_eq!(text.chars().count(), PREVIEW_CHARS);
        assert_eq!(preview(&json!({"ok": true})), r#"{"ok":true}"#);
    }
}
