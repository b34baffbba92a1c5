use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use taskflow::jobs::{boxed, parse_payload, HandlerError, HandlerRegistry};

#[derive(Deserialize)]
struct EmailSendPayload {
    user_id: i64,
    template: Option<String>,
}

#[derive(Deserialize)]
struct SleepPayload {
    #[serde(default = "default_sleep_ms")]
    ms: u64,
}

fn default_sleep_ms() -> u64 {
    300
}

pub fn build_registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();

    // Demo handlers. Replace these with your real handlers.
    registry.register_fn("demo_ok", |_task, _payload, _ctx| {
        boxed(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(json!({ "ok": true }))
        })
    });

    registry.register_fn("fail_me", |_task, _payload, _ctx| {
        boxed(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Err(HandlerError::failed("simulated failure"))
        })
    });

    // Honours cancellation so a timed-out attempt stops burning a slot.
    registry.register_fn("sleep", |_task, payload, ctx| {
        boxed(async move {
            let p: SleepPayload = parse_payload(payload)?;
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(HandlerError::failed("cancelled")),
                _ = tokio::time::sleep(Duration::from_millis(p.ms)) => {
                    Ok(json!({ "slept_ms": p.ms }))
                }
            }
        })
    });

    // Example handler with payload validation.
    registry.register_fn("email_send", |task, payload, ctx| {
        boxed(async move {
            let p: EmailSendPayload = parse_payload(payload)?;
            tracing::info!(
                task_id = %task.id,
                job_id = %ctx.job_id,
                user_id = p.user_id,
                template = p.template.as_deref().unwrap_or("default"),
                "sending email"
            );
            Ok(Value::Null)
        })
    });

    Arc::new(registry)
}
