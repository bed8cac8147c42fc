//! Detached background tasks with a failure trail.
//!
//! Follow-up work triggered from a webhook (auto-enrollment, routing) runs
//! after the response is sent. A failure is logged and written to the
//! `dead_letters` table so it can be inspected later.

use futures::FutureExt;
use outreach_core::error::Result;
use outreach_store::Store;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub fn spawn_detached<F>(store: Arc<Store>, task: &str, context: Option<String>, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let task = task.to_string();
    tokio::spawn(async move {
        let error = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("panicked: {}", panic_message(&*panic)),
        };
        tracing::error!(
            "💀 Background task '{task}' failed: {error} ({})",
            context.as_deref().unwrap_or("-")
        );
        if let Err(e) = store.record_dead_letter(&task, &error, context.as_deref()) {
            tracing::error!("💀 Dead letter for '{task}' not recorded: {e}");
        }
    })
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
