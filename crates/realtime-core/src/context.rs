//! Ambient per-call context, available to handlers via a task-local as well
//! as the explicit first argument (see design note on implicit task-locals).

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::session::Session;

tokio::task_local! {
    static CALL_CONTEXT: CallContext;
}

#[derive(Clone)]
pub struct CallContext {
    pub execution_id: Uuid,
    pub session: Arc<Session>,
    pub session_context: Value,
}

impl CallContext {
    /// Reads the ambient context of the currently executing handler, if
    /// called from within one.
    pub fn try_current() -> Option<CallContext> {
        CALL_CONTEXT.try_with(|ctx| ctx.clone()).ok()
    }
}

pub(crate) async fn scope<F>(ctx: CallContext, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CALL_CONTEXT.scope(ctx, fut).await
}
