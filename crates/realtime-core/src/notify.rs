//! Internal lifecycle notifications, kept on a separate bus from the
//! user-facing named-event table (see the design note on why these two
//! are not unified).

use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum InternalEvent {
    Connection { session: Uuid },
    Authentication { session: Uuid, user_id: Option<String> },
    Logout { session: Uuid },
    MethodExecution {
        name: String,
        elapsed_ms: u128,
        params: Value,
        result: Value,
    },
    SessionClosed { session: Uuid },
}

pub type InternalBus = broadcast::Sender<InternalEvent>;

pub fn internal_bus() -> InternalBus {
    let (tx, _rx) = broadcast::channel(1024);
    tx
}
