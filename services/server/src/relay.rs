//! Cluster fan-out over Redis pub/sub.
//!
//! Every instance publishes to one shared channel, tagging the envelope
//! with its own instance id. The receive loop drops envelopes whose
//! instance id matches its own — origin instances already fan out locally
//! in [`realtime_core::Dispatcher::emit`], so re-delivering from the bus
//! would double-send to the origin's own subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use realtime_core::{ClusterBus, Dispatcher, InternalEvent, Presence};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

const BUS_CHANNEL: &str = "realtime:events";
const INSTANCES_KEY: &str = "realtime:instances";

fn clients_key(instance_id: &str) -> String {
    format!("realtime:clients:{instance_id}")
}

fn users_key(instance_id: &str) -> String {
    format!("realtime:users:{instance_id}")
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    instance_id: String,
    channel: String,
    event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

pub struct RedisRelay {
    instance_id: String,
    conn: ConnectionManager,
    client: redis::Client,
    /// Tracks which user a connected session last authenticated as, so a
    /// disconnect or logout can release the right refcount in `users:<id>`
    /// without the internal-bus event itself having to carry it.
    session_users: Mutex<HashMap<Uuid, String>>,
}

impl RedisRelay {
    pub async fn connect(url: &str, instance_id: String) -> redis::RedisResult<RedisRelay> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(RedisRelay {
            instance_id,
            conn,
            client,
            session_users: Mutex::new(HashMap::new()),
        })
    }

    /// Spawns the background task that subscribes to the bus channel and
    /// forwards non-origin events into the dispatcher's local fan-out.
    pub fn spawn_receiver(&self, dispatcher: Arc<Dispatcher>) {
        let client = self.client.clone();
        let own_instance_id = self.instance_id.clone();
        tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.subscribe(BUS_CHANNEL).await {
                            tracing::error!(error = %e, "failed to subscribe to cluster bus, retrying");
                        } else {
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = stream.next().await {
                                let payload: String = match msg.get_payload() {
                                    Ok(p) => p,
                                    Err(e) => {
                                        tracing::warn!(error = %e, "malformed cluster bus payload");
                                        continue;
                                    }
                                };
                                handle_envelope(&payload, &own_instance_id, &dispatcher).await;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "cluster bus connection failed, retrying in 1s");
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        });
    }

    /// Registers this instance in the cluster-wide presence registry and
    /// spawns the background task that keeps `clients:<instanceId>` and
    /// `users:<instanceId>` in sync with the dispatcher's connection and
    /// auth lifecycle events.
    pub async fn spawn_presence_tracker(self: &Arc<Self>, dispatcher: Arc<Dispatcher>) {
        let mut conn = self.conn.clone();
        if let Err(e) = redis::cmd("SADD")
            .arg(INSTANCES_KEY)
            .arg(&self.instance_id)
            .query_async::<()>(&mut conn)
            .await
        {
            tracing::error!(error = %e, "presence: failed to register instance");
        }

        let relay = self.clone();
        let mut rx = dispatcher.internal.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(InternalEvent::Connection { session }) => relay.on_connect(session).await,
                    Ok(InternalEvent::SessionClosed { session }) => relay.on_disconnect(session).await,
                    Ok(InternalEvent::Authentication { session, user_id: Some(user_id) }) => {
                        relay.on_authenticate(session, user_id).await
                    }
                    Ok(InternalEvent::Authentication { user_id: None, .. }) => {}
                    Ok(InternalEvent::Logout { session }) => relay.on_logout(session).await,
                    Ok(InternalEvent::MethodExecution { .. }) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "presence tracker lagged behind internal bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn on_connect(&self, session: Uuid) {
        let mut conn = self.conn.clone();
        if let Err(e) = redis::cmd("SADD")
            .arg(clients_key(&self.instance_id))
            .arg(session.to_string())
            .query_async::<()>(&mut conn)
            .await
        {
            tracing::error!(error = %e, "presence: failed to record connection");
        }
    }

    async fn on_disconnect(&self, session: Uuid) {
        let mut conn = self.conn.clone();
        if let Err(e) = redis::cmd("SREM")
            .arg(clients_key(&self.instance_id))
            .arg(session.to_string())
            .query_async::<()>(&mut conn)
            .await
        {
            tracing::error!(error = %e, "presence: failed to clear connection");
        }
        let user_id = self
            .session_users
            .lock()
            .expect("presence mutex poisoned")
            .remove(&session);
        if let Some(user_id) = user_id {
            self.release_user(&user_id).await;
        }
    }

    async fn on_authenticate(&self, session: Uuid, user_id: String) {
        let previous = self
            .session_users
            .lock()
            .expect("presence mutex poisoned")
            .insert(session, user_id.clone());
        match previous {
            Some(previous) if previous == user_id => return,
            Some(previous) => self.release_user(&previous).await,
            None => {}
        }
        let mut conn = self.conn.clone();
        if let Err(e) = redis::cmd("HINCRBY")
            .arg(users_key(&self.instance_id))
            .arg(&user_id)
            .arg(1)
            .query_async::<()>(&mut conn)
            .await
        {
            tracing::error!(error = %e, "presence: failed to record authenticated user");
        }
    }

    async fn on_logout(&self, session: Uuid) {
        let user_id = self
            .session_users
            .lock()
            .expect("presence mutex poisoned")
            .remove(&session);
        if let Some(user_id) = user_id {
            self.release_user(&user_id).await;
        }
    }

    /// Decrements a user's refcount in this instance's `users:<id>` hash,
    /// removing the field entirely once it reaches zero.
    async fn release_user(&self, user_id: &str) {
        let mut conn = self.conn.clone();
        let remaining: i64 = match redis::cmd("HINCRBY")
            .arg(users_key(&self.instance_id))
            .arg(user_id)
            .arg(-1)
            .query_async(&mut conn)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "presence: failed to decrement user refcount");
                return;
            }
        };
        if remaining <= 0 {
            if let Err(e) = redis::cmd("HDEL")
                .arg(users_key(&self.instance_id))
                .arg(user_id)
                .query_async::<()>(&mut conn)
                .await
            {
                tracing::error!(error = %e, "presence: failed to clear exhausted user refcount");
            }
        }
    }

    /// Cluster-wide connection and distinct-authenticated-user counts,
    /// aggregated across every instance currently registered in
    /// `instances`.
    pub async fn cluster_presence(&self) -> Presence {
        let mut conn = self.conn.clone();
        let instances: Vec<String> = redis::cmd("SMEMBERS")
            .arg(INSTANCES_KEY)
            .query_async(&mut conn)
            .await
            .unwrap_or_default();

        let mut connections = 0usize;
        let mut users = std::collections::HashSet::new();
        for instance in &instances {
            let count: usize = redis::cmd("SCARD")
                .arg(clients_key(instance))
                .query_async(&mut conn)
                .await
                .unwrap_or(0);
            connections += count;
            let fields: Vec<String> = redis::cmd("HKEYS")
                .arg(users_key(instance))
                .query_async(&mut conn)
                .await
                .unwrap_or_default();
            users.extend(fields);
        }
        Presence {
            connections,
            distinct_users: users.len(),
        }
    }

    /// Clears this instance's presence footprint on graceful shutdown, so
    /// a later restart under a fresh instance id doesn't inherit a stale
    /// `instances` member or orphaned client/user sets.
    pub async fn clear_presence(&self) {
        let mut conn = self.conn.clone();
        if let Err(e) = redis::cmd("DEL")
            .arg(clients_key(&self.instance_id))
            .arg(users_key(&self.instance_id))
            .query_async::<()>(&mut conn)
            .await
        {
            tracing::error!(error = %e, "presence: failed to clear instance sets on shutdown");
        }
        if let Err(e) = redis::cmd("SREM")
            .arg(INSTANCES_KEY)
            .arg(&self.instance_id)
            .query_async::<()>(&mut conn)
            .await
        {
            tracing::error!(error = %e, "presence: failed to deregister instance on shutdown");
        }
    }
}

async fn handle_envelope(payload: &str, own_instance_id: &str, dispatcher: &Arc<Dispatcher>) {
    let envelope: Envelope = match serde_json::from_str(payload) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(error = %e, "could not decode cluster bus envelope");
            return;
        }
    };
    if envelope.instance_id == own_instance_id {
        return;
    }
    dispatcher
        .receive_from_bus(&envelope.channel, &envelope.event, envelope.params)
        .await;
}

#[async_trait]
impl ClusterBus for RedisRelay {
    async fn publish(&self, channel: &str, event: &str, params: Option<Value>) {
        let envelope = Envelope {
            instance_id: self.instance_id.clone(),
            channel: channel.to_owned(),
            event: event.to_owned(),
            params,
        };
        let payload = serde_json::to_string(&envelope).expect("envelope is always serializable");
        let mut conn = self.conn.clone();
        if let Err(e) = redis::cmd("PUBLISH")
            .arg(BUS_CHANNEL)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
        {
            tracing::error!(error = %e, "failed to publish to cluster bus");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrips_through_json() {
        let envelope = Envelope {
            instance_id: "inst-1".into(),
            channel: "room".into(),
            event: "tick".into(),
            params: Some(serde_json::json!({"n": 1})),
        };
        let text = serde_json::to_string(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded.instance_id, "inst-1");
        assert_eq!(decoded.event, "tick");
    }
}
