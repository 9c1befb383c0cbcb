//! Named events, channels, and the subscriber sets behind them.
//!
//! A channel is a lazily-created bucket of per-event subscriber sets.
//! Empty channels other than [`wire_protocol::NO_CHANNEL`] are evicted when
//! their last subscriber leaves, mirroring the teacher's
//! `get_or_create_broadcast` double-checked-locking pattern for its
//! per-race broadcast map.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;
use wire_protocol::NO_CHANNEL;

use crate::relay::ClusterBus;
use crate::session::Session;

pub type ShouldSubscribeFn = Arc<dyn Fn(&Session, &str, &str) -> bool + Send + Sync>;
pub type ChannelJoinFn = Arc<dyn Fn(&Session, &str) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct EventOptions {
    pub protected: bool,
    pub should_subscribe: Option<ShouldSubscribeFn>,
}

impl Default for EventOptions {
    fn default() -> Self {
        EventOptions {
            protected: false,
            should_subscribe: None,
        }
    }
}

pub struct EventDef {
    pub name: String,
    pub protected: bool,
    pub should_subscribe: ShouldSubscribeFn,
}

fn allow_all() -> ShouldSubscribeFn {
    Arc::new(|_session: &Session, _event: &str, _channel: &str| true)
}

pub struct ChannelRef {
    pub name: String,
    join_predicate: RwLock<Option<ChannelJoinFn>>,
    subscribers: RwLock<HashMap<String, HashMap<Uuid, Arc<Session>>>>,
}

impl ChannelRef {
    fn new(name: impl Into<String>) -> Self {
        ChannelRef {
            name: name.into(),
            join_predicate: RwLock::new(None),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    async fn insert_subscriber(&self, event_name: &str, session: &Arc<Session>) {
        let mut subs = self.subscribers.write().await;
        subs.entry(event_name.to_owned())
            .or_default()
            .insert(session.uuid, session.clone());
    }

    async fn remove_subscriber(&self, event_name: &str, session_uuid: Uuid) {
        let mut subs = self.subscribers.write().await;
        if let Some(set) = subs.get_mut(event_name) {
            set.remove(&session_uuid);
            if set.is_empty() {
                subs.remove(event_name);
            }
        }
    }

    async fn remove_session_everywhere(&self, session_uuid: Uuid) {
        let mut subs = self.subscribers.write().await;
        subs.retain(|_event, set| {
            set.remove(&session_uuid);
            !set.is_empty()
        });
    }

    async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    async fn subscribers_for(&self, event_name: &str) -> Vec<Arc<Session>> {
        self.subscribers
            .read()
            .await
            .get(event_name)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_subscribed(&self, event_name: &str, session_uuid: Uuid) -> bool {
        self.subscribers
            .read()
            .await
            .get(event_name)
            .map(|set| set.contains_key(&session_uuid))
            .unwrap_or(false)
    }
}

pub struct EventRegistry {
    events: RwLock<HashMap<String, Arc<EventDef>>>,
    channels: RwLock<HashMap<String, Arc<ChannelRef>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        EventRegistry {
            events: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_event(&self, name: impl Into<String>, options: EventOptions) {
        let name = name.into();
        let def = Arc::new(EventDef {
            name: name.clone(),
            protected: options.protected,
            should_subscribe: options.should_subscribe.unwrap_or_else(allow_all),
        });
        self.events.write().await.insert(name, def);
    }

    pub async fn has_event(&self, name: &str) -> bool {
        self.events.read().await.contains_key(name)
    }

    /// Fetches (lazily creating) a channel by name. The `NO_CHANNEL` default
    /// channel is never evicted.
    pub async fn channel(&self, name: &str) -> Arc<ChannelRef> {
        if let Some(existing) = self.channels.read().await.get(name) {
            return existing.clone();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(ChannelRef::new(name)))
            .clone()
    }

    pub async fn set_channel_join_predicate(&self, name: &str, predicate: ChannelJoinFn) {
        let channel = self.channel(name).await;
        *channel.join_predicate.write().await = Some(predicate);
    }

    /// Implements the `rpc:on` per-event subscription algorithm.
    pub async fn try_subscribe(&self, channel_name: &str, event_name: &str, session: &Arc<Session>) -> bool {
        let channel = self.channel(channel_name).await;
        if let Some(predicate) = channel.join_predicate.read().await.as_ref() {
            if !predicate(session, event_name) {
                return false;
            }
        }
        let event = match self.events.read().await.get(event_name).cloned() {
            Some(event) => event,
            None => return false,
        };
        if event.protected && !session.is_authenticated() {
            return false;
        }
        if !(event.should_subscribe)(session, event_name, channel_name) {
            return false;
        }
        channel.insert_subscriber(event_name, session).await;
        true
    }

    pub async fn unsubscribe(&self, channel_name: &str, event_name: &str, session_uuid: Uuid) {
        let channel = match self.channels.read().await.get(channel_name).cloned() {
            Some(channel) => channel,
            None => return,
        };
        channel.remove_subscriber(event_name, session_uuid).await;
        self.evict_if_empty(channel_name).await;
    }

    pub async fn unsubscribe_everywhere(&self, session_uuid: Uuid) {
        let channels: Vec<Arc<ChannelRef>> = self.channels.read().await.values().cloned().collect();
        for channel in channels {
            channel.remove_session_everywhere(session_uuid).await;
        }
        let names: Vec<String> = self.channels.read().await.keys().cloned().collect();
        for name in names {
            self.evict_if_empty(&name).await;
        }
    }

    pub async fn session_subscribed(&self, channel_name: &str, event_name: &str, session_uuid: Uuid) -> bool {
        match self.channels.read().await.get(channel_name) {
            Some(channel) => channel.is_subscribed(event_name, session_uuid).await,
            None => false,
        }
    }

    async fn evict_if_empty(&self, channel_name: &str) {
        if channel_name == NO_CHANNEL {
            return;
        }
        let empty = match self.channels.read().await.get(channel_name) {
            Some(channel) => channel.is_empty().await,
            None => return,
        };
        if empty {
            self.channels.write().await.remove(channel_name);
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Delivers to local subscribers, and — when a cluster relay is
    /// attached — publishes to the bus so other instances fan out too.
    pub async fn emit(
        &self,
        channel_name: &str,
        event_name: &str,
        params: Option<Value>,
        relay: Option<&Arc<dyn ClusterBus>>,
    ) {
        if !self.has_event(event_name).await {
            tracing::warn!(event = event_name, "emit: unknown event, dropping");
            return;
        }
        self.local_emit(channel_name, event_name, params.clone()).await;
        if let Some(bus) = relay {
            bus.publish(channel_name, event_name, params).await;
        }
    }

    /// Fans out locally only. Used both by `emit` and by the relay's bus
    /// receive loop, which has already suppressed its own echo.
    pub async fn local_emit(&self, channel_name: &str, event_name: &str, params: Option<Value>) {
        let channel = match self.channels.read().await.get(channel_name).cloned() {
            Some(channel) => channel,
            None => return,
        };
        for session in channel.subscribers_for(event_name).await {
            session.send_event(channel_name, event_name, params.clone());
        }
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimitConfig;
    use tokio::sync::mpsc;

    fn session() -> Arc<Session> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Session::new(Uuid::new_v4(), tx, RateLimitConfig::default(), None, None))
    }

    #[tokio::test]
    async fn subscribe_to_unknown_event_is_denied() {
        let registry = EventRegistry::new();
        let session = session();
        assert!(!registry.try_subscribe(NO_CHANNEL, "ghost", &session).await);
    }

    #[tokio::test]
    async fn protected_event_denies_unauthenticated_session() {
        let registry = EventRegistry::new();
        registry
            .add_event(
                "secrets",
                EventOptions {
                    protected: true,
                    should_subscribe: None,
                },
            )
            .await;
        let session = session();
        assert!(!registry.try_subscribe(NO_CHANNEL, "secrets", &session).await);
        session.set_authenticated(Value::Null, None).await;
        assert!(registry.try_subscribe(NO_CHANNEL, "secrets", &session).await);
    }

    #[tokio::test]
    async fn non_default_channel_is_evicted_once_empty() {
        let registry = EventRegistry::new();
        registry.add_event("ping", EventOptions::default()).await;
        let session = session();
        assert!(registry.try_subscribe("room-1", "ping", &session).await);
        assert_eq!(registry.channel_count().await, 1);
        registry.unsubscribe("room-1", "ping", session.uuid).await;
        assert_eq!(registry.channel_count().await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_everywhere_removes_all_memberships() {
        let registry = EventRegistry::new();
        registry.add_event("a", EventOptions::default()).await;
        registry.add_event("b", EventOptions::default()).await;
        let session = session();
        registry.try_subscribe("room-1", "a", &session).await;
        registry.try_subscribe("room-2", "b", &session).await;
        registry.unsubscribe_everywhere(session.uuid).await;
        assert_eq!(registry.channel_count().await, 0);
    }
}
