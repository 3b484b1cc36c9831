use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

mod event_log;

pub use event_log::JsonLineSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    SessionOpened,
    OriginConnected,
    CommandForwarded,
    LoginSucceeded,
    TlsUpgraded,
    TlsRefusedByOrigin,
    OriginSwitched,
    OriginSwitchFailed,
    SessionClosed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionOpened => "session_opened",
            Self::OriginConnected => "origin_connected",
            Self::CommandForwarded => "command_forwarded",
            Self::LoginSucceeded => "login_succeeded",
            Self::TlsUpgraded => "tls_upgraded",
            Self::TlsRefusedByOrigin => "tls_refused_by_origin",
            Self::OriginSwitched => "origin_switched",
            Self::OriginSwitchFailed => "origin_switch_failed",
            Self::SessionClosed => "session_closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionScope {
    pub session_id: Uuid,
    pub client_addr: String,
    pub origin_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub scope: SessionScope,
    pub occurred_at_unix_ms: u128,
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventType, scope: SessionScope) -> Self {
        Self {
            kind,
            scope,
            occurred_at_unix_ms: now_unix_ms(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl VecEventSink {
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().expect("lock poisoned").clone()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: Event) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}

fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    }
}
