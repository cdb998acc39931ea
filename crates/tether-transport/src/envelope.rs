use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Response code for an accepted event.
pub const CODE_OK: u16 = 200;

/// Response code the manager uses to say "your settings were stale and have
/// been overwritten". Informational only, never an acknowledgment.
pub const CODE_STALE_SETTINGS: u16 = 204;

/// Outbound envelope topics (worker → manager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    /// Published data packages.
    Data,
    /// Worker registration.
    Register,
    /// Liveness probe; answered by `pong`.
    Ping,
    /// Ask the manager to compare a configuration version.
    Compare,
    /// Push locally authoritative configuration fragments.
    Update,
    /// Request fragments that are newer on the manager.
    Change,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Data => "data",
            Topic::Register => "register",
            Topic::Ping => "ping",
            Topic::Compare => "compare",
            Topic::Update => "update",
            Topic::Change => "change",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound envelope: `{"topic", "eventID", "message"}`.
///
/// `event_id` is assigned once at creation and is the only key the manager
/// echoes back in its `response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    #[serde(rename = "eventID")]
    pub event_id: String,
    pub message: Value,
}

impl Envelope {
    /// Create a new envelope with a random UUID.
    pub fn new(topic: Topic, message: Value) -> Self {
        Self {
            topic,
            event_id: uuid::Uuid::new_v4().to_string(),
            message,
        }
    }

    /// JSON object form.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("topic".into(), Value::from(self.topic.as_str()));
        object.insert("eventID".into(), Value::from(self.event_id.clone()));
        object.insert("message".into(), self.message.clone());
        Value::Object(object)
    }

    /// Serialize to the JSON text sent over the link.
    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }

    /// Parse an outbound envelope (used by peers and tests).
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// A `response` envelope from the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Echo of the request's `eventID`.
    pub event_id: Option<String>,
    pub code: u16,
    /// Name of the request this answers (`register`, `publish`, ...).
    pub event: Option<String>,
    /// Human readable status text.
    pub msg: Option<String>,
    /// Application-level correlation id (e.g. a published package `_id`).
    pub correlation_id: Option<String>,
    pub message: Value,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.code == CODE_OK
    }

    pub fn is_stale_settings(&self) -> bool {
        self.code == CODE_STALE_SETTINGS
    }
}

/// Inbound envelope, decoded and classified by topic.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Acknowledgment (or rejection) of an earlier outbound event.
    Response(Response),
    /// Configuration fragments pushed by the manager, keyed by fragment name.
    Update(Map<String, Value>),
    /// A job for the worker's trigger handler.
    Trigger(Value),
    /// Liveness confirmation.
    Pong,
    /// A topic this client does not know.
    Unrecognized { topic: String },
}

#[derive(Deserialize)]
struct RawInbound {
    topic: String,
    #[serde(rename = "eventID", default)]
    event_id: Option<String>,
    #[serde(default)]
    message: Value,
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl Inbound {
    /// Decode an inbound JSON text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawInbound = serde_json::from_str(text)?;

        let inbound = match raw.topic.as_str() {
            "response" => {
                let code = raw.code.ok_or_else(|| {
                    <serde_json::Error as serde::de::Error>::missing_field("code")
                })?;
                Inbound::Response(Response {
                    event_id: raw.event_id,
                    code,
                    event: raw.event,
                    msg: raw.msg,
                    correlation_id: raw.id,
                    message: raw.message,
                })
            }
            "update" => {
                // Fragments either travel in `message` or inline next to `topic`.
                let fragments = match raw.message {
                    Value::Object(map) => map,
                    Value::Null => raw.rest,
                    _ => {
                        return Err(<serde_json::Error as serde::de::Error>::custom(
                            "update message must be an object",
                        ))
                    }
                };
                Inbound::Update(fragments)
            }
            "trigger" => Inbound::Trigger(raw.message),
            "pong" => Inbound::Pong,
            other => Inbound::Unrecognized {
                topic: other.to_string(),
            },
        };
        Ok(inbound)
    }
}

/// Current time in milliseconds since UNIX epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
