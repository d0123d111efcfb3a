//! Server-to-client events.
//!
//! Events are not correlated to any request. They are pushed to every
//! subscribed connection whenever something happens on the agent side,
//! e.g. a process writes a line of output or dies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A payload that can be stamped with the instant its event happened.
pub trait Periodical: Serialize {
    fn set_time(&mut self, time: DateTime<Utc>);
}

/// Base body holding the event instant.
///
/// Payload structs embed it with `#[serde(flatten)]` and delegate
/// [`Periodical::set_time`] to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

impl Periodical for EventBody {
    fn set_time(&mut self, time: DateTime<Utc>) {
        self.time = Some(time);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event type must not be empty")]
    EmptyType,
    #[error("event time must not be the zero instant")]
    ZeroTime,
    #[error("event body must serialize to a JSON object")]
    BodyNotObject,
    #[error("failed to serialize event body: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// An immutable event frame: `{"type": "...", "body": {"time": ..., ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    event_type: String,
    body: Value,
    #[serde(skip)]
    time: DateTime<Utc>,
}

impl Event {
    /// Build an event stamped with the current instant.
    pub fn now<B: Periodical>(event_type: impl Into<String>, body: B) -> Result<Self, EventError> {
        Self::at(event_type, body, Utc::now())
    }

    /// Build an event stamped with an explicit instant.
    pub fn at<B: Periodical>(
        event_type: impl Into<String>,
        mut body: B,
        time: DateTime<Utc>,
    ) -> Result<Self, EventError> {
        let event_type = event_type.into();
        if event_type.is_empty() {
            return Err(EventError::EmptyType);
        }
        if time == DateTime::<Utc>::UNIX_EPOCH {
            return Err(EventError::ZeroTime);
        }

        body.set_time(time);
        let Value::Object(mut fields) = serde_json::to_value(&body)? else {
            return Err(EventError::BodyNotObject);
        };
        // Bodies that do not embed `EventBody` still go out with a time.
        if !fields.contains_key("time") {
            fields.insert("time".into(), serde_json::to_value(time)?);
        }

        Ok(Self {
            event_type,
            body: Value::Object(fields),
            time,
        })
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }
}
