//! EventBus: fans events out to subscribed connections.
//!
//! No persistence and no replay: a connection sees exactly the events
//! published while it is subscribed. Publishing never blocks; a subscriber
//! whose queue is full is handled according to the [`OverflowPolicy`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use exec_protocol::Event;
use exec_services::EventPublisher;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::ConnectionId;
use crate::outbound::{EventDelivery, Outbound};

/// What to do with a subscriber whose outbound queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the event for that subscriber and count it.
    #[default]
    DropEvent,
    /// Unsubscribe and close the subscriber's connection.
    Disconnect,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop-event" => Ok(Self::DropEvent),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(format!(
                "unknown overflow policy '{other}' (expected drop-event or disconnect)"
            )),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DropEvent => "drop-event",
            Self::Disconnect => "disconnect",
        })
    }
}

pub struct EventBus {
    subscribers: RwLock<HashMap<ConnectionId, Outbound>>,
    policy: OverflowPolicy,
}

impl EventBus {
    pub fn new(policy: OverflowPolicy) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn subscribe(&self, connection: ConnectionId, outbound: Outbound) {
        debug!(%connection, "Subscribed to events");
        self.subscribers.write().insert(connection, outbound);
    }

    pub fn unsubscribe(&self, connection: &str) -> bool {
        self.subscribers.write().remove(connection).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Push `event` to every current subscriber. Returns how many queued it.
    pub fn publish(&self, event: Event) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut evicted = Vec::new();

        {
            let subscribers = self.subscribers.read();
            for (connection, outbound) in subscribers.iter() {
                match outbound.try_send_event(event.clone()) {
                    EventDelivery::Queued => delivered += 1,
                    EventDelivery::Closed => evicted.push(connection.clone()),
                    EventDelivery::Full => match self.policy {
                        OverflowPolicy::DropEvent => {
                            let dropped = outbound.record_drop();
                            warn!(
                                %connection,
                                dropped,
                                "Outbound queue full, dropping {} event",
                                event.event_type()
                            );
                        }
                        OverflowPolicy::Disconnect => {
                            warn!(%connection, "Outbound queue full, disconnecting slow subscriber");
                            outbound.request_close();
                            evicted.push(connection.clone());
                        }
                    },
                }
            }
        }

        if !evicted.is_empty() {
            let mut subscribers = self.subscribers.write();
            for connection in &evicted {
                subscribers.remove(connection);
            }
        }

        delivered
    }

    /// Publishing callback handed to services.
    pub fn publisher(self: &Arc<Self>) -> EventPublisher {
        let bus = Arc::clone(self);
        Arc::new(move |event: Event| {
            bus.publish(event);
        })
    }
}
