//! Exec agent server core.
//!
//! Routes JSON-RPC requests to handlers, enforces one response per request
//! id, fans events out to subscribed connections, and drives each
//! connection's inbound and outbound paths.

pub mod correlator;
pub mod dispatcher;
pub mod event_bus;
pub mod hub;
pub mod outbound;
pub mod router;

/// Hub-assigned identifier of a live connection.
pub type ConnectionId = String;

pub use correlator::{Correlator, CorrelatorError};
pub use dispatcher::{ConnectionScope, Dispatcher};
pub use event_bus::{EventBus, OverflowPolicy};
pub use hub::{ConnectionHub, HubConfig};
pub use outbound::{EventDelivery, Outbound, OutboundFrame};
pub use router::{Route, Router, RouterError};
