//! busrpc transport binding.
//!
//! Everything that touches the broker lives here: the [`Broker`] contract,
//! the channel naming convention, the envelope shapes that travel on each
//! channel, and two broker implementations.
//!
//! ## Architecture
//!
//! - **Broker**: publish/subscribe contract consumed by the kernel
//! - **Event**: logical channel families (`rp:connect`, `rp:call`, ...)
//! - **Envelope**: JSON payloads, one shape per channel family
//! - **LocalBroker**: in-process hub with per-connection subscriptions
//! - **RelayServer / RelayClient**: the same hub exposed over TCP with
//!   length-prefixed JSON frames

pub mod broker;
pub mod channel;
pub mod local;
pub mod message;
pub mod relay;

pub use broker::{Broker, BrokerMessage, MessageSink, WireError};
pub use channel::{subscription_channels, Event};
pub use local::{LocalBroker, LocalConnection};
pub use message::{CallEnvelope, Envelope, MessageEnvelope, RelayFrame, ResponseEnvelope};
pub use relay::{RelayClient, RelayServer};
