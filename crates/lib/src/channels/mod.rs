//! Communication channels (e.g. Microsoft Teams).
//!
//! Channel trait and registry so the gateway can start/stop channel connectors
//! and deliver replies. Inbound events are sent to the gateway for routing.

mod inbound;
mod registry;
pub mod teams;

pub use inbound::{InboundEvent, InboundMessage};
pub use registry::{ChannelError, ChannelHandle, ChannelRegistry};
pub use teams::{Activity, TeamsChannel};
