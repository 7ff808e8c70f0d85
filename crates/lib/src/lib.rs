//! Ferry core library: conversation-to-session routing, the chat backend client,
//! channels, and the gateway used by the CLI.

pub mod backend;
pub mod channels;
pub mod config;
pub mod gateway;
pub mod router;
pub mod routing;
