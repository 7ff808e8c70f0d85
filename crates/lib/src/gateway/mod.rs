//! Gateway: HTTP + WebSocket control plane and the Teams webhook.
//!
//! Single port serves HTTP and WebSocket. Protocol: first frame must be `connect`;
//! then requests (req/res) and events. Inbound channel events are handled in
//! per-conversation lanes.

mod lanes;
mod protocol;
mod server;

pub use lanes::{LaneHandler, Lanes};
pub use protocol::{
    ChatParams, ConnectAuth, ConnectClient, ConnectParams, HelloOk, HelloPolicy, ResetParams,
    SendParams, WsRequest, WsResponse,
};
pub use server::{app, build_state, run_gateway, GatewayState, GATEWAY_CHANNEL_ID};
