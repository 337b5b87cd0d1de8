//! Engine-side link to the interception layer.

pub mod bridge;
pub mod config;
pub mod hub;
pub mod message;
pub mod transport;

pub use bridge::HookBridge;
pub use config::HubConfig;
pub use hub::{HookAction, InterceptionHub, InterceptionPoint};
pub use message::{Decision, InterceptEvent, Listen, Pair, PhaseKind, TransportError, Verdict};
pub use transport::{channel_pair, ChannelPeer, ChannelTransport, Transport};
