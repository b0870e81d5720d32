// lib.rs - Call-session engine for a SIP-over-WebSocket softphone

#[path = "call.rs"]
mod call;
#[path = "command.rs"]
mod command;
#[path = "config.rs"]
mod config;
#[path = "core.rs"]
mod core;
#[path = "media.rs"]
mod media;
#[path = "message.rs"]
mod message;
#[path = "sdp.rs"]
mod sdp;
#[path = "transport.rs"]
mod transport;

pub mod event_system;

#[cfg(test)]
#[path = "testing.rs"]
mod testing;

// Re-export core types
pub use crate::call::*;
pub use crate::command::*;
pub use crate::config::*;
pub use crate::core::*;
pub use crate::event_system::*;
pub use crate::media::*;
pub use crate::message::*;
pub use crate::sdp::*;
pub use crate::transport::*;

// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        // Sessions
        CallDirection,
        CallId,
        CallParkResult,
        CallSession,
        CallState,
        SessionEvent,

        // Collaborators
        EventBus,
        MediaEngine,
        SignalingClient,

        // Configuration
        SessionConfig,

        // Core types
        Result,
        SessionError,
        SipMessage,
        SipMethod,
    };
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
