//! In-process relay
//!
//! Stands in for the remote chat service: users register, get an inbox of
//! pushed signals and chat notifications, and talk to each other through
//! [`LoopbackTransport`] and [`LoopbackChatService`]. Delivery is immediate
//! and per-sender ordered, like the real service's push channel.

pub mod loopback;

pub use loopback::{LoopbackChatService, LoopbackRelay, LoopbackTransport, RelayInbox, RelayStats};
