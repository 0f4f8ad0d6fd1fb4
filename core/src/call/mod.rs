//! Call negotiation
//!
//! One [`CallEngine`] per logged-in user owns at most one [`CallSession`] at a
//! time and drives it through
//! `Idle → AwaitingLocalMedia → Negotiating → Active → Ended`.

pub mod buffer;
pub mod clock;
pub mod engine;
pub mod error;
pub mod events;
pub mod session;

pub use buffer::{BufferError, SignalBuffer};
pub use clock::{Clock, SystemClock};
pub use engine::CallEngine;
pub use error::{CallError, CallErrorKind};
pub use events::CallEvent;
pub use session::{CallRole, CallSession, CallSnapshot, CallStatus, SessionId};
