//! Camera control over VISCA.
//!
//! - `visca`: command encoding, reply parsing and stream framing
//! - `session`: the exclusively owned control connection and its state machine

pub mod session;
pub mod visca;

pub use session::{ControlConfig, ControlSession, RecallOutcome, SessionState};
pub use visca::{ViscaCommand, ViscaErrorCode, ViscaReply};
