//! Identifiers and the few fixed byte sequences the relay speaks.
//!
//! The tunnel itself carries no framing: every byte a public caller sends is
//! relayed verbatim. The only bytes the relay ever originates are the
//! unavailable response written when no tunnel is idle.
//!
//! - [`SessionId`] / [`SessionCounter`] - process-scoped session numbering
//! - [`SlotId`] - position of a worker in the agent's pool
//! - [`unavailable_response`] - the fail-fast reply

mod ids;
mod messages;

pub use ids::*;
pub use messages::*;
