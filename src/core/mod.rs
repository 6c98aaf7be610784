//! Core stay lifecycle and domain types.

/// Gateway error taxonomy.
pub mod errors;
/// The expiry ticker.
pub mod expiry;
/// The session registry owning every live stay.
pub mod registry;
/// Stay and session domain model.
pub mod stay;

pub use errors::GatewayError;
pub use expiry::ExpiryTicker;
pub use registry::{LiveStay, SessionRegistry, StayEvent, StayHandle};
pub use stay::{Protocol, SessionKind, Stay, StaySession, TerminationReason};
