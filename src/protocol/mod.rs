//! Security negotiation protocol.
//!
//! # Command flow
//!
//! ```text
//! Initiator                                   Acceptor
//!    │                                           │
//!    │── DC_AUTHENTICATE ──────────────────────► │  (negotiation sentinel)
//!    │── declared policy record ───────────────► │
//!    │                                           │  reconcile
//!    │◄──────────────────── decided policy ──────│  (unless Enact = YES)
//!    │                                           │
//!    │◄═══════════ authenticator rounds ════════►│  (new session, auth YES)
//!    │                                           │
//!    │         encryption / integrity on         │
//!    │                                           │
//!    │◄──────────────── session info ────────────│  (new session only)
//!    │                                           │
//!    │══════════════ command payload ═══════════►│  dispatch
//! ```
//!
//! A resumed session sends a short `UseSession = YES` record and skips every
//! round trip. With negotiation off the initiator sends only the bare
//! command number.

mod acceptor;
mod initiator;
mod policy;
mod reconcile;
mod record;

pub use acceptor::{AcceptOutcome, CommandAcceptor, SessionNotFoundNotice};
pub use initiator::{CommandInitiator, CommandOutcome, CommandRequest, DatagramCommand};
pub use policy::{Feature, FeatureDecision, RequirementLevel, SecurityPolicy};
pub use reconcile::{
    reconcile, reconcile_duration, reconcile_feature, reconcile_lease, reconcile_method_lists,
    DecidedPolicy, ReconcileError,
};
pub use record::{attr, split_list, AttrValue, NegotiationRecord, ReturnCode};

/// Negotiation sentinel and establish-session no-op
pub const DC_AUTHENTICATE: u32 = 60010;

/// Session-not-found notice
pub const DC_INVALIDATE_KEY: u32 = 60011;

/// Decision-only probe
pub const DC_SEC_QUERY: u32 = 60040;

/// Version string sent as `RemoteVersion`
pub const PROTOCOL_VERSION: &str = concat!("$SecMan: ", env!("CARGO_PKG_VERSION"), " $");
