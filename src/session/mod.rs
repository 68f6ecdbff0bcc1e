//! Security session cache.
//!
//! Sessions let a peer pair skip authentication and negotiation for a
//! bounded time. Both sides cache the same session id: the acceptor when it
//! answers a new-session request, the initiator when it reads the
//! acceptor's session info.
//!
//! ```text
//!                 ┌──────────────────── SessionService ────────────────────┐
//!                 │  RwLock ┌──────────────┐   ┌───────────────────────┐   │
//! resume(peer,cmd)├────────►│ CommandIndex │──►│ SessionStore          │   │
//!                 │         │ {peer,<cmd>} │   │ id → SessionEntry     │   │
//!                 │         └──────────────┘   └───────────────────────┘   │
//!                 │  Mutex  ┌───────────────────────────────────────────┐  │
//! begin(key)      ├────────►│ PendingBootstraps: key → [waiters...]     │  │
//!                 │         └───────────────────────────────────────────┘  │
//!                 └────────────────────────────────────────────────────────┘
//! ```

mod bootstrap;
mod entry;
mod export;
mod index;
mod service;
mod store;

pub use bootstrap::{
    BootstrapGuard, BootstrapOutcome, BootstrapTicket, BootstrapWaiter, PendingBootstraps,
};
pub use entry::SessionEntry;
pub use export::{export_session_info, import_session_info};
pub use index::{session_key, CommandSessionIndex};
pub use service::{CachedSession, NonNegotiatedSession, SessionService, SessionSummary};
pub use store::{SessionStore, StoreError};
