//! Admission control for enrollment-token issuance.
//!
//! Every inbound request carries a caller id and a requested directory
//! identity. [`gate::AccessGate`] decides whether the request may reach the
//! credential issuer, consulting the persistent ban list and attempt counters
//! ([`state`]), two sliding-window rate limits ([`rate_limiter`]) and the
//! directory ([`directory`]).

pub mod config;
pub mod directory;
pub mod gate;
pub mod identity;
pub mod pipeline;
pub mod rate_limiter;
pub mod state;

pub use config::{Config, ConfigError};
pub use directory::{
    AccountEntry, DirectoryConnector, DirectoryError, DirectoryResolver, DirectorySession,
    Membership,
};
pub use gate::{AccessGate, GatePolicy, Outcome, Verdict};
pub use identity::{CallerId, Identity};
pub use pipeline::{
    CredentialDelivery, CredentialIssuer, DeliveryError, IssueError, PipelineError, ReplyError,
    ReplySink,
};
pub use rate_limiter::WindowLimit;
pub use state::{State, StateError, StateStore};
