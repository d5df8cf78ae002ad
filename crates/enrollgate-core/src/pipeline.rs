//! Collaborators invoked by the gate: the chat transport for replies, and the
//! issue-then-deliver pipeline that runs only for authorized requests.

use async_trait::async_trait;
use thiserror::Error;

use crate::identity::{CallerId, Identity};

#[derive(Error, Debug)]
pub enum IssueError {
    #[error("failed to launch issuer: {0}")]
    Launch(#[source] std::io::Error),
    #[error("issuer exited with {status}: stdout={stdout} stderr={stderr}")]
    Failed {
        status: String,
        stdout: String,
        stderr: String,
    },
    #[error("issuer returned an empty credential")]
    Empty,
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("invalid address: {0}")]
    Address(String),
    #[error("failed to build message: {0}")]
    Build(String),
    #[error("failed to read attachment {}: {source}", .path.display())]
    Attachment {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
#[error("failed to send reply: {0}")]
pub struct ReplyError(pub String);

/// Mints a credential for an identity that has already been authorized.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, identity: &Identity) -> Result<String, IssueError>;
}

/// Hands a freshly minted credential to its owner.
#[async_trait]
pub trait CredentialDelivery: Send + Sync {
    /// Deliver `credential` and return a human-readable destination
    /// (e.g. the mail address it went to).
    async fn deliver(&self, identity: &Identity, credential: &str)
        -> Result<String, DeliveryError>;
}

/// Outbound side of the chat transport.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, caller: CallerId, text: &str) -> Result<(), ReplyError>;
}

/// Failure anywhere in issue-then-deliver. Never counts against the caller.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Issue(#[from] IssueError),
    #[error(transparent)]
    Deliver(#[from] DeliveryError),
}
