use std::collections::BTreeSet;

use crate::directory::DirectoryResolver;
use crate::identity::{CallerId, Identity};
use crate::pipeline::{CredentialDelivery, CredentialIssuer, PipelineError, ReplySink};
use crate::rate_limiter::WindowLimit;
use crate::state::StateStore;

/// Invalid submissions (counted since the last valid one) that trigger a ban.
pub const BAN_THRESHOLD: u32 = 2;

pub const BANNED_MESSAGE: &str = "Access to credential issuance for this account is blocked.";
pub const NOT_ALLOWED_MESSAGE: &str = "Access denied.";
/// Shared by malformed input and failed directory checks so the two cannot
/// be told apart.
pub const INVALID_ACCESS_WARNING: &str = "Access denied: the user is not in the permitted \
     directory group or the account is disabled.";
pub const RATE_LIMITED_MESSAGE: &str = "Too many requests. Try again later.";
pub const DIRECTORY_FAILURE_MESSAGE: &str = "Failed to validate username. Try again later.";
pub const PROCESSING_MESSAGE: &str = "Processing your request...";
pub const PIPELINE_FAILURE_MESSAGE: &str = "Failed to send enrollment token. Try again later.";

/// Static caller policy plus rate-limit settings.
#[derive(Debug, Clone, Default)]
pub struct GatePolicy {
    /// Callers allowed to use the bot. Empty means everyone.
    pub allowed_callers: BTreeSet<CallerId>,
    /// Callers exempt from bans, rate limits and strike counting.
    pub admin_callers: BTreeSet<CallerId>,
    pub identity_limit: WindowLimit,
    pub global_limit: WindowLimit,
}

impl GatePolicy {
    pub fn is_admin(&self, caller: CallerId) -> bool {
        self.admin_callers.contains(&caller)
    }

    pub fn is_allowed(&self, caller: CallerId) -> bool {
        self.allowed_callers.is_empty() || self.allowed_callers.contains(&caller)
    }
}

/// Admission decision for a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Authorized: the issuer pipeline may run for this identity.
    Proceed(Identity),
    /// Caller was already banned.
    Blocked,
    /// Caller is not on the allow-list.
    NotAllowed,
    /// Invalid submission below the ban threshold.
    Warned,
    /// Invalid submission that pushed the caller over the threshold.
    Banned,
    RateLimited,
    /// The directory could not be queried. No strike is recorded.
    DirectoryUnavailable,
}

impl Verdict {
    /// The text sent back to the caller for this verdict.
    pub fn reply(&self) -> &'static str {
        match self {
            Verdict::Proceed(_) => PROCESSING_MESSAGE,
            Verdict::Blocked | Verdict::Banned => BANNED_MESSAGE,
            Verdict::NotAllowed => NOT_ALLOWED_MESSAGE,
            Verdict::Warned => INVALID_ACCESS_WARNING,
            Verdict::RateLimited => RATE_LIMITED_MESSAGE,
            Verdict::DirectoryUnavailable => DIRECTORY_FAILURE_MESSAGE,
        }
    }
}

/// Final result of [`AccessGate::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Denied(Verdict),
    Delivered {
        identity: Identity,
        destination: String,
    },
    PipelineFailed(Identity),
}

/// End-to-end admission for inbound requests.
///
/// State reads and writes happen inside short [`StateStore`] critical
/// sections. The directory lookup and the issuer/delivery pipeline run with no
/// lock held, so a slow directory never stalls other callers.
pub struct AccessGate {
    policy: GatePolicy,
    store: StateStore,
    resolver: DirectoryResolver,
    issuer: Box<dyn CredentialIssuer>,
    delivery: Box<dyn CredentialDelivery>,
}

impl AccessGate {
    pub fn new(
        policy: GatePolicy,
        store: StateStore,
        resolver: DirectoryResolver,
        issuer: Box<dyn CredentialIssuer>,
        delivery: Box<dyn CredentialDelivery>,
    ) -> Self {
        Self {
            policy,
            store,
            resolver,
            issuer,
            delivery,
        }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Handle one inbound message: decide, reply, and run the pipeline when
    /// authorized.
    pub async fn handle(&self, caller: CallerId, text: &str, replies: &dyn ReplySink) -> Outcome {
        let now = chrono::Utc::now().timestamp();
        self.handle_at(caller, text, now, replies).await
    }

    pub async fn handle_at(
        &self,
        caller: CallerId,
        text: &str,
        now: i64,
        replies: &dyn ReplySink,
    ) -> Outcome {
        let verdict = self.admit_at(caller, text, now).await;
        send_reply(replies, caller, verdict.reply()).await;

        let Verdict::Proceed(identity) = verdict else {
            return Outcome::Denied(verdict);
        };

        match self.issue_and_deliver(&identity).await {
            Ok(destination) => {
                tracing::info!(caller, identity = %identity, destination = %destination, "credential delivered");
                let text = format!("Sent enrollment token to {destination}");
                send_reply(replies, caller, &text).await;
                Outcome::Delivered {
                    identity,
                    destination,
                }
            }
            Err(e) => {
                tracing::error!(caller, identity = %identity, error = %e, "credential pipeline failed");
                send_reply(replies, caller, PIPELINE_FAILURE_MESSAGE).await;
                Outcome::PipelineFailed(identity)
            }
        }
    }

    /// Decide whether a request may proceed, updating persistent state.
    pub async fn admit_at(&self, caller: CallerId, text: &str, now: i64) -> Verdict {
        let is_admin = self.policy.is_admin(caller);

        // --- Ban list ---
        if !is_admin && self.store.read(|s| s.is_banned(caller)).await {
            audit(caller, "blocked", "caller is banned");
            return Verdict::Blocked;
        }

        // --- Allow-list ---
        if !self.policy.is_allowed(caller) {
            tracing::warn!(caller, "caller not in allow-list");
            return Verdict::NotAllowed;
        }

        // --- Identity shape ---
        let Some(identity) = Identity::parse(text) else {
            audit(caller, "invalid", "malformed identity");
            return self.reject_invalid(caller, is_admin).await;
        };

        // --- Rate limits: identity first, then global, both before the directory ---
        if !is_admin {
            let identity_limit = self.policy.identity_limit;
            let global_limit = self.policy.global_limit;
            let admitted = self
                .store
                .update(|s| {
                    s.admit_identity(&identity, now, &identity_limit)
                        && s.admit_global(now, &global_limit)
                })
                .await;
            if !admitted {
                tracing::warn!(caller, identity = %identity, "rate limited");
                return Verdict::RateLimited;
            }
        }

        // --- Directory (no lock held) ---
        let membership = match self.resolver.resolve(&identity).await {
            Ok(membership) => membership,
            Err(e) => {
                tracing::error!(caller, identity = %identity, error = %e, "directory lookup failed");
                return Verdict::DirectoryUnavailable;
            }
        };

        if !membership.is_authorized() {
            audit(caller, "invalid", &format!("{identity}: {membership:?}"));
            return self.reject_invalid(caller, is_admin).await;
        }

        // --- Authorized: reset strikes unless banned in the meantime ---
        let cleared = self
            .store
            .update(|s| {
                if !is_admin && s.is_banned(caller) {
                    return false;
                }
                s.clear_attempts(caller);
                true
            })
            .await;
        if !cleared {
            audit(caller, "blocked", "banned while directory lookup was in flight");
            return Verdict::Blocked;
        }

        audit(caller, "authorized", identity.as_str());
        Verdict::Proceed(identity)
    }

    /// Record a strike and escalate to a ban at [`BAN_THRESHOLD`].
    /// Admins get the warning without a strike.
    async fn reject_invalid(&self, caller: CallerId, is_admin: bool) -> Verdict {
        if is_admin {
            return Verdict::Warned;
        }

        let verdict = self
            .store
            .update(|s| {
                if s.is_banned(caller) {
                    return Verdict::Banned;
                }
                if s.record_invalid_attempt(caller) >= BAN_THRESHOLD {
                    s.ban(caller);
                    Verdict::Banned
                } else {
                    Verdict::Warned
                }
            })
            .await;

        match verdict {
            Verdict::Banned => audit(caller, "banned", "strike threshold reached"),
            _ => audit(caller, "warned", "strike recorded"),
        }
        verdict
    }

    async fn issue_and_deliver(&self, identity: &Identity) -> Result<String, PipelineError> {
        let credential = self.issuer.issue(identity).await?;
        let destination = self.delivery.deliver(identity, &credential).await?;
        Ok(destination)
    }
}

fn audit(caller: CallerId, event: &str, detail: &str) {
    tracing::info!(target: "enrollgate::audit", caller, event, detail);
}

async fn send_reply(replies: &dyn ReplySink, caller: CallerId, text: &str) {
    if let Err(e) = replies.send(caller, text).await {
        tracing::error!(caller, error = %e, "failed to deliver reply");
    }
}
