//! Directory membership resolution.
//!
//! [`DirectoryResolver`] answers one question per identity: does the account
//! exist, is it enabled, and is it a member of the required group. The wire
//! protocol lives behind [`DirectoryConnector`] / [`DirectorySession`] so the
//! resolution rules can be exercised without a directory server.

use async_trait::async_trait;
use thiserror::Error;

use crate::identity::Identity;

/// `userAccountControl` bit marking a disabled account.
pub const ACCOUNT_DISABLED_FLAG: i64 = 0x2;

/// Active Directory matching rule for transitive ("in chain") membership.
pub const MATCHING_RULE_IN_CHAIN: &str = "1.2.840.113556.1.4.1941";

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("directory connection failed: {0}")]
    Connect(String),
    #[error("directory bind failed: {0}")]
    Bind(String),
    #[error("directory search failed: {0}")]
    Search(String),
}

/// Outcome of a membership check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    NotFound,
    Disabled,
    EnabledNotMember,
    EnabledMember,
}

impl Membership {
    pub fn is_authorized(self) -> bool {
        self == Membership::EnabledMember
    }
}

/// The attributes of an account entry the resolver needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountEntry {
    /// Raw account-control flags; `None` when absent or unparseable.
    pub account_control: Option<i64>,
    /// Distinguished names of the groups the account is a direct member of.
    pub member_of: Vec<String>,
}

impl AccountEntry {
    /// Accounts without a readable control value are treated as disabled.
    pub fn is_enabled(&self) -> bool {
        matches!(self.account_control, Some(flags) if flags & ACCOUNT_DISABLED_FLAG == 0)
    }

    /// Case-insensitive exact match of `group_dn` against direct memberships.
    pub fn is_direct_member_of(&self, group_dn: &str) -> bool {
        let target = group_dn.trim().to_lowercase();
        self.member_of
            .iter()
            .any(|dn| dn.trim().to_lowercase() == target)
    }
}

/// An open, authenticated directory session.
#[async_trait]
pub trait DirectorySession: Send {
    /// Look up the account named `identity`. `Ok(None)` when nothing matches.
    async fn find_account(&mut self, identity: &Identity)
        -> Result<Option<AccountEntry>, DirectoryError>;

    /// Ask the server whether `identity` is a transitive member of `group_dn`.
    ///
    /// `Ok(false)` means the query ran and matched nothing; only `Err` means
    /// the server could not execute it.
    async fn is_nested_member(
        &mut self,
        identity: &Identity,
        group_dn: &str,
    ) -> Result<bool, DirectoryError>;

    /// Release the session. Failures are not interesting to callers.
    async fn close(&mut self) {}
}

/// Factory for [`DirectorySession`]s; one session per resolution.
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DirectorySession>, DirectoryError>;
}

/// Membership rules applied on top of a [`DirectoryConnector`].
pub struct DirectoryResolver {
    connector: Box<dyn DirectoryConnector>,
    group_dn: Option<String>,
    nested_groups: bool,
}

impl DirectoryResolver {
    pub fn new(
        connector: Box<dyn DirectoryConnector>,
        group_dn: Option<String>,
        nested_groups: bool,
    ) -> Self {
        let group_dn = group_dn
            .map(|dn| dn.trim().to_string())
            .filter(|dn| !dn.is_empty());
        Self {
            connector,
            group_dn,
            nested_groups,
        }
    }

    pub fn group_dn(&self) -> Option<&str> {
        self.group_dn.as_deref()
    }

    /// Resolve `identity` to a [`Membership`].
    ///
    /// Fails only on transport problems (connect, bind, or the account search
    /// itself). A failing nested-membership query falls back to the account's
    /// direct group list instead.
    pub async fn resolve(&self, identity: &Identity) -> Result<Membership, DirectoryError> {
        let mut session = self.connector.connect().await?;
        let result = self.resolve_in(session.as_mut(), identity).await;
        session.close().await;
        result
    }

    async fn resolve_in(
        &self,
        session: &mut dyn DirectorySession,
        identity: &Identity,
    ) -> Result<Membership, DirectoryError> {
        let Some(entry) = session.find_account(identity).await? else {
            return Ok(Membership::NotFound);
        };

        if !entry.is_enabled() {
            return Ok(Membership::Disabled);
        }

        let Some(group_dn) = self.group_dn.as_deref() else {
            return Ok(Membership::EnabledMember);
        };

        if self.nested_groups {
            match session.is_nested_member(identity, group_dn).await {
                Ok(true) => return Ok(Membership::EnabledMember),
                Ok(false) => return Ok(Membership::EnabledNotMember),
                Err(e) => {
                    tracing::warn!(
                        identity = %identity,
                        error = %e,
                        "nested group query failed, falling back to direct memberOf"
                    );
                }
            }
        }

        if entry.is_direct_member_of(group_dn) {
            Ok(Membership::EnabledMember)
        } else {
            Ok(Membership::EnabledNotMember)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// How a fake directory answers the nested-membership query.
    #[derive(Debug, Clone, Copy)]
    pub enum Nested {
        Member,
        NotMember,
        Unsupported,
    }

    /// In-memory directory keyed by identity.
    #[derive(Clone, Default)]
    pub struct FakeDirectory {
        pub accounts: HashMap<String, (AccountEntry, Option<Nested>)>,
        pub unreachable: bool,
        pub nested_calls: Arc<AtomicUsize>,
        pub sessions_closed: Arc<AtomicUsize>,
    }

    impl FakeDirectory {
        pub fn with_account(mut self, name: &str, entry: AccountEntry, nested: Option<Nested>) -> Self {
            self.accounts.insert(name.to_string(), (entry, nested));
            self
        }

        pub fn member(self, name: &str) -> Self {
            self.with_account(name, enabled(&[]), Some(Nested::Member))
        }

        pub fn non_member(self, name: &str) -> Self {
            self.with_account(name, enabled(&[]), Some(Nested::NotMember))
        }

        pub fn nested_calls(&self) -> usize {
            self.nested_calls.load(Ordering::SeqCst)
        }
    }

    pub fn enabled(groups: &[&str]) -> AccountEntry {
        AccountEntry {
            account_control: Some(0x200),
            member_of: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    struct FakeSession(FakeDirectory);

    #[async_trait]
    impl DirectorySession for FakeSession {
        async fn find_account(
            &mut self,
            identity: &Identity,
        ) -> Result<Option<AccountEntry>, DirectoryError> {
            Ok(self.0.accounts.get(identity.as_str()).map(|(e, _)| e.clone()))
        }

        async fn is_nested_member(
            &mut self,
            identity: &Identity,
            _group_dn: &str,
        ) -> Result<bool, DirectoryError> {
            self.0.nested_calls.fetch_add(1, Ordering::SeqCst);
            match self.0.accounts.get(identity.as_str()).and_then(|(_, n)| *n) {
                Some(Nested::Member) => Ok(true),
                Some(Nested::NotMember) | None => Ok(false),
                Some(Nested::Unsupported) => Err(DirectoryError::Search(
                    "unavailableCriticalExtension".to_string(),
                )),
            }
        }

        async fn close(&mut self) {
            self.0.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DirectoryConnector for FakeDirectory {
        async fn connect(&self) -> Result<Box<dyn DirectorySession>, DirectoryError> {
            if self.unreachable {
                return Err(DirectoryError::Connect("connection refused".to_string()));
            }
            Ok(Box::new(FakeSession(self.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    const GROUP: &str = "CN=VPN Users,OU=Groups,DC=corp,DC=example";

    fn resolver(dir: &FakeDirectory, group: Option<&str>, nested: bool) -> DirectoryResolver {
        DirectoryResolver::new(Box::new(dir.clone()), group.map(String::from), nested)
    }

    fn id(name: &str) -> Identity {
        Identity::parse(name).unwrap()
    }

    #[tokio::test]
    async fn test_not_found() {
        let dir = FakeDirectory::default();
        let r = resolver(&dir, Some(GROUP), true);
        assert_eq!(r.resolve(&id("ghost")).await.unwrap(), Membership::NotFound);
    }

    #[tokio::test]
    async fn test_disabled_short_circuits_group_check() {
        let entry = AccountEntry {
            account_control: Some(0x202),
            member_of: vec![GROUP.to_string()],
        };
        let dir = FakeDirectory::default().with_account("alice", entry, Some(Nested::Member));

        for group in [Some(GROUP), None] {
            let r = resolver(&dir, group, true);
            assert_eq!(r.resolve(&id("alice")).await.unwrap(), Membership::Disabled);
        }
        assert_eq!(dir.nested_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_account_control_counts_as_disabled() {
        let entry = AccountEntry {
            account_control: None,
            member_of: vec![GROUP.to_string()],
        };
        let dir = FakeDirectory::default().with_account("alice", entry, None);
        let r = resolver(&dir, Some(GROUP), false);
        assert_eq!(r.resolve(&id("alice")).await.unwrap(), Membership::Disabled);
    }

    #[tokio::test]
    async fn test_no_group_configured_means_member() {
        let dir = FakeDirectory::default().with_account("alice", enabled(&[]), None);
        let r = resolver(&dir, Some("   "), true);
        assert!(r.group_dn().is_none());
        assert_eq!(r.resolve(&id("alice")).await.unwrap(), Membership::EnabledMember);
        assert_eq!(dir.nested_calls(), 0);
    }

    #[tokio::test]
    async fn test_nested_member() {
        let dir = FakeDirectory::default().member("alice");
        let r = resolver(&dir, Some(GROUP), true);
        assert_eq!(r.resolve(&id("alice")).await.unwrap(), Membership::EnabledMember);
    }

    #[tokio::test]
    async fn test_nested_empty_result_is_authoritative() {
        // Direct memberOf would match, but the nested answer must win.
        let dir = FakeDirectory::default().with_account(
            "alice",
            enabled(&[GROUP]),
            Some(Nested::NotMember),
        );
        let r = resolver(&dir, Some(GROUP), true);
        assert_eq!(
            r.resolve(&id("alice")).await.unwrap(),
            Membership::EnabledNotMember
        );
        assert_eq!(dir.nested_calls(), 1);
    }

    #[tokio::test]
    async fn test_nested_failure_falls_back_to_direct_membership() {
        let lower = GROUP.to_lowercase();
        let dir = FakeDirectory::default()
            .with_account("alice", enabled(&[lower.as_str()]), Some(Nested::Unsupported))
            .with_account("bob", enabled(&["CN=Other,DC=corp"]), Some(Nested::Unsupported));
        let r = resolver(&dir, Some(GROUP), true);

        assert_eq!(r.resolve(&id("alice")).await.unwrap(), Membership::EnabledMember);
        assert_eq!(r.resolve(&id("bob")).await.unwrap(), Membership::EnabledNotMember);
    }

    #[tokio::test]
    async fn test_flat_mode_skips_nested_query() {
        let dir = FakeDirectory::default()
            .with_account("alice", enabled(&[GROUP]), Some(Nested::NotMember));
        let r = resolver(&dir, Some(GROUP), false);
        assert_eq!(r.resolve(&id("alice")).await.unwrap(), Membership::EnabledMember);
        assert_eq!(dir.nested_calls(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_error() {
        let dir = FakeDirectory {
            unreachable: true,
            ..Default::default()
        };
        let r = resolver(&dir, Some(GROUP), true);
        assert!(matches!(
            r.resolve(&id("alice")).await,
            Err(DirectoryError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn test_session_is_closed() {
        let dir = FakeDirectory::default().member("alice");
        let r = resolver(&dir, Some(GROUP), true);
        r.resolve(&id("alice")).await.unwrap();
        r.resolve(&id("nobody")).await.unwrap();
        assert_eq!(dir.sessions_closed.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_direct_membership_is_case_insensitive_exact() {
        let entry = enabled(&["cn=vpn users,ou=groups,dc=corp,dc=example"]);
        assert!(entry.is_direct_member_of(GROUP));
        assert!(!entry.is_direct_member_of("CN=VPN Users"));
    }
}
