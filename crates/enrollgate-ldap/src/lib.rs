//! LDAP / Active Directory backend for [`enrollgate_core::DirectoryResolver`].
//!
//! Each resolution opens one connection, binds with the service account,
//! runs the account search (and the in-chain membership search when enabled)
//! and unbinds.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use enrollgate_core::config::LdapConfig;
use enrollgate_core::directory::MATCHING_RULE_IN_CHAIN;
use enrollgate_core::{
    AccountEntry, DirectoryConnector, DirectoryError, DirectoryResolver, DirectorySession, Identity,
};
use ldap3::{ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};

const ACCOUNT_CONTROL_ATTR: &str = "userAccountControl";
const MEMBER_OF_ATTR: &str = "memberOf";
/// Request no attributes; only the presence of an entry matters.
const NO_ATTRS: &str = "1.1";

/// Opens bound sessions against an LDAP server.
pub struct LdapConnector {
    url: String,
    bind_dn: String,
    bind_password: String,
    base_dn: String,
    timeout: Duration,
}

impl LdapConnector {
    pub fn new(config: &LdapConfig) -> Self {
        Self {
            url: config.server.clone(),
            bind_dn: config.bind_dn.clone(),
            bind_password: config.bind_password.clone(),
            base_dn: config.base_dn.clone(),
            timeout: config.timeout,
        }
    }
}

/// Build a resolver for `config`. `require_group = false` skips the group
/// check entirely (enabled accounts are members).
pub fn resolver(config: &LdapConfig, require_group: bool) -> DirectoryResolver {
    let group_dn = require_group.then(|| config.group_dn.clone());
    DirectoryResolver::new(
        Box::new(LdapConnector::new(config)),
        group_dn,
        config.nested_groups,
    )
}

#[async_trait]
impl DirectoryConnector for LdapConnector {
    async fn connect(&self) -> Result<Box<dyn DirectorySession>, DirectoryError> {
        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.url)
            .await
            .map_err(|e| DirectoryError::Connect(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                tracing::warn!(error = %e, "LDAP connection closed with error");
            }
        });

        ldap.with_timeout(self.timeout)
            .simple_bind(&self.bind_dn, &self.bind_password)
            .await
            .and_then(|res| res.success())
            .map_err(|e| DirectoryError::Bind(e.to_string()))?;

        tracing::debug!(url = %self.url, "LDAP bind ok");
        Ok(Box::new(LdapSession {
            ldap,
            base_dn: self.base_dn.clone(),
            timeout: self.timeout,
        }))
    }
}

struct LdapSession {
    ldap: Ldap,
    base_dn: String,
    timeout: Duration,
}

impl LdapSession {
    async fn search(
        &mut self,
        filter: &str,
        attrs: Vec<&str>,
    ) -> Result<Vec<SearchEntry>, DirectoryError> {
        let (entries, _) = self
            .ldap
            .with_timeout(self.timeout)
            .search(&self.base_dn, Scope::Subtree, filter, attrs)
            .await
            .and_then(|res| res.success())
            .map_err(|e| DirectoryError::Search(e.to_string()))?;
        Ok(entries.into_iter().map(SearchEntry::construct).collect())
    }
}

#[async_trait]
impl DirectorySession for LdapSession {
    async fn find_account(
        &mut self,
        identity: &Identity,
    ) -> Result<Option<AccountEntry>, DirectoryError> {
        let filter = account_filter(identity);
        let entries = self
            .search(&filter, vec![ACCOUNT_CONTROL_ATTR, MEMBER_OF_ATTR])
            .await?;
        Ok(entries.first().map(|entry| account_from_attrs(&entry.attrs)))
    }

    async fn is_nested_member(
        &mut self,
        identity: &Identity,
        group_dn: &str,
    ) -> Result<bool, DirectoryError> {
        let filter = nested_member_filter(identity, group_dn);
        let entries = self.search(&filter, vec![NO_ATTRS]).await?;
        Ok(!entries.is_empty())
    }

    async fn close(&mut self) {
        if let Err(e) = self.ldap.unbind().await {
            tracing::debug!(error = %e, "LDAP unbind failed");
        }
    }
}

fn account_filter(identity: &Identity) -> String {
    format!(
        "(&(objectClass=user)(sAMAccountName={}))",
        ldap_escape(identity.as_str())
    )
}

fn nested_member_filter(identity: &Identity, group_dn: &str) -> String {
    format!(
        "(&(objectClass=user)(sAMAccountName={})({}:{}:={}))",
        ldap_escape(identity.as_str()),
        MEMBER_OF_ATTR,
        MATCHING_RULE_IN_CHAIN,
        ldap_escape(group_dn.trim())
    )
}

/// Attribute names are case-insensitive in LDAP.
fn attr_values<'a>(attrs: &'a HashMap<String, Vec<String>>, name: &str) -> &'a [String] {
    attrs
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, values)| values.as_slice())
        .unwrap_or_default()
}

fn account_from_attrs(attrs: &HashMap<String, Vec<String>>) -> AccountEntry {
    let account_control = attr_values(attrs, ACCOUNT_CONTROL_ATTR)
        .first()
        .and_then(|v| v.trim().parse::<i64>().ok());
    AccountEntry {
        account_control,
        member_of: attr_values(attrs, MEMBER_OF_ATTR).to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: Vec<(&str, Vec<&str>)>) -> HashMap<String, Vec<String>> {
        pairs
            .into_iter()
            .map(|(k, vs)| (k.to_string(), vs.into_iter().map(String::from).collect()))
            .collect()
    }

    #[test]
    fn test_account_filter() {
        let id = Identity::parse("j.doe").unwrap();
        assert_eq!(account_filter(&id), "(&(objectClass=user)(sAMAccountName=j.doe))");
    }

    #[test]
    fn test_nested_filter_escapes_group_dn() {
        let id = Identity::parse("alice").unwrap();
        let filter = nested_member_filter(&id, " CN=VPN (EU),DC=corp ");
        assert_eq!(
            filter,
            "(&(objectClass=user)(sAMAccountName=alice)\
             (memberOf:1.2.840.113556.1.4.1941:=CN=VPN \\28EU\\29,DC=corp))"
        );
    }

    #[test]
    fn test_account_from_attrs() {
        let entry = account_from_attrs(&attrs(vec![
            ("useraccountcontrol", vec!["512"]),
            ("memberOf", vec!["CN=VPN,DC=corp", "CN=Staff,DC=corp"]),
        ]));
        assert_eq!(entry.account_control, Some(512));
        assert!(entry.is_enabled());
        assert_eq!(entry.member_of.len(), 2);
    }

    #[test]
    fn test_account_from_attrs_disabled_and_garbage() {
        let disabled = account_from_attrs(&attrs(vec![("userAccountControl", vec!["514"])]));
        assert!(!disabled.is_enabled());
        assert!(disabled.member_of.is_empty());

        let garbage = account_from_attrs(&attrs(vec![("userAccountControl", vec!["n/a"])]));
        assert_eq!(garbage.account_control, None);
        assert!(!garbage.is_enabled());
    }

    #[test]
    fn test_resolver_without_group() {
        let config = LdapConfig {
            server: "ldap://localhost".to_string(),
            bind_dn: String::new(),
            bind_password: String::new(),
            base_dn: "DC=corp".to_string(),
            group_dn: "CN=VPN,DC=corp".to_string(),
            nested_groups: true,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(resolver(&config, true).group_dn(), Some("CN=VPN,DC=corp"));
        assert!(resolver(&config, false).group_dn().is_none());
    }
}
