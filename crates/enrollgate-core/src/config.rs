use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::gate::GatePolicy;
use crate::identity::CallerId;
use crate::rate_limiter::{
    WindowLimit, DEFAULT_GLOBAL_MAX, DEFAULT_GLOBAL_WINDOW_SECS, DEFAULT_IDENTITY_MAX,
    DEFAULT_IDENTITY_WINDOW_SECS,
};

/// Used when `BOT_STATE_FILE` is unset.
pub const DEFAULT_STATE_FILE: &str = "data/bot-state.json";

/// Upper bound accepted for `BOT_MAX_CONCURRENT_REQUESTS`.
pub const MAX_CONCURRENT_REQUESTS: usize = 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required config: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Directory connection and membership settings.
#[derive(Debug, Clone)]
pub struct LdapConfig {
    /// `ldap://` or `ldaps://` URL.
    pub server: String,
    pub bind_dn: String,
    pub bind_password: String,
    pub base_dn: String,
    /// DN of the group an identity must belong to.
    pub group_dn: String,
    /// Use the in-chain matching rule for transitive membership.
    pub nested_groups: bool,
    pub timeout: Duration,
}

/// Outbound mail relay settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from: String,
    /// Upgrade with STARTTLS (ignored when `ssl` is set).
    pub starttls: bool,
    /// Implicit TLS from the first byte.
    pub ssl: bool,
    pub timeout: Duration,
}

/// How enrollment tokens are minted on the controller.
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// Directory holding the compose project.
    pub compose_dir: PathBuf,
    /// Compose service running the controller CLI.
    pub controller_service: String,
    /// Role attribute assigned to newly created identities.
    pub identity_role: String,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_token: String,
    /// Chats allowed to talk to the bot. Empty means all.
    pub allowed_chat_ids: BTreeSet<CallerId>,
    /// Chats exempt from bans, rate limits and strikes.
    pub admin_chat_ids: BTreeSet<CallerId>,
    pub ldap: LdapConfig,
    pub identity_limit: WindowLimit,
    pub global_limit: WindowLimit,
    pub state_file: PathBuf,
    /// Upper bound on messages processed concurrently.
    pub max_concurrent_requests: usize,
    pub smtp: SmtpConfig,
    /// Tokens are mailed to `<identity>@<user_email_domain>`.
    pub user_email_domain: String,
    /// Extra files (client installers etc.) attached to every mail.
    pub client_dir: PathBuf,
    pub issuer: IssuerConfig,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, failing on the first invalid value
    /// or on any missing required key (all missing keys are reported together).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let mut missing = Vec::new();
        let mut required = |key: &'static str| {
            let value = env.string(key).unwrap_or_default();
            if value.is_empty() {
                missing.push(key);
            }
            value
        };

        let telegram_token = required("TELEGRAM_BOT_TOKEN");
        let smtp_host = required("SMTP_HOST");
        let smtp_user = required("SMTP_USER");
        let smtp_password = required("SMTP_PASS");
        let smtp_from = required("SMTP_FROM");
        let ldap_server = required("LDAP_SERVER");
        let ldap_bind_dn = required("LDAP_BIND_DN");
        let ldap_bind_password = required("LDAP_BIND_PASSWORD");
        let ldap_base_dn = required("LDAP_BASE_DN");
        let ldap_group_dn = required("LDAP_GROUP_DN");

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let max_concurrent_requests = env.parse("BOT_MAX_CONCURRENT_REQUESTS", 8usize)?;
        if max_concurrent_requests > MAX_CONCURRENT_REQUESTS {
            return Err(ConfigError::Invalid {
                key: "BOT_MAX_CONCURRENT_REQUESTS",
                value: max_concurrent_requests.to_string(),
            });
        }

        Ok(Self {
            telegram_token,
            allowed_chat_ids: env.chat_ids("TELEGRAM_ALLOWED_CHAT_IDS"),
            admin_chat_ids: env.chat_ids("TELEGRAM_ADMIN_CHAT_IDS"),
            ldap: LdapConfig {
                server: ldap_server,
                bind_dn: ldap_bind_dn,
                bind_password: ldap_bind_password,
                base_dn: ldap_base_dn,
                group_dn: ldap_group_dn,
                nested_groups: env.bool("LDAP_NESTED_GROUPS", true)?,
                timeout: Duration::from_secs(env.parse("LDAP_TIMEOUT_SECS", 10u64)?),
            },
            identity_limit: WindowLimit::new(
                env.parse("BOT_RATE_LIMIT_WINDOW_SECONDS", DEFAULT_IDENTITY_WINDOW_SECS)?,
                env.parse("BOT_RATE_LIMIT_MAX", DEFAULT_IDENTITY_MAX)?,
            ),
            global_limit: WindowLimit::new(
                env.parse("BOT_GLOBAL_RATE_LIMIT_WINDOW_SECONDS", DEFAULT_GLOBAL_WINDOW_SECS)?,
                env.parse("BOT_GLOBAL_RATE_LIMIT_MAX", DEFAULT_GLOBAL_MAX)?,
            ),
            state_file: env
                .string("BOT_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
            max_concurrent_requests: max_concurrent_requests.max(1),
            smtp: SmtpConfig {
                host: smtp_host,
                port: env.parse("SMTP_PORT", 587u16)?,
                user: smtp_user,
                password: smtp_password,
                from: smtp_from,
                starttls: env.bool("SMTP_TLS", true)?,
                ssl: env.bool("SMTP_SSL", false)?,
                timeout: Duration::from_secs(env.parse("SMTP_TIMEOUT", 30u64)?),
            },
            user_email_domain: env
                .string("USER_EMAIL_DOMAIN")
                .unwrap_or_else(|| "example.com".to_string()),
            client_dir: env
                .string("CLIENT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/opt/openziti-ad-telegram/clients")),
            issuer: IssuerConfig {
                compose_dir: env
                    .string("ZITI_COMPOSE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(".")),
                controller_service: env
                    .string("ZITI_CONTROLLER_SERVICE")
                    .unwrap_or_else(|| "ziti-controller".to_string()),
                identity_role: env
                    .string("ZITI_IDENTITY_ROLE")
                    .unwrap_or_else(|| "vpn-users".to_string()),
            },
        })
    }

    /// Caller policy for the gate.
    pub fn gate_policy(&self) -> GatePolicy {
        GatePolicy {
            allowed_callers: self.allowed_chat_ids.clone(),
            admin_callers: self.admin_chat_ids.clone(),
            identity_limit: self.identity_limit,
            global_limit: self.global_limit,
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Trimmed value; empty counts as unset.
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value }),
        }
    }

    fn bool(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.string(key) {
            None => Ok(default),
            Some(value) => match value.to_lowercase().as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(ConfigError::Invalid { key, value }),
            },
        }
    }

    /// Comma-separated chat ids. Malformed items are logged and skipped.
    fn chat_ids(&self, key: &str) -> BTreeSet<CallerId> {
        let Some(raw) = self.string(key) else {
            return BTreeSet::new();
        };
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .filter_map(|item| match item.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::warn!(key, item, "ignoring invalid chat id");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn required() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_USER", "bot"),
            ("SMTP_PASS", "secret"),
            ("SMTP_FROM", "bot@example.com"),
            ("LDAP_SERVER", "ldaps://dc.example.com"),
            ("LDAP_BIND_DN", "CN=svc,DC=example,DC=com"),
            ("LDAP_BIND_PASSWORD", "secret"),
            ("LDAP_BASE_DN", "DC=example,DC=com"),
            ("LDAP_GROUP_DN", "CN=VPN,DC=example,DC=com"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults() {
        let config = load(&required()).unwrap();
        assert!(config.allowed_chat_ids.is_empty());
        assert!(config.ldap.nested_groups);
        assert_eq!(config.identity_limit, WindowLimit::new(300, 3));
        assert_eq!(config.global_limit, WindowLimit::new(3600, 3));
        assert_eq!(config.smtp.port, 587);
        assert!(config.smtp.starttls);
        assert!(!config.smtp.ssl);
        assert_eq!(config.state_file, PathBuf::from(DEFAULT_STATE_FILE));
        assert_eq!(config.user_email_domain, "example.com");
        assert_eq!(config.issuer.controller_service, "ziti-controller");
    }

    #[test]
    fn test_reports_all_missing_keys() {
        let mut vars = required();
        vars.remove("TELEGRAM_BOT_TOKEN");
        vars.insert("LDAP_GROUP_DN", "   ");
        let err = load(&vars).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec!["TELEGRAM_BOT_TOKEN", "LDAP_GROUP_DN"])
        );
    }

    #[test]
    fn test_chat_id_lists_skip_garbage() {
        let mut vars = required();
        vars.insert("TELEGRAM_ALLOWED_CHAT_IDS", " 1, -1002, abc,, 3 ");
        vars.insert("TELEGRAM_ADMIN_CHAT_IDS", "42");
        let config = load(&vars).unwrap();
        assert_eq!(config.allowed_chat_ids, BTreeSet::from([1, -1002, 3]));
        assert_eq!(config.admin_chat_ids, BTreeSet::from([42]));

        let policy = config.gate_policy();
        assert!(policy.is_admin(42));
        assert!(policy.is_allowed(3));
        assert!(!policy.is_allowed(42));
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let mut vars = required();
        vars.insert("BOT_RATE_LIMIT_MAX", "0");
        vars.insert("LDAP_NESTED_GROUPS", "FALSE");
        vars.insert("SMTP_SSL", "1");
        let config = load(&vars).unwrap();
        assert!(!config.identity_limit.is_enabled());
        assert!(!config.ldap.nested_groups);
        assert!(config.smtp.ssl);

        vars.insert("SMTP_PORT", "not-a-port");
        assert_eq!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid {
                key: "SMTP_PORT",
                value: "not-a-port".to_string()
            }
        );

        vars.remove("SMTP_PORT");
        vars.insert("SMTP_TLS", "yes please");
        assert!(matches!(load(&vars), Err(ConfigError::Invalid { key: "SMTP_TLS", .. })));
    }

    #[test]
    fn test_concurrency_bounds() {
        let mut vars = required();
        vars.insert("BOT_MAX_CONCURRENT_REQUESTS", "0");
        assert_eq!(load(&vars).unwrap().max_concurrent_requests, 1);

        vars.insert("BOT_MAX_CONCURRENT_REQUESTS", "1024");
        assert_eq!(load(&vars).unwrap().max_concurrent_requests, 1024);

        vars.insert("BOT_MAX_CONCURRENT_REQUESTS", "4294967296");
        assert_eq!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid {
                key: "BOT_MAX_CONCURRENT_REQUESTS",
                value: "4294967296".to_string()
            }
        );
    }
}
