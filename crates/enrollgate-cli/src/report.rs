//! Plain-text reports printed by the CLI.

use std::fmt::Write;
use std::path::Path;

use enrollgate_core::{Config, State, WindowLimit};

const REDACTED: &str = "********";

pub fn state_summary(path: &Path, state: &State, now: i64) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "state file: {}", path.display());

    let _ = writeln!(out, "banned callers ({}):", state.banned.len());
    for caller in &state.banned {
        let _ = writeln!(out, "  {caller}");
    }

    let _ = writeln!(out, "invalid attempts ({}):", state.attempts.len());
    for (caller, count) in &state.attempts {
        let _ = writeln!(out, "  {caller}: {count}");
    }

    let _ = writeln!(out, "identity requests ({}):", state.identity_requests.len());
    for (identity, history) in &state.identity_requests {
        let _ = writeln!(
            out,
            "  {identity}: {} (last {})",
            history.len(),
            last_seen(history, now)
        );
    }

    let _ = writeln!(
        out,
        "global requests: {} (last {})",
        state.global_requests.len(),
        last_seen(&state.global_requests, now)
    );
    out
}

fn last_seen(history: &[i64], now: i64) -> String {
    let Some(&last) = history.last() else {
        return "never".to_string();
    };
    let when = chrono::DateTime::from_timestamp(last, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| last.to_string());
    format!("{when}, {}s ago", now.saturating_sub(last).max(0))
}

pub fn config_summary(config: &Config) -> String {
    let mut out = String::new();
    let mut line = |key: &str, value: &dyn std::fmt::Display| {
        let _ = writeln!(out, "{key:<38} {value}");
    };

    line("TELEGRAM_BOT_TOKEN", &REDACTED);
    line("TELEGRAM_ALLOWED_CHAT_IDS", &id_list(&config.allowed_chat_ids));
    line("TELEGRAM_ADMIN_CHAT_IDS", &id_list(&config.admin_chat_ids));

    line("LDAP_SERVER", &config.ldap.server);
    line("LDAP_BIND_DN", &config.ldap.bind_dn);
    line("LDAP_BIND_PASSWORD", &REDACTED);
    line("LDAP_BASE_DN", &config.ldap.base_dn);
    line("LDAP_GROUP_DN", &config.ldap.group_dn);
    line("LDAP_NESTED_GROUPS", &config.ldap.nested_groups);
    line("LDAP_TIMEOUT_SECS", &config.ldap.timeout.as_secs());

    line("BOT_RATE_LIMIT", &limit(&config.identity_limit));
    line("BOT_GLOBAL_RATE_LIMIT", &limit(&config.global_limit));
    line("BOT_STATE_FILE", &config.state_file.display());
    line("BOT_MAX_CONCURRENT_REQUESTS", &config.max_concurrent_requests);

    line("SMTP_HOST", &config.smtp.host);
    line("SMTP_PORT", &config.smtp.port);
    line("SMTP_USER", &config.smtp.user);
    line("SMTP_PASS", &REDACTED);
    line("SMTP_FROM", &config.smtp.from);
    line("SMTP_TLS", &config.smtp.starttls);
    line("SMTP_SSL", &config.smtp.ssl);
    line("SMTP_TIMEOUT", &config.smtp.timeout.as_secs());
    line("USER_EMAIL_DOMAIN", &config.user_email_domain);
    line("CLIENT_DIR", &config.client_dir.display());

    line("ZITI_COMPOSE_DIR", &config.issuer.compose_dir.display());
    line("ZITI_CONTROLLER_SERVICE", &config.issuer.controller_service);
    line("ZITI_IDENTITY_ROLE", &config.issuer.identity_role);
    out
}

fn id_list<'a>(ids: impl IntoIterator<Item = &'a i64>) -> String {
    let ids: Vec<String> = ids.into_iter().map(i64::to_string).collect();
    if ids.is_empty() {
        "(none)".to_string()
    } else {
        ids.join(",")
    }
}

fn limit(limit: &WindowLimit) -> String {
    if limit.is_enabled() {
        format!("{} per {}s", limit.max, limit.window_secs)
    } else {
        "disabled".to_string()
    }
}
