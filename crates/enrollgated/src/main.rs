use std::sync::Arc;

use anyhow::{Context, Result};
use enrollgate_core::{AccessGate, Config, StateStore};
use tracing_subscriber::EnvFilter;

mod bot;
mod issuer;
mod mailer;
mod telegram;

use issuer::ZitiIssuer;
use mailer::SmtpDelivery;
use telegram::TelegramClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("enrollgated starting");

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(
        allowed = config.allowed_chat_ids.len(),
        admins = config.admin_chat_ids.len(),
        ldap = %config.ldap.server,
        group = %config.ldap.group_dn,
        nested_groups = config.ldap.nested_groups,
        state_file = %config.state_file.display(),
        max_concurrent = config.max_concurrent_requests,
        "configuration loaded"
    );

    let store = StateStore::open(&config.state_file);
    let gate = Arc::new(AccessGate::new(
        config.gate_policy(),
        store,
        enrollgate_ldap::resolver(&config.ldap, true),
        Box::new(ZitiIssuer::new(config.issuer.clone())),
        Box::new(SmtpDelivery::new(
            config.smtp.clone(),
            config.user_email_domain.clone(),
            config.client_dir.clone(),
        )),
    ));

    let client = TelegramClient::new(config.telegram_token.clone())
        .context("failed to build Telegram client")?;
    let me = client.get_me().await.context("Telegram getMe failed")?;
    tracing::info!(bot_id = me.id, username = ?me.username, "enrollgated ready");

    bot::run(gate, client, config.max_concurrent_requests, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    })
    .await?;

    tracing::info!("enrollgated shutting down");
    Ok(())
}
