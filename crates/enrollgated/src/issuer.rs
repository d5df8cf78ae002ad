//! Enrollment-token issuer backed by the OpenZiti controller CLI running in a
//! compose service.

use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use enrollgate_core::config::IssuerConfig;
use enrollgate_core::{CredentialIssuer, Identity, IssueError};
use regex::Regex;
use tokio::process::Command;

/// Where the controller container writes enrollment JWTs.
const ENROLLMENT_DIR: &str = "/persistent/enrollments";

fn jwt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"eyJ[0-9A-Za-z_-]+\.[0-9A-Za-z_-]+\.[0-9A-Za-z_-]+").expect("JWT pattern is valid")
    })
}

/// Creates the identity (or a fresh one-time enrollment for an existing one)
/// via `docker compose exec` and returns the enrollment JWT.
pub struct ZitiIssuer {
    config: IssuerConfig,
}

impl ZitiIssuer {
    pub fn new(config: IssuerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CredentialIssuer for ZitiIssuer {
    async fn issue(&self, identity: &Identity) -> Result<String, IssueError> {
        let script = enrollment_script(identity, &self.config.identity_role);

        tracing::info!(identity = %identity, service = %self.config.controller_service, "issuing enrollment token");
        let output = Command::new("docker")
            .args(["compose", "exec", "-T"])
            .arg(&self.config.controller_service)
            .args(["bash", "-lc"])
            .arg(&script)
            .current_dir(&self.config.compose_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(IssueError::Launch)?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            return Err(IssueError::Failed {
                status: output.status.to_string(),
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        extract_token(&stdout)
    }
}

/// Shell script run inside the controller container.
///
/// `identity` has passed the shape check, so it contains no quoting or shell
/// metacharacters. `role` comes from operator config.
fn enrollment_script(identity: &Identity, role: &str) -> String {
    let jwt_path = format!("{ENROLLMENT_DIR}/{identity}.jwt");
    let create = format!(r#"ziti edge create identity "{identity}" -a "{role}" -o "{jwt_path}" >/dev/null"#);
    [
        "set -e;".to_string(),
        " export PATH=/var/openziti/ziti-bin:$PATH;".to_string(),
        r#" CONTROLLER_URL="https://${ZITI_CTRL_EDGE_ADVERTISED_ADDRESS}:${ZITI_CTRL_EDGE_ADVERTISED_PORT}";"#
            .to_string(),
        r#" ziti edge login "$CONTROLLER_URL" -u "$ZITI_USER" -p "$ZITI_PWD" -y >/dev/null;"#.to_string(),
        format!(" {create}"),
        " || (".to_string(),
        format!(r#" ziti edge create enrollment ott --identity "{identity}" -o "{jwt_path}" >/dev/null"#),
        format!(r#" || ziti edge create enrollment ott "{identity}" -o "{jwt_path}" >/dev/null"#),
        format!(r#" || (ziti edge delete identity "{identity}" >/dev/null && {create})"#),
        " );".to_string(),
        format!(r#" cat "{jwt_path}""#),
    ]
    .concat()
}

/// First JWT-looking token in the output, else the whole (trimmed) output.
fn extract_token(stdout: &str) -> Result<String, IssueError> {
    if let Some(m) = jwt_re().find(stdout) {
        return Ok(m.as_str().to_string());
    }
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(IssueError::Empty);
    }
    Ok(trimmed.to_string())
}
