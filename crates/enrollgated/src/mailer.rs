//! Mail delivery of enrollment tokens.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use enrollgate_core::config::SmtpConfig;
use enrollgate_core::{CredentialDelivery, DeliveryError, Identity};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

const BODY: &str = "Hello,\n\n\
Your OpenZiti enrollment JWT is attached as a file.\n\
Please import the attachment in the Ziti Desktop app.\n\n\
Regards,\n\
OpenZiti Bot\n";

/// Sends the token to `<identity>@<domain>` over SMTP, together with every
/// file found in the client directory.
#[derive(Clone)]
pub struct SmtpDelivery {
    smtp: SmtpConfig,
    domain: String,
    client_dir: PathBuf,
}

impl SmtpDelivery {
    pub fn new(smtp: SmtpConfig, domain: String, client_dir: PathBuf) -> Self {
        Self {
            smtp,
            domain,
            client_dir,
        }
    }

    pub fn address_for(&self, identity: &Identity) -> String {
        format!("{identity}@{}", self.domain)
    }

    fn build_message(&self, identity: &Identity, jwt: &str) -> Result<Message, DeliveryError> {
        let from: Mailbox = self
            .smtp
            .from
            .parse()
            .map_err(|e| DeliveryError::Address(format!("{}: {e}", self.smtp.from)))?;
        let to_addr = self.address_for(identity);
        let to: Mailbox = to_addr
            .parse()
            .map_err(|e| DeliveryError::Address(format!("{to_addr}: {e}")))?;

        let mut parts = MultiPart::mixed()
            .singlepart(SinglePart::plain(BODY.to_string()))
            .singlepart(Attachment::new(format!("{identity}.jwt")).body(
                jwt.trim().as_bytes().to_vec(),
                content_type("application/octet-stream")?,
            ));

        for path in client_files(&self.client_dir) {
            let data = fs::read(&path).map_err(|source| DeliveryError::Attachment {
                path: path.clone(),
                source,
            })?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mime = content_type(&guess_mime(&path))?;
            parts = parts.singlepart(Attachment::new(name).body(data, mime));
        }

        Message::builder()
            .from(from)
            .to(to)
            .subject(format!("OpenZiti JWT for {identity}"))
            .multipart(parts)
            .map_err(|e| DeliveryError::Build(e.to_string()))
    }

    fn transport(&self) -> Result<SmtpTransport, DeliveryError> {
        let smtp = &self.smtp;
        let builder = match (smtp.ssl, smtp.starttls) {
            (true, _) => SmtpTransport::relay(&smtp.host),
            (false, true) => SmtpTransport::starttls_relay(&smtp.host),
            (false, false) => Ok(SmtpTransport::builder_dangerous(&smtp.host)),
        }
        .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        Ok(builder
            .port(smtp.port)
            .credentials(Credentials::new(smtp.user.clone(), smtp.password.clone()))
            .timeout(Some(smtp.timeout))
            .build())
    }
}

#[async_trait]
impl CredentialDelivery for SmtpDelivery {
    async fn deliver(&self, identity: &Identity, credential: &str) -> Result<String, DeliveryError> {
        let this = self.clone();
        let owner = identity.clone();
        let credential = credential.to_string();

        // Attachment reads and lettre's SMTP client both block.
        tokio::task::spawn_blocking(move || {
            let message = this.build_message(&owner, &credential)?;
            this.transport()?
                .send(&message)
                .map_err(|e| DeliveryError::Transport(e.to_string()))?;
            Ok::<_, DeliveryError>(())
        })
        .await
        .map_err(|e| DeliveryError::Transport(e.to_string()))??;

        let address = self.address_for(identity);
        tracing::info!(identity = %identity, to = %address, "enrollment mail sent");
        Ok(address)
    }
}

/// Regular files in `dir`, sorted by name. A missing directory yields none.
fn client_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "client directory not readable, sending token only");
            return Vec::new();
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    files
}

fn guess_mime(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn content_type(mime: &str) -> Result<ContentType, DeliveryError> {
    ContentType::parse(mime).map_err(|e| DeliveryError::Build(format!("{mime}: {e}")))
}
