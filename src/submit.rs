use std::collections::BTreeMap;
use std::time::Duration;

use lettre::transport::smtp::client::SmtpConnection;
use lettre::transport::smtp::commands::{Data, Mail, Rcpt};
use lettre::transport::smtp::extension::ClientId;
use lettre::Address;
use log::{debug, info, warn};
use thiserror::Error;

use crate::config::Endpoint;

/// Recipients the server refused, with the server's reason.
pub type Rejections = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid envelope sender <{0}>")]
    MalformedAddress(String),

    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

/// Hands a message back to the mail system.
///
/// An empty [`Rejections`] map means every recipient was accepted. Errors are
/// reserved for failures that concern the whole submission.
pub trait MailSubmitter: Send + Sync {
    fn submit(
        &self,
        sender: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<Rejections, SubmitError>;
}

/// Submits over plain SMTP to the re-injection listener.
pub struct SmtpSubmitter {
    host: String,
    port: u16,
    hello: ClientId,
    timeout: Duration,
}

impl SmtpSubmitter {
    pub fn new(endpoint: &Endpoint, helo_name: &str, timeout: Duration) -> Self {
        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            hello: ClientId::Domain(helo_name.to_string()),
            timeout,
        }
    }
}

impl MailSubmitter for SmtpSubmitter {
    fn submit(
        &self,
        sender: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<Rejections, SubmitError> {
        let reverse_path = match sender.trim_matches(|c: char| c == '<' || c == '>') {
            "" => None,
            address => Some(
                address
                    .parse::<Address>()
                    .map_err(|_| SubmitError::MalformedAddress(sender.to_string()))?,
            ),
        };

        debug!("[submit] connecting to {}:{}", self.host, self.port);
        let mut conn = SmtpConnection::connect(
            (self.host.as_str(), self.port),
            Some(self.timeout),
            &self.hello,
            None,
            None,
        )?;

        conn.command(Mail::new(reverse_path, vec![]))?;
        debug!("[submit] MAIL FROM:<{}> accepted", sender);

        let mut rejections = Rejections::new();
        let mut accepted = Vec::new();
        for recipient in recipients {
            let address = match recipient.parse::<Address>() {
                Ok(address) => address,
                Err(e) => {
                    warn!("[submit] invalid recipient <{}>: {}", recipient, e);
                    rejections.insert(recipient.clone(), format!("invalid address: {e}"));
                    continue;
                }
            };
            match conn.command(Rcpt::new(address, vec![])) {
                Ok(_) => accepted.push(recipient.clone()),
                Err(e) if e.is_permanent() || e.is_transient() => {
                    warn!("[submit] RCPT TO:<{}> refused: {}", recipient, e);
                    rejections.insert(recipient.clone(), e.to_string());
                }
                Err(e) => return Err(e.into()),
            }
        }

        if accepted.is_empty() {
            debug!("[submit] no recipient accepted, skipping DATA");
        } else {
            let sent = conn
                .command(Data)
                .and_then(|_| conn.message(message));
            match sent {
                Ok(response) => {
                    info!(
                        "[submit] delivered {} bytes to {} recipient(s): {}",
                        message.len(),
                        accepted.len(),
                        response.first_line().unwrap_or("")
                    );
                }
                Err(e) if e.is_permanent() || e.is_transient() => {
                    warn!("[submit] message refused: {}", e);
                    for recipient in accepted {
                        rejections.insert(recipient, e.to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Err(e) = conn.quit() {
            debug!("[submit] QUIT failed: {}", e);
        }
        Ok(rejections)
    }
}
