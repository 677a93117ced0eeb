//! Per-transaction forwarding logic.
//!
//! Mail from a local sender goes back to the mail system unchanged. Mail from
//! anywhere else is split: local recipients get the original, remote
//! recipients get a copy that reads like a manual forward from the local
//! mailbox the message was addressed to.

use std::any::Any;
use std::error::Error as _;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::FilterConfig;
use crate::error::FilterError;
use crate::mime::{self, MimePart};
use crate::rewrite;
use crate::routing::{self, RoutingDecision};
use crate::smtp::{Transaction, TransactionHandler};
use crate::srs;
use crate::submit::{MailSubmitter, Rejections};

/// Transaction outcome, displayed as the SMTP reply line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Accepted,
    Rejected,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Accepted => 250,
            Status::Rejected => 500,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Accepted => write!(f, "250 OK"),
            Status::Rejected => write!(f, "500 Could not process your message"),
        }
    }
}

/// What happened to a transaction that went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Local sender, resubmitted as received.
    Unchanged { recipients: Vec<String> },
    Routed(RoutingDecision),
}

pub struct Forwarder {
    config: FilterConfig,
    submitter: Arc<dyn MailSubmitter>,
    notifier: Arc<dyn MailSubmitter>,
}

impl Forwarder {
    /// `submitter` re-injects mail; `notifier` carries failure reports to the admin.
    pub fn new(
        config: FilterConfig,
        submitter: Arc<dyn MailSubmitter>,
        notifier: Arc<dyn MailSubmitter>,
    ) -> Self {
        Self {
            config,
            submitter,
            notifier,
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Runs one transaction. Never fails: problems are reported to the admin
    /// and turn into a rejection.
    pub fn process(&self, sender: &str, recipients: &[String], raw: &[u8]) -> Status {
        let id = Uuid::new_v4().simple().to_string()[..12].to_string();
        info!(
            "[forward] {} from=<{}> to={} ({} bytes)",
            id,
            sender,
            recipients.join(","),
            raw.len()
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.route(sender, recipients, raw)))
            .unwrap_or_else(|payload| Err(FilterError::Unexpected(panic_message(payload))));

        match outcome {
            Ok(delivery) => {
                info!("[forward] {} done: {:?}", id, delivery);
                Status::Accepted
            }
            Err(e) => {
                error!("[forward] {} failed: {}", id, e);
                for detail in e.details() {
                    error!("[forward] {}   {}", id, detail);
                }
                self.notify_admin(&id, sender, recipients, &e);
                Status::Rejected
            }
        }
    }

    pub fn route(
        &self,
        sender: &str,
        recipients: &[String],
        raw: &[u8],
    ) -> Result<Delivery, FilterError> {
        let origin = srs::decode(sender);
        if srs::is_srs(sender) {
            debug!("[forward] SRS sender <{}> is <{}>", sender, origin);
        }
        if self.config.domains.is_local(&origin) {
            info!("[forward] local sender <{}>, delivering unchanged", origin);
            let rejections = self.submitter.submit(sender, recipients, raw)?;
            for (recipient, reason) in &rejections {
                warn!("[forward] <{}> refused unchanged mail: {}", recipient, reason);
            }
            return Ok(Delivery::Unchanged {
                recipients: recipients.to_vec(),
            });
        }

        let (local, remote) = routing::classify(recipients, &self.config.domains);
        debug!(
            "[forward] local=[{}] remote=[{}]",
            local.join(","),
            remote.join(",")
        );
        let mut failures = Vec::new();

        if !local.is_empty() {
            if let Err(e) = self.deliver("local", sender, &local, raw) {
                failures.push(e);
            }
        }

        let mut local_sender = None;
        if !remote.is_empty() {
            match self.forward_copy(raw, recipients) {
                Ok((resolved, message)) => {
                    let mut targets = remote.clone();
                    if self.config.debug {
                        targets.extend(local.iter().cloned());
                    }
                    if let Err(e) = self.deliver("remote", &resolved, &targets, &message.to_bytes())
                    {
                        failures.push(e);
                    }
                    local_sender = Some(resolved);
                }
                Err(e) => failures.push(e),
            }
        }

        if !failures.is_empty() {
            return Err(FilterError::PartialForward(failures));
        }
        Ok(Delivery::Routed(RoutingDecision {
            local_recipients: local,
            remote_recipients: remote,
            local_sender,
        }))
    }

    /// Builds the forwarded copy, returning it with the local sender it is sent from.
    pub fn forward_copy(
        &self,
        raw: &[u8],
        envelope_recipients: &[String],
    ) -> Result<(String, MimePart), FilterError> {
        let original = MimePart::parse(raw)?;
        let header_recipients: Vec<String> = ["To", "Cc"]
            .iter()
            .flat_map(|name| original.decoded_header_all(name))
            .collect();
        let local_sender = routing::resolve_local_sender(
            &header_recipients,
            envelope_recipients,
            &self.config.domains,
            &self.config.fallback_sender,
        );

        let rewritten =
            rewrite::rewrite_headers(&original, &local_sender, &self.config.subject_prefix);
        let banner = rewrite::forward_banner(&original, &local_sender);
        let message = mime::restructure(&rewritten, &banner);
        Ok((local_sender, message))
    }

    fn deliver(
        &self,
        group: &'static str,
        sender: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<(), FilterError> {
        match self.submitter.submit(sender, recipients, message) {
            Ok(rejections) if rejections.is_empty() => {
                info!(
                    "[forward] {} delivery from <{}> to {} recipient(s) accepted",
                    group,
                    sender,
                    recipients.len()
                );
                Ok(())
            }
            Ok(rejections) => Err(FilterError::SubmissionRejected {
                group,
                recipients: rejections.keys().cloned().collect(),
                reason: rejection_reason(&rejections),
            }),
            Err(e) => Err(FilterError::SubmissionRejected {
                group,
                recipients: recipients.to_vec(),
                reason: e.to_string(),
            }),
        }
    }

    fn notify_admin(&self, id: &str, sender: &str, recipients: &[String], failure: &FilterError) {
        let report = self.failure_report(id, sender, recipients, failure);
        let admin = vec![self.config.admin_address.clone()];
        match self
            .notifier
            .submit(&self.config.notify_sender, &admin, report.as_bytes())
        {
            Ok(rejections) if rejections.is_empty() => {
                info!("[forward] {} failure reported to {}", id, admin[0]);
            }
            Ok(rejections) => {
                error!(
                    "[forward] {} failure report refused: {}",
                    id,
                    rejection_reason(&rejections)
                );
            }
            Err(e) => error!("[forward] {} could not send failure report: {}", id, e),
        }
    }

    fn failure_report(
        &self,
        id: &str,
        sender: &str,
        recipients: &[String],
        failure: &FilterError,
    ) -> String {
        let mut body = String::new();
        body.push_str("A message could not be processed by the forwarding filter.\r\n\r\n");
        body.push_str(&format!("id   {id}\r\n"));
        body.push_str(&format!("from {sender}\r\n"));
        body.push_str(&format!("to   {}\r\n\r\n", recipients.join(", ")));
        body.push_str(&format!("error: {failure}\r\n"));
        for detail in failure.details() {
            body.push_str(&format!("  - {detail}\r\n"));
        }
        let mut source = failure.source();
        while let Some(cause) = source {
            body.push_str(&format!("caused by: {cause}\r\n"));
            source = cause.source();
        }

        let domain = self.config.domains.primary().unwrap_or("localhost");
        format!(
            "From: {from}\r\n\
             To: {to}\r\n\
             Subject: Mail forward failed\r\n\
             Date: {date}\r\n\
             Message-ID: <{mid}@{domain}>\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: text/plain; charset=\"utf-8\"\r\n\
             Content-Transfer-Encoding: 8bit\r\n\
             \r\n\
             {body}",
            from = self.config.notify_sender,
            to = self.config.admin_address,
            date = Utc::now().to_rfc2822(),
            mid = Uuid::new_v4(),
        )
    }
}

impl TransactionHandler for Forwarder {
    fn handle(&self, transaction: Transaction) -> String {
        self.process(
            &transaction.sender,
            &transaction.recipients,
            &transaction.data,
        )
        .to_string()
    }
}

fn rejection_reason(rejections: &Rejections) -> String {
    rejections
        .iter()
        .map(|(recipient, reason)| format!("<{recipient}>: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::DomainSet;
    use crate::mime::Body;
    use crate::submit::SubmitError;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Submission {
        sender: String,
        recipients: Vec<String>,
        message: Vec<u8>,
    }

    #[derive(Default)]
    struct RecordingSubmitter {
        sent: Mutex<Vec<Submission>>,
        refuse: Vec<String>,
        unreachable: bool,
        explode: bool,
    }

    impl RecordingSubmitter {
        fn refusing(addresses: &[&str]) -> Self {
            Self {
                refuse: addresses.iter().map(|a| a.to_string()).collect(),
                ..Self::default()
            }
        }

        fn sent(&self) -> Vec<Submission> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl MailSubmitter for RecordingSubmitter {
        fn submit(
            &self,
            sender: &str,
            recipients: &[String],
            message: &[u8],
        ) -> Result<Rejections, SubmitError> {
            if self.explode {
                panic!("submitter exploded");
            }
            self.sent.lock().unwrap().push(Submission {
                sender: sender.to_string(),
                recipients: recipients.to_vec(),
                message: message.to_vec(),
            });
            if self.unreachable {
                return Err(SubmitError::MalformedAddress(sender.to_string()));
            }
            Ok(recipients
                .iter()
                .filter(|r| self.refuse.contains(r))
                .map(|r| (r.clone(), "550 mailbox unavailable".to_string()))
                .collect())
        }
    }

    const MESSAGE: &str = concat!(
        "From: Remote User <user@remote.tld>\r\n",
        "To: alice@my_1stdomain.tld\r\n",
        "Cc: friend@external.org\r\n",
        "Subject: Hello\r\n",
        "Date: Mon, 1 Jan 2024 10:00:00 +0000\r\n",
        "\r\n",
        "hi\r\n",
    );

    fn config() -> FilterConfig {
        FilterConfig::new(DomainSet::new(["my_1stdomain.tld", "my_2nddomain.tld"])).unwrap()
    }

    fn forwarder(
        config: FilterConfig,
        submitter: &Arc<RecordingSubmitter>,
        notifier: &Arc<RecordingSubmitter>,
    ) -> Forwarder {
        Forwarder::new(config, submitter.clone(), notifier.clone())
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn leaf_text(part: &MimePart) -> String {
        match part.body() {
            Body::Leaf(bytes) => String::from_utf8_lossy(bytes).to_string(),
            Body::Multipart { .. } => panic!("expected a leaf"),
        }
    }

    #[test]
    fn status_lines() {
        assert_eq!(Status::Accepted.to_string(), "250 OK");
        assert_eq!(
            Status::Rejected.to_string(),
            "500 Could not process your message"
        );
        assert_eq!(Status::Rejected.code(), 500);
    }

    #[test]
    fn remote_sender_is_split_between_local_and_remote() {
        let submitter = Arc::new(RecordingSubmitter::default());
        let notifier = Arc::new(RecordingSubmitter::default());
        let forwarder = forwarder(config(), &submitter, &notifier);

        let recipients = strings(&["alice@my_1stdomain.tld", "bob@elsewhere.org"]);
        let status = forwarder.process("user@remote.tld", &recipients, MESSAGE.as_bytes());
        assert_eq!(status, Status::Accepted);

        let sent = submitter.sent();
        assert_eq!(sent.len(), 2);

        assert_eq!(sent[0].sender, "user@remote.tld");
        assert_eq!(sent[0].recipients, strings(&["alice@my_1stdomain.tld"]));
        assert_eq!(sent[0].message, MESSAGE.as_bytes());

        assert_eq!(sent[1].sender, "alice@my_1stdomain.tld");
        assert_eq!(sent[1].recipients, strings(&["bob@elsewhere.org"]));
        let forwarded = MimePart::parse(&sent[1].message).unwrap();
        assert_eq!(forwarded.header("Subject").as_deref(), Some("Fwd: Hello"));
        assert_eq!(
            forwarded.header("From").as_deref(),
            Some("Remote User via <alice@my_1stdomain.tld>")
        );
        assert_eq!(
            forwarded.header("Reply-To").as_deref(),
            Some("Remote User <user@remote.tld>")
        );
        let body = leaf_text(&forwarded);
        assert!(body.starts_with(
            "-------- Automatically forwarded by alice@my_1stdomain.tld --------\r\n"
        ));
        assert!(body.ends_with("-------- Original message --------\r\nhi\r\n"));

        assert!(notifier.sent().is_empty());
    }

    #[test]
    fn route_reports_the_decision() {
        let submitter = Arc::new(RecordingSubmitter::default());
        let notifier = Arc::new(RecordingSubmitter::default());
        let forwarder = forwarder(config(), &submitter, &notifier);

        let recipients = strings(&["bob@elsewhere.org", "carol@my_2nddomain.tld"]);
        let delivery = forwarder
            .route("user@remote.tld", &recipients, MESSAGE.as_bytes())
            .unwrap();
        assert_eq!(
            delivery,
            Delivery::Routed(RoutingDecision {
                local_recipients: strings(&["carol@my_2nddomain.tld"]),
                remote_recipients: strings(&["bob@elsewhere.org"]),
                local_sender: Some("alice@my_1stdomain.tld".to_string()),
            })
        );
    }

    #[test]
    fn only_local_recipients_get_the_original() {
        let submitter = Arc::new(RecordingSubmitter::default());
        let notifier = Arc::new(RecordingSubmitter::default());
        let forwarder = forwarder(config(), &submitter, &notifier);

        let recipients = strings(&["alice@my_1stdomain.tld"]);
        let status = forwarder.process("user@remote.tld", &recipients, MESSAGE.as_bytes());
        assert_eq!(status, Status::Accepted);
        let sent = submitter.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message, MESSAGE.as_bytes());
    }

    #[test]
    fn local_srs_sender_is_delivered_unchanged() {
        let submitter = Arc::new(RecordingSubmitter::refusing(&["bob@elsewhere.org"]));
        let notifier = Arc::new(RecordingSubmitter::default());
        let forwarder = forwarder(config(), &submitter, &notifier);

        let sender = "SRS0=HHH=TT=my_1stdomain.tld=carol@relay.tld";
        let recipients = strings(&["bob@elsewhere.org", "alice@my_1stdomain.tld"]);
        let status = forwarder.process(sender, &recipients, MESSAGE.as_bytes());

        // refusals on the unchanged path are only logged
        assert_eq!(status, Status::Accepted);
        let sent = submitter.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sender, sender);
        assert_eq!(sent[0].recipients, recipients);
        assert_eq!(sent[0].message, MESSAGE.as_bytes());
        assert!(notifier.sent().is_empty());
    }

    #[test]
    fn unchanged_delivery_transport_failure_notifies_admin() {
        let submitter = Arc::new(RecordingSubmitter {
            unreachable: true,
            ..RecordingSubmitter::default()
        });
        let notifier = Arc::new(RecordingSubmitter::default());
        let forwarder = forwarder(config(), &submitter, &notifier);

        let status = forwarder.process(
            "carol@my_2nddomain.tld",
            &strings(&["bob@elsewhere.org"]),
            MESSAGE.as_bytes(),
        );
        assert_eq!(status, Status::Rejected);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[test]
    fn double_failure_sends_one_report_with_both_groups() {
        let submitter = Arc::new(RecordingSubmitter::refusing(&[
            "alice@my_1stdomain.tld",
            "bob@elsewhere.org",
        ]));
        let notifier = Arc::new(RecordingSubmitter::default());
        let forwarder = forwarder(config(), &submitter, &notifier);

        let recipients = strings(&["alice@my_1stdomain.tld", "bob@elsewhere.org"]);
        let status = forwarder.process("user@remote.tld", &recipients, MESSAGE.as_bytes());
        assert_eq!(status, Status::Rejected);
        assert_eq!(status.to_string(), "500 Could not process your message");

        let reports = notifier.sent();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].sender, "mailfilter@my_1stdomain.tld");
        assert_eq!(reports[0].recipients, strings(&["admin@my_1stdomain.tld"]));

        let report = String::from_utf8(reports[0].message.clone()).unwrap();
        assert!(report.contains("Subject: Mail forward failed\r\n"));
        assert!(report.contains("from user@remote.tld\r\n"));
        assert!(report.contains("local delivery to [alice@my_1stdomain.tld] failed"));
        assert!(report.contains("remote delivery to [bob@elsewhere.org] failed"));
    }

    #[test]
    fn debug_mode_copies_local_recipients() {
        let mut config = config();
        config.debug = true;
        let submitter = Arc::new(RecordingSubmitter::default());
        let notifier = Arc::new(RecordingSubmitter::default());
        let forwarder = forwarder(config, &submitter, &notifier);

        let recipients = strings(&["alice@my_1stdomain.tld", "bob@elsewhere.org"]);
        forwarder.process("user@remote.tld", &recipients, MESSAGE.as_bytes());

        let sent = submitter.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].message, MESSAGE.as_bytes());
        assert_eq!(
            sent[1].recipients,
            strings(&["bob@elsewhere.org", "alice@my_1stdomain.tld"])
        );
        assert_ne!(sent[1].message, MESSAGE.as_bytes());
    }

    #[test]
    fn ambiguous_recipient_uses_fallback_sender() {
        let submitter = Arc::new(RecordingSubmitter::default());
        let notifier = Arc::new(RecordingSubmitter::default());
        let forwarder = forwarder(config(), &submitter, &notifier);

        let raw = "From: a@remote.tld\r\nTo: x@my_1stdomain.tld, y@my_2nddomain.tld\r\n\r\nhi";
        let (sender, _) = forwarder
            .forward_copy(raw.as_bytes(), &strings(&["bob@elsewhere.org"]))
            .unwrap();
        assert_eq!(sender, "forwarder@my_1stdomain.tld");
    }

    #[test]
    fn panic_is_contained() {
        let submitter = Arc::new(RecordingSubmitter {
            explode: true,
            ..RecordingSubmitter::default()
        });
        let notifier = Arc::new(RecordingSubmitter::default());
        let forwarder = forwarder(config(), &submitter, &notifier);

        let status = forwarder.process(
            "user@remote.tld",
            &strings(&["bob@elsewhere.org"]),
            MESSAGE.as_bytes(),
        );
        assert_eq!(status, Status::Rejected);
        let reports = notifier.sent();
        assert_eq!(reports.len(), 1);
        let report = String::from_utf8(reports[0].message.clone()).unwrap();
        assert!(report.contains("panic: submitter exploded"));
    }

    #[test]
    fn handler_replies_with_status_line() {
        let submitter = Arc::new(RecordingSubmitter::default());
        let notifier = Arc::new(RecordingSubmitter::default());
        let forwarder = forwarder(config(), &submitter, &notifier);

        let reply = forwarder.handle(Transaction {
            sender: "user@remote.tld".to_string(),
            recipients: strings(&["alice@my_1stdomain.tld"]),
            data: MESSAGE.as_bytes().to_vec(),
        });
        assert_eq!(reply, "250 OK");
    }
}
