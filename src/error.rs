use thiserror::Error;

use crate::submit::SubmitError;

/// Failures surfaced by the forwarding pipeline.
///
/// Everything ends up at the transaction boundary in
/// [`Forwarder::process`](crate::forward::Forwarder::process), which turns it
/// into an admin report and a rejection status.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("malformed address <{0}>")]
    MalformedAddress(String),

    /// One recipient group was not (fully) accepted by the re-injection server.
    #[error("{group} delivery to [{}] failed: {reason}", .recipients.join(", "))]
    SubmissionRejected {
        group: &'static str,
        recipients: Vec<String>,
        reason: String,
    },

    #[error("message not forwarded to some recipients")]
    PartialForward(Vec<FilterError>),

    #[error("failed to parse message: {0}")]
    Parse(#[from] mailparse::MailParseError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl FilterError {
    /// Human readable detail lines, one per failed recipient group.
    pub fn details(&self) -> Vec<String> {
        match self {
            FilterError::PartialForward(failures) => {
                failures.iter().map(|failure| failure.to_string()).collect()
            }
            other => vec![other.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_rejected_lists_recipients() {
        let error = FilterError::SubmissionRejected {
            group: "remote",
            recipients: vec!["a@x.org".to_string(), "b@y.org".to_string()],
            reason: "550 no such user".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "remote delivery to [a@x.org, b@y.org] failed: 550 no such user"
        );
    }

    #[test]
    fn partial_forward_details_one_line_per_group() {
        let error = FilterError::PartialForward(vec![
            FilterError::SubmissionRejected {
                group: "local",
                recipients: vec!["a@my.tld".to_string()],
                reason: "refused".to_string(),
            },
            FilterError::SubmissionRejected {
                group: "remote",
                recipients: vec!["b@ext.org".to_string()],
                reason: "refused".to_string(),
            },
        ]);
        let details = error.details();
        assert_eq!(details.len(), 2);
        assert!(details[0].starts_with("local delivery to [a@my.tld]"));
        assert!(details[1].starts_with("remote delivery to [b@ext.org]"));
        assert_eq!(error.to_string(), "message not forwarded to some recipients");
    }
}
