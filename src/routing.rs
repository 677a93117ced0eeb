use log::{debug, warn};

use crate::address::{bare_address, list_addresses, DomainSet};

/// How one transaction's recipients are split up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingDecision {
    pub local_recipients: Vec<String>,
    pub remote_recipients: Vec<String>,
    /// Set only when there are remote recipients.
    pub local_sender: Option<String>,
}

/// Partitions recipients into local and remote ones, keeping input order.
///
/// Addresses without a parseable domain are remote.
pub fn classify(recipients: &[String], domains: &DomainSet) -> (Vec<String>, Vec<String>) {
    recipients
        .iter()
        .cloned()
        .partition(|recipient| domains.is_local(recipient))
}

/// Picks the local mailbox that appears to be forwarding the message.
///
/// `header_recipients` are raw To/Cc header values, each possibly an address
/// list. When they name exactly one distinct local address it wins; when they
/// name none the envelope recipients are tried the same way. Anything else
/// is ambiguous and yields `fallback`.
pub fn resolve_local_sender(
    header_recipients: &[String],
    envelope_recipients: &[String],
    domains: &DomainSet,
    fallback: &str,
) -> String {
    let header_addresses: Vec<String> = header_recipients
        .iter()
        .flat_map(|value| list_addresses(value))
        .collect();
    let mut candidates = local_candidates(&header_addresses, domains);
    if candidates.is_empty() {
        debug!("[routing] no local address in To/Cc, trying envelope recipients");
        let envelope_addresses: Vec<String> =
            envelope_recipients.iter().map(|r| bare_address(r)).collect();
        candidates = local_candidates(&envelope_addresses, domains);
    }

    match candidates.as_slice() {
        [single] => single.clone(),
        _ => {
            warn!(
                "[routing] ambiguous local sender ({} candidates: {}), using {}",
                candidates.len(),
                candidates.join(", "),
                fallback
            );
            fallback.to_string()
        }
    }
}

/// Distinct local addresses, compared case-insensitively, first spelling kept.
fn local_candidates(addresses: &[String], domains: &DomainSet) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    for address in addresses {
        if !domains.is_local(address) {
            continue;
        }
        if !candidates.iter().any(|c| c.eq_ignore_ascii_case(address)) {
            candidates.push(address.clone());
        }
    }
    candidates
}
