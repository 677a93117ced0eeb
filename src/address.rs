//! RFC 2822 address helpers and the set of domains this host owns.

use mailparse::{addrparse, MailAddr};

/// Reduces an address (bare, bracketed or with a display name) to `local@domain`.
pub fn bare_address(address: &str) -> String {
    let trimmed = address.trim();
    if let Ok(list) = addrparse(trimmed) {
        match list.first() {
            Some(MailAddr::Single(info)) => return info.addr.trim().to_string(),
            Some(MailAddr::Group(group)) => {
                if let Some(info) = group.addrs.first() {
                    return info.addr.trim().to_string();
                }
            }
            None => {}
        }
    }
    trimmed
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// Returns the lower-cased domain of an address, if it has one.
///
/// An address without an `@`-separated, non-empty local part and domain has
/// no domain. This includes the null sender.
pub fn domain_of(address: &str) -> Option<String> {
    let bare = bare_address(address);
    let (local, domain) = bare.rsplit_once('@')?;
    let domain = domain.trim().trim_end_matches('.');
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some(domain.to_ascii_lowercase())
}

/// Splits a header value holding an address list into bare addresses.
///
/// Groups are flattened. When the value does not parse as an address list
/// it is split on commas instead.
pub fn list_addresses(value: &str) -> Vec<String> {
    match addrparse(value) {
        Ok(list) => list
            .iter()
            .flat_map(|entry| match entry {
                MailAddr::Single(info) => vec![info.addr.clone()],
                MailAddr::Group(group) => group.addrs.iter().map(|i| i.addr.clone()).collect(),
            })
            .map(|addr| addr.trim().to_string())
            .filter(|addr| !addr.is_empty())
            .collect(),
        Err(_) => value
            .split(',')
            .map(bare_address)
            .filter(|addr| !addr.is_empty())
            .collect(),
    }
}

/// Display name and bare address of a single mailbox.
pub fn mailbox_parts(value: &str) -> (String, String) {
    if let Ok(list) = addrparse(value) {
        if let Some(MailAddr::Single(info)) = list.first() {
            let name = info.display_name.clone().unwrap_or_default();
            return (name.trim().to_string(), info.addr.trim().to_string());
        }
    }
    (String::new(), bare_address(value))
}

/// The configured local domains.
///
/// Domains are stored lower-cased, without duplicates, in configuration
/// order. The first one is the primary domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainSet {
    domains: Vec<String>,
}

impl DomainSet {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Vec::new();
        for domain in domains {
            let domain = domain.as_ref().trim().trim_end_matches('.').to_ascii_lowercase();
            if !domain.is_empty() && !set.contains(&domain) {
                set.push(domain);
            }
        }
        Self { domains: set }
    }

    /// Parses a comma or whitespace separated list (`"a.tld, b.tld"`).
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(|c: char| c == ',' || c.is_whitespace()))
    }

    pub fn primary(&self) -> Option<&str> {
        self.domains.first().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }

    pub fn contains_domain(&self, domain: &str) -> bool {
        self.domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain.trim_end_matches('.')))
    }

    /// Whether the address belongs to one of the local domains.
    pub fn is_local(&self, address: &str) -> bool {
        domain_of(address).is_some_and(|domain| self.contains_domain(&domain))
    }
}
