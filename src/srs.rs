//! Sender Rewriting Scheme decoding.
//!
//! Forwarders that rewrite the envelope sender (to keep SPF passing) produce
//! addresses such as `SRS0=HHH=TT=example.com=alice@relay.tld`. Only the
//! origin is recovered here; the hash is not verified since the address is
//! used for routing decisions and logging, never for delivery.

use log::debug;
use regex::Regex;
use std::sync::OnceLock;

use crate::error::FilterError;

static SRS_TAG: OnceLock<Regex> = OnceLock::new();

fn srs_tag_re() -> &'static Regex {
    SRS_TAG.get_or_init(|| Regex::new(r"(?i)^SRS([0-9]?)([=+-])").expect("Invalid regex"))
}

/// Whether the local part of `address` carries an SRS tag.
pub fn is_srs(address: &str) -> bool {
    let local = address.rsplit_once('@').map_or(address, |(local, _)| local);
    srs_tag_re().is_match(local)
}

/// Decodes an SRS address, failing on SRS-tagged input that cannot be decoded.
///
/// Non-SRS addresses are returned unchanged.
pub fn try_decode(address: &str) -> Result<String, FilterError> {
    let local = address.rsplit_once('@').map_or(address, |(local, _)| local);
    let Some(caps) = srs_tag_re().captures(local) else {
        return Ok(address.to_string());
    };

    let tag = caps.get(1).map_or("", |m| m.as_str());
    let separator = caps[2].chars().next().unwrap_or('=');
    let mut payload = &local[caps[0].len()..];
    let mut inner_separator = separator;

    // SRS1=HHH=relay==HHH=TT=domain=local wraps an SRS0 payload
    if tag == "1" {
        if let Some(index) = doubled_separator(payload) {
            inner_separator = payload[index + 1..].chars().next().unwrap_or('=');
            payload = &payload[index + 2..];
        }
    }

    let mut fields: Vec<&str> = payload.splitn(4, inner_separator).collect();
    if fields.len() < 4 && inner_separator != '=' {
        fields = payload.splitn(4, '=').collect();
    }
    if fields.len() < 4 {
        return Err(FilterError::MalformedAddress(address.to_string()));
    }

    let (domain, local_part) = (fields[2], fields[3]);
    if domain.is_empty() || local_part.is_empty() {
        return Err(FilterError::MalformedAddress(address.to_string()));
    }
    Ok(format!("{local_part}@{domain}"))
}

/// Decodes an SRS address; anything that does not decode passes through.
pub fn decode(address: &str) -> String {
    match try_decode(address) {
        Ok(decoded) => decoded,
        Err(error) => {
            debug!("[srs] {}, keeping it as is", error);
            address.to_string()
        }
    }
}

fn doubled_separator(payload: &str) -> Option<usize> {
    payload
        .as_bytes()
        .windows(2)
        .position(|pair| pair[0] == b'=' && matches!(pair[1], b'=' | b'+' | b'-'))
}
