//! Header rewriting for the forwarded copy.

use log::debug;

use crate::address::mailbox_parts;
use crate::mime::{encode_word, MimePart};

const PHRASE_SPECIALS: &[char] = &['(', ')', '<', '>', '[', ']', ':', ';', '@', '\\', ',', '.', '"'];

/// Returns a copy of `original` with the headers of a manual forward.
///
/// The subject gets `subject_prefix`, the original `From` is kept in
/// `Originally-From` and `Reply-To` (unless those exist already) and `From`
/// is replaced in place by `"<name> via" <local_sender>`.
pub fn rewrite_headers(original: &MimePart, local_sender: &str, subject_prefix: &str) -> MimePart {
    let mut message = original.clone();
    let from_raw = original.header_raw("From").unwrap_or_default().to_vec();
    let from_decoded = original.decoded_header("From").unwrap_or_default();

    // raw bytes after the prefix: encoded words and 8-bit text stay as sent
    let prefix = header_prefix(subject_prefix);
    let subject = match original.header_raw("Subject") {
        Some(raw) => [prefix.as_bytes(), raw].concat(),
        None => prefix.trim_end().as_bytes().to_vec(),
    };
    message.set_header_raw("Subject", &subject);

    // Without an original From there is nothing to point back to: an empty
    // address list is not a valid Originally-From or Reply-To, so both are
    // left out and From alone names the local sender.
    if !from_raw.is_empty() {
        if !message.has_header("Originally-From") {
            message.append_header_raw("Originally-From", &from_raw);
        }
        if !message.has_header("Reply-To") {
            message.append_header_raw("Reply-To", &from_raw);
        }
    }

    let from = forwarded_from(&from_decoded, local_sender);
    debug!("[rewrite] From: {} -> {}", from_decoded, from);
    message.set_header("From", &from);
    message
}

/// `From` value naming the original author and the forwarding mailbox.
pub fn forwarded_from(original_from: &str, local_sender: &str) -> String {
    let (name, address) = mailbox_parts(original_from);
    let name = if name.is_empty() {
        address.replace('@', "_at_")
    } else {
        name
    };
    if name.is_empty() {
        return format!("<{local_sender}>");
    }
    format!("{} <{}>", display_phrase(&format!("{name} via")), local_sender)
}

fn display_phrase(text: &str) -> String {
    if !text.is_ascii() {
        encode_word(text)
    } else if text.contains(PHRASE_SPECIALS) {
        format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        text.to_string()
    }
}

fn header_prefix(prefix: &str) -> String {
    if prefix.is_ascii() {
        prefix.to_string()
    } else {
        format!("{} ", encode_word(prefix.trim_end()))
    }
}

/// Text placed in front of the original content of a forwarded message.
pub fn forward_banner(original: &MimePart, local_sender: &str) -> String {
    let mut lines = vec![format!(
        "-------- Automatically forwarded by {local_sender} --------"
    )];
    for name in ["Subject", "Date", "From", "To"] {
        let value = original.decoded_header_all(name).join(", ");
        lines.push(format!("{name}:\t{value}"));
    }
    for name in ["Cc", "Sender"] {
        let values = original.decoded_header_all(name);
        if !values.is_empty() {
            lines.push(format!("{name}:\t{}", values.join(", ")));
        }
    }
    lines.push("-------- Original message --------".to_string());

    let mut banner = lines.join("\r\n");
    banner.push_str("\r\n");
    banner
}
