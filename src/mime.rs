//! MIME message tree used for rewriting forwarded mail.
//!
//! A [`MimePart`] keeps its headers as written on the wire and its leaf bodies
//! in their original transfer encoding, so untouched parts serialize back
//! byte for byte. Leaf bodies and child parts are reference counted: cloning a
//! tree to rewrite it shares everything that is not modified.

use std::borrow::Cow;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use mailparse::{
    parse_content_disposition, parse_content_type, parse_header, parse_headers, parse_mail,
    DispositionType, MailParseError, ParsedContentType, ParsedMail,
};
use uuid::Uuid;

/// A header as it appears on the wire.
///
/// The value is kept as raw bytes: unencoded 8-bit text in any charset must
/// survive re-serialization untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(name: &str, value: &str) -> Self {
        Self::raw(name, value.as_bytes())
    }

    pub fn raw(name: &str, value: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_vec(),
        }
    }

    /// The raw value, with invalid UTF-8 replaced.
    pub fn value_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }

    /// The value with RFC 2047 encoded words decoded.
    ///
    /// Raw 8-bit bytes that are not UTF-8 are read as Latin-1.
    pub fn decoded(&self) -> String {
        let mut line = Vec::with_capacity(self.name.len() + self.value.len() + 2);
        line.extend_from_slice(self.name.as_bytes());
        line.extend_from_slice(b": ");
        line.extend_from_slice(&self.value);
        match parse_header(&line) {
            Ok((header, _)) => header.get_value(),
            Err(_) => self.value_lossy().into_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Body {
    /// Content bytes, still in the part's transfer encoding.
    Leaf(Arc<[u8]>),
    Multipart {
        boundary: String,
        parts: Vec<Arc<MimePart>>,
    },
}

#[derive(Debug, Clone)]
pub struct MimePart {
    headers: Vec<Header>,
    body: Body,
}

impl MimePart {
    pub fn new(headers: Vec<Header>, body: Body) -> Self {
        Self { headers, body }
    }

    /// Parses a raw RFC 5322 message.
    pub fn parse(raw: &[u8]) -> Result<Self, MailParseError> {
        Self::from_parsed(&parse_mail(raw)?)
    }

    fn from_parsed(parsed: &ParsedMail) -> Result<Self, MailParseError> {
        let headers = parsed
            .headers
            .iter()
            .map(|h| Header::raw(&h.get_key(), trim_whitespace(h.get_value_raw())))
            .collect();

        // A multipart type whose boundary never shows up stays a leaf.
        let body = match parsed.ctype.params.get("boundary") {
            Some(boundary)
                if parsed.ctype.mimetype.starts_with("multipart/")
                    && !parsed.subparts.is_empty() =>
            {
                let parts = parsed
                    .subparts
                    .iter()
                    .map(|part| Self::from_parsed(part).map(Arc::new))
                    .collect::<Result<Vec<_>, _>>()?;
                Body::Multipart {
                    boundary: boundary.clone(),
                    parts,
                }
            }
            _ => {
                let (_, offset) = parse_headers(parsed.raw_bytes)?;
                Body::Leaf(Arc::from(&parsed.raw_bytes[offset..]))
            }
        };

        Ok(Self { headers, body })
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    /// Raw bytes of the first header called `name` (case-insensitive).
    pub fn header_raw(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_slice())
    }

    /// Undecoded value of the first header called `name`.
    pub fn header(&self, name: &str) -> Option<Cow<'_, str>> {
        self.header_raw(name).map(String::from_utf8_lossy)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header_raw(name).is_some()
    }

    /// Decoded value of the first header called `name`.
    pub fn decoded_header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(Header::decoded)
    }

    /// Decoded values of every header called `name`, in order.
    pub fn decoded_header_all(&self, name: &str) -> Vec<String> {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(Header::decoded)
            .collect()
    }

    /// Replaces the first `name` header in place and drops any others.
    ///
    /// The header is appended when absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.set_header_raw(name, value.as_bytes());
    }

    pub fn set_header_raw(&mut self, name: &str, value: &[u8]) {
        match self
            .headers
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(name))
        {
            Some(index) => {
                self.headers[index].value = value.to_vec();
                let mut seen = 0;
                self.headers.retain(|h| {
                    if h.name.eq_ignore_ascii_case(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.append_header_raw(name, value),
        }
    }

    pub fn append_header(&mut self, name: &str, value: &str) {
        self.append_header_raw(name, value.as_bytes());
    }

    pub fn append_header_raw(&mut self, name: &str, value: &[u8]) {
        self.headers.push(Header::raw(name, value));
    }

    /// Declared content type, `text/plain; charset=us-ascii` when absent.
    pub fn content_type(&self) -> ParsedContentType {
        self.decoded_header("Content-Type")
            .map(|value| parse_content_type(&value))
            .unwrap_or_default()
    }

    pub fn disposition(&self) -> Option<DispositionType> {
        self.decoded_header("Content-Disposition")
            .map(|value| parse_content_disposition(&value).disposition)
    }

    pub fn is_attachment(&self) -> bool {
        self.disposition() == Some(DispositionType::Attachment)
    }

    /// Lower-cased `Content-Transfer-Encoding`, `7bit` when absent.
    pub fn transfer_encoding(&self) -> String {
        self.header("Content-Transfer-Encoding")
            .map(|value| value.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "7bit".to_string())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        for header in &self.headers {
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(&header.value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");

        match &self.body {
            Body::Leaf(bytes) => out.extend_from_slice(bytes),
            Body::Multipart { boundary, parts } => {
                for part in parts {
                    if !out.ends_with(b"\n") {
                        out.extend_from_slice(b"\r\n");
                    }
                    out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
                    part.write_to(out);
                }
                if !out.ends_with(b"\n") {
                    out.extend_from_slice(b"\r\n");
                }
                out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
            }
        }
    }
}

/// Wraps `original` into a forwarded message led by `explanatory`.
///
/// Unencoded plain text gets the text prepended to its body. Anything else
/// becomes `multipart/mixed`: the explanatory part, then the original content
/// under a wrapper carrying the original `Content-*` headers, then the
/// original's top-level attachments.
pub fn restructure(original: &MimePart, explanatory: &str) -> MimePart {
    if let Some(flat) = prefix_flat_text(original, explanatory) {
        return flat;
    }

    let mut root_headers = Vec::new();
    let mut wrapper_headers = Vec::new();
    for header in original.headers() {
        if header.name.to_ascii_lowercase().starts_with("content-") {
            wrapper_headers.push(Header::raw(&header.name, &flatten_controls(&header.value)));
        } else {
            root_headers.push(header.clone());
        }
    }
    if !root_headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case("MIME-Version"))
    {
        root_headers.push(Header::new("MIME-Version", "1.0"));
    }
    let boundary = new_boundary();
    root_headers.push(Header::new(
        "Content-Type",
        &format!("multipart/mixed; boundary=\"{boundary}\""),
    ));

    let mut parts = vec![Arc::new(explanatory_part(explanatory))];
    let mut attachments = Vec::new();
    let wrapper_body = match original.body() {
        Body::Multipart {
            boundary: inner,
            parts: children,
        } => {
            let mut kept = Vec::new();
            for child in children {
                if child.is_attachment() {
                    attachments.push(Arc::clone(child));
                } else {
                    kept.push(Arc::clone(child));
                }
            }
            // a multipart with no body parts is not valid MIME
            (!kept.is_empty()).then(|| Body::Multipart {
                boundary: inner.clone(),
                parts: kept,
            })
        }
        Body::Leaf(bytes) => Some(Body::Leaf(Arc::clone(bytes))),
    };
    if let Some(body) = wrapper_body {
        parts.push(Arc::new(MimePart::new(wrapper_headers, body)));
    }
    parts.extend(attachments);

    MimePart::new(root_headers, Body::Multipart { boundary, parts })
}

fn prefix_flat_text(original: &MimePart, explanatory: &str) -> Option<MimePart> {
    let Body::Leaf(bytes) = original.body() else {
        return None;
    };
    let ctype = original.content_type();
    if !ctype.mimetype.eq_ignore_ascii_case("text/plain") {
        return None;
    }
    let encoding = original.transfer_encoding();
    if !matches!(encoding.as_str(), "7bit" | "8bit" | "binary") {
        return None;
    }

    let mut part = original.clone();
    if !explanatory.is_ascii() && !ctype.charset.eq_ignore_ascii_case("utf-8") {
        if !bytes.is_ascii() {
            return None;
        }
        if !part.has_header("MIME-Version") {
            part.append_header("MIME-Version", "1.0");
        }
        part.set_header("Content-Type", &utf8_content_type(&ctype));
        if encoding == "7bit" {
            part.set_header("Content-Transfer-Encoding", "8bit");
        }
    }

    let mut body = Vec::with_capacity(explanatory.len() + bytes.len());
    body.extend_from_slice(explanatory.as_bytes());
    body.extend_from_slice(bytes);
    part.set_body(Body::Leaf(body.into()));
    Some(part)
}

fn utf8_content_type(ctype: &ParsedContentType) -> String {
    let mut value = format!("{}; charset=\"utf-8\"", ctype.mimetype);
    for (key, param) in &ctype.params {
        if !key.eq_ignore_ascii_case("charset") {
            value.push_str(&format!("; {key}=\"{param}\""));
        }
    }
    value
}

fn explanatory_part(text: &str) -> MimePart {
    let (encoding, body) = if text.is_ascii() {
        ("7bit", text.as_bytes().to_vec())
    } else {
        ("base64", base64_lines(text.as_bytes()))
    };
    MimePart::new(
        vec![
            Header::new("Content-Type", "text/plain; charset=\"utf-8\""),
            Header::new("Content-Transfer-Encoding", encoding),
            Header::new("Content-Disposition", "inline"),
        ],
        Body::Leaf(body.into()),
    )
}

fn base64_lines(bytes: &[u8]) -> Vec<u8> {
    let encoded = general_purpose::STANDARD.encode(bytes);
    let mut out = Vec::with_capacity(encoded.len() + encoded.len() / 76 * 2 + 2);
    for line in encoded.as_bytes().chunks(76) {
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Header values copied between parts must not smuggle in new lines.
fn flatten_controls(value: &[u8]) -> Vec<u8> {
    value
        .iter()
        .map(|&b| if b.is_ascii_control() { b' ' } else { b })
        .collect()
}

fn trim_whitespace(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &value[start..end]
}

fn new_boundary() -> String {
    format!("=_fwd_{}", Uuid::new_v4().simple())
}

/// Longest UTF-8 chunk whose base64 form keeps an encoded word within 75 characters.
const ENCODED_WORD_BYTES: usize = 45;

/// Encodes header text as RFC 2047 words when it is not plain ASCII.
///
/// Long text is split on character boundaries into several words separated
/// by spaces, which decoders drop between adjacent encoded words.
pub fn encode_word(text: &str) -> String {
    if text.is_ascii() {
        return text.to_string();
    }
    let mut words = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + ENCODED_WORD_BYTES).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        words.push(format!(
            "=?utf-8?b?{}?=",
            general_purpose::STANDARD.encode(&text.as_bytes()[start..end])
        ));
        start = end;
    }
    words.join(" ")
}
