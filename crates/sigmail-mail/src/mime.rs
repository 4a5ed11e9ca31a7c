//! Depth-first decoding of message part trees.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use tracing::warn;

use crate::message::MessagePart;
use crate::MailError;

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);

/// Decode URL-safe base64 part data, padded or not. Invalid UTF-8 is replaced, not rejected.
pub fn decode_part_data(data: &str) -> Result<String, base64::DecodeError> {
    let compact: String = data.split_whitespace().collect();
    let bytes = match URL_SAFE_LENIENT.decode(&compact) {
        Ok(bytes) => bytes,
        Err(url_err) => STANDARD_LENIENT.decode(&compact).map_err(|_| url_err)?,
    };
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedBody {
    pub plain: Option<String>,
    pub html: Option<String>,
}

impl DecodedBody {
    /// Plain text if any part carried it, otherwise HTML.
    pub fn preferred(&self) -> Option<&str> {
        self.plain.as_deref().or(self.html.as_deref())
    }
}

/// First text/plain and first text/html part in depth-first order. Undecodable parts are skipped.
pub fn decode_body(message_id: &str, payload: &MessagePart) -> DecodedBody {
    let mut found = DecodedBody::default();
    collect_first_bodies(message_id, payload, &mut found);
    found
}

fn collect_first_bodies(message_id: &str, part: &MessagePart, found: &mut DecodedBody) {
    if found.plain.is_some() && found.html.is_some() {
        return;
    }

    if let Some(data) = part.data() {
        let slot = if part.is_mime("text/plain") {
            Some(&mut found.plain)
        } else if part.is_mime("text/html") {
            Some(&mut found.html)
        } else {
            None
        };
        if let Some(slot) = slot.filter(|s| s.is_none()) {
            match decode_part_data(data) {
                Ok(text) => *slot = Some(text),
                Err(err) => warn!(message_id, part = %part.part_id, error = %err, "skipping undecodable part"),
            }
        }
    }

    for child in &part.parts {
        collect_first_bodies(message_id, child, found);
    }
}

/// Every decoded text/* part concatenated in depth-first order.
pub fn concat_text_parts(message_id: &str, payload: &MessagePart) -> Result<String, MailError> {
    let mut out = String::new();
    append_text_parts(message_id, payload, &mut out)?;
    Ok(out)
}

fn append_text_parts(message_id: &str, part: &MessagePart, out: &mut String) -> Result<(), MailError> {
    let is_text = part
        .mime_type
        .trim()
        .to_ascii_lowercase()
        .starts_with("text/");
    if is_text {
        if let Some(data) = part.data() {
            let text = decode_part_data(data).map_err(|source| MailError::Decode {
                message_id: message_id.to_string(),
                part: part.part_id.clone(),
                source,
            })?;
            out.push_str(&text);
        }
    }
    for child in &part.parts {
        append_text_parts(message_id, child, out)?;
    }
    Ok(())
}
