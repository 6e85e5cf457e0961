//! Input validation for client-supplied text and identifiers.
//!
//! The radio enforces its own frame limit at encode time; the checks here only reject
//! input that can never be valid (empty bodies, control characters, absurd lengths).

use crate::mesh::NodeId;

/// Upper bound on a message body before it ever reaches the codec.
pub const MAX_BODY_BYTES: usize = 1024;
/// Longest display name the NodeInfo announcement carries on common firmware.
pub const MAX_DISPLAY_NAME_BYTES: usize = 39;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("must not be empty")]
    Empty,

    #[error("too long (maximum {max} bytes)")]
    TooLong { max: usize },

    #[error("contains control characters: {chars}")]
    ControlCharacters { chars: String },

    #[error("not a node id: {0}")]
    InvalidNodeId(String),
}

fn control_chars(s: &str, allow: &[char]) -> Option<String> {
    let found: Vec<String> = s
        .chars()
        .filter(|c| c.is_control() && !allow.contains(c))
        .map(|c| format!("\\u{{{:04x}}}", c as u32))
        .collect();
    (!found.is_empty()).then(|| found.join(", "))
}

/// A chat body: non-blank, bounded, no control characters besides newline and tab.
pub fn validate_body(body: &str) -> Result<(), InputError> {
    if body.trim().is_empty() {
        return Err(InputError::Empty);
    }
    if body.len() > MAX_BODY_BYTES {
        return Err(InputError::TooLong {
            max: MAX_BODY_BYTES,
        });
    }
    if let Some(chars) = control_chars(body, &['\n', '\t']) {
        return Err(InputError::ControlCharacters { chars });
    }
    Ok(())
}

/// Validate and normalize (trim) a display name.
pub fn validate_display_name(name: &str) -> Result<String, InputError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(InputError::Empty);
    }
    if trimmed.len() > MAX_DISPLAY_NAME_BYTES {
        return Err(InputError::TooLong {
            max: MAX_DISPLAY_NAME_BYTES,
        });
    }
    if let Some(chars) = control_chars(trimmed, &[]) {
        return Err(InputError::ControlCharacters { chars });
    }
    Ok(trimmed.to_string())
}

/// Parse a node id written as decimal, `0x`-prefixed hex, or `!`-prefixed hex.
pub fn parse_node_id(input: &str) -> Result<NodeId, InputError> {
    let s = input.trim();
    let parsed = if let Some(hex) = s.strip_prefix('!') {
        NodeId::from_str_radix(hex, 16)
    } else if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        NodeId::from_str_radix(hex, 16)
    } else {
        s.parse::<NodeId>()
    };
    parsed.map_err(|_| InputError::InvalidNodeId(input.to_string()))
}
