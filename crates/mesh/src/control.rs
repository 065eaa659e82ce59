//! Plaintext control messages for public key exchange.
//!
//! Control messages travel through the delivery pipeline like any other
//! message but are never encrypted; their content is one of:
//!
//! - `REQUEST_PUBLIC_KEY`
//! - `PUBLIC_KEY:<base64 key bundle>`

/// Content of a key request.
pub const REQUEST_PUBLIC_KEY: &str = "REQUEST_PUBLIC_KEY";

/// Prefix of a key announcement.
pub const PUBLIC_KEY_PREFIX: &str = "PUBLIC_KEY:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    RequestPublicKey,
    PublicKey(String),
}

impl ControlMessage {
    /// Parse plaintext message content. Returns `None` for anything else.
    pub fn parse(content: &str) -> Option<Self> {
        let content = content.trim();
        if content == REQUEST_PUBLIC_KEY {
            return Some(ControlMessage::RequestPublicKey);
        }
        content
            .strip_prefix(PUBLIC_KEY_PREFIX)
            .filter(|bundle| !bundle.is_empty())
            .map(|bundle| ControlMessage::PublicKey(bundle.to_string()))
    }

    pub fn to_content(&self) -> String {
        match self {
            ControlMessage::RequestPublicKey => REQUEST_PUBLIC_KEY.to_string(),
            ControlMessage::PublicKey(bundle) => format!("{}{}", PUBLIC_KEY_PREFIX, bundle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_messages() {
        assert_eq!(
            ControlMessage::parse("REQUEST_PUBLIC_KEY"),
            Some(ControlMessage::RequestPublicKey)
        );
        assert_eq!(
            ControlMessage::parse("PUBLIC_KEY:AAAA"),
            Some(ControlMessage::PublicKey("AAAA".to_string()))
        );
        assert_eq!(ControlMessage::parse("PUBLIC_KEY:"), None);
        assert_eq!(ControlMessage::parse("hello"), None);
    }

    #[test]
    fn test_to_content() {
        let announce = ControlMessage::PublicKey("abc=".to_string());
        assert_eq!(announce.to_content(), "PUBLIC_KEY:abc=");
        assert_eq!(ControlMessage::parse(&announce.to_content()), Some(announce));
    }
}
