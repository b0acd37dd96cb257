//! Single-key mutation commands and their log encoding.
//!
//! A [`Command`] is what the replicated store proposes to the consensus
//! engine and what the deterministic FSM decodes on every node. The wire
//! format is JSON with the canonical field order `type`, `key`, `value`
//! (struct declaration order), with `value` omitted for deletions:
//!
//! ```text
//! {"type":1,"key":"color","value":"red"}
//! {"type":2,"key":"color"}
//! ```

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use tessera_common::{Error, Result};

/// The kind of a replicated command.
///
/// The integer tags are part of the wire contract; changing them breaks
/// decoding of existing logs and snapshots. There is deliberately no
/// `Get` variant: reads are served locally and never enter the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Create or overwrite a key.
    Set = 1,
    /// Remove a key. Deleting a missing key succeeds.
    Delete = 2,
}

impl Serialize for CommandKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for CommandKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            1 => Ok(CommandKind::Set),
            2 => Ok(CommandKind::Delete),
            other => Err(de::Error::custom(format!("unknown command type {other}"))),
        }
    }
}

/// A single-key mutation carried by one log entry.
///
/// # Examples
///
/// ```
/// use tessera_protocol::Command;
///
/// let cmd = Command::set("color", "red");
/// let bytes = cmd.encode().unwrap();
/// assert_eq!(Command::decode(&bytes).unwrap(), cmd);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// What to do with the key.
    #[serde(rename = "type")]
    pub kind: CommandKind,
    /// The key being mutated.
    pub key: String,
    /// The new value; present exactly when `kind` is [`CommandKind::Set`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Command {
    /// Build a `Set` command.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command {
            kind: CommandKind::Set,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Build a `Delete` command.
    pub fn delete(key: impl Into<String>) -> Self {
        Command {
            kind: CommandKind::Delete,
            key: key.into(),
            value: None,
        }
    }

    /// Encode the command into its canonical log representation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encoding`] if serialization fails; this indicates
    /// a bug rather than bad input.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Encoding(e.to_string()))
    }

    /// Decode a command from the bytes of a committed log entry.
    ///
    /// Decoding is strict: unknown `type` tags, syntactically invalid
    /// JSON, a `Set` without a value and a `Delete` carrying one all fail
    /// with [`Error::Malformed`]. A malformed entry fails only its own
    /// future; the apply loop keeps going.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let cmd: Command =
            serde_json::from_slice(data).map_err(|e| Error::Malformed(e.to_string()))?;
        match cmd.kind {
            CommandKind::Set if cmd.value.is_none() => {
                Err(Error::Malformed("set command without a value".into()))
            }
            CommandKind::Delete if cmd.value.is_some() => {
                Err(Error::Malformed("delete command with a value".into()))
            }
            _ => Ok(cmd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_encodes_canonically() {
        let bytes = Command::set("color", "red").encode().unwrap();
        assert_eq!(bytes, br#"{"type":1,"key":"color","value":"red"}"#);
    }

    #[test]
    fn test_delete_omits_value() {
        let bytes = Command::delete("color").encode().unwrap();
        assert_eq!(bytes, br#"{"type":2,"key":"color"}"#);
    }

    #[test]
    fn test_roundtrip_set() {
        let cmd = Command::set("k", "v");
        let decoded = Command::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_roundtrip_delete() {
        let cmd = Command::delete("k");
        let decoded = Command::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_empty_value_is_preserved() {
        let cmd = Command::set("k", "");
        let decoded = Command::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded.value.as_deref(), Some(""));
    }

    #[test]
    fn test_value_containing_delimiters() {
        // Quotes, braces and commas must survive the JSON framing.
        let cmd = Command::set("k", r#"a,"b":{c}"#);
        let decoded = Command::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_unknown_type_tag_is_malformed() {
        let err = Command::decode(br#"{"type":7,"key":"k"}"#).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "got {err:?}");
    }

    #[test]
    fn test_get_has_no_wire_representation() {
        // The original tag 0 belonged to Get; it must not decode.
        let err = Command::decode(br#"{"type":0,"key":"k"}"#).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = Command::decode(&[0xff, 0xfe, 0xfd]).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_set_without_value_is_malformed() {
        let err = Command::decode(br#"{"type":1,"key":"k"}"#).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_delete_with_value_is_malformed() {
        let err = Command::decode(br#"{"type":2,"key":"k","value":"v"}"#).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_key_up_to_64_bytes() {
        let key = "k".repeat(64);
        let cmd = Command::set(key.clone(), "v");
        let decoded = Command::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded.key, key);
    }
}
