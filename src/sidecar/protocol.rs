//! The NDJSON contract spoken over the sidecar's standard streams.
//!
//! One JSON object per LF-terminated line in each direction. The sidecar
//! merges occasional non-JSON noise into its output, so event parsing is
//! lenient: anything that does not parse as a known event is dropped.

use serde::{Deserialize, Serialize};

/// Commands written to the sidecar's stdin.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// Send a DM to `dest`.
    Send {
        id: String,
        dest: String,
        payload_b64: String,
    },
    /// Polite shutdown; the sidecar closes its overlay client and exits.
    Close,
}

/// Events read from the sidecar's stdout.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "ev", rename_all = "snake_case")]
pub enum Event {
    /// The overlay address was published; the client is connected.
    Ready { addr: String },
    /// An inbound DM from peer `src`.
    Message { src: String, payload_b64: String },
    /// Acknowledgment of a successful send. Informational only.
    Sent { id: String, dest: String },
    /// Something went wrong, possibly correlated to a send.
    Error {
        #[serde(default)]
        id: Option<String>,
        message: String,
    },
}

/// Parse one output line, dropping anything malformed or unknown.
pub fn parse_event(line: &str) -> Option<Event> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str(line).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_serialize_to_the_wire_shape() {
        let cmd = Command::Send {
            id: "abc".to_owned(),
            dest: "peer.0x1".to_owned(),
            payload_b64: "aGk=".to_owned(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(
            json,
            r#"{"op":"send","id":"abc","dest":"peer.0x1","payload_b64":"aGk="}"#
        );
        assert_eq!(serde_json::to_string(&Command::Close).unwrap(), r#"{"op":"close"}"#);
    }

    #[test]
    fn events_parse_from_the_wire_shape() {
        assert_eq!(
            parse_event(r#"{"ev":"ready","addr":"forwarder.0xab"}"#),
            Some(Event::Ready {
                addr: "forwarder.0xab".to_owned()
            })
        );
        assert_eq!(
            parse_event(r#"{"ev":"sent","id":"1","dest":"peer"}"#),
            Some(Event::Sent {
                id: "1".to_owned(),
                dest: "peer".to_owned()
            })
        );
        assert_eq!(
            parse_event(r#"{"ev":"error","message":"boom"}"#),
            Some(Event::Error {
                id: None,
                message: "boom".to_owned()
            })
        );
    }

    #[test]
    fn noise_is_dropped() {
        assert_eq!(parse_event(""), None);
        assert_eq!(parse_event("   "), None);
        assert_eq!(parse_event("npm WARN deprecated whatever"), None);
        assert_eq!(parse_event(r#"{"ev":"mystery"}"#), None);
        assert_eq!(parse_event(r#"{"no_ev_at_all":1}"#), None);
    }
}
