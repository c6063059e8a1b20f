//! Newline-delimited JSON frames exchanged with the bridge process.
//!
//! stdin carries [`OutboundFrame`]s, stdout carries inbound frames. One JSON
//! object per line, discriminated by `"type"`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use wab_core::{
    domain::Jid,
    errors::Error,
    messaging::types::{
        ConnectionState, ConnectionUpdate, CredentialUpdate, DisconnectInfo, InboundMessage,
        MessageContent, MessagesUpsert, SessionEvent, UpsertKind, VersionInfo,
    },
    Result,
};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame<'a> {
    Init {
        auth_dir: &'a str,
        creds: Option<&'a serde_json::Value>,
        keys: &'a BTreeMap<String, serde_json::Value>,
    },
    Send {
        id: u64,
        to: &'a str,
        text: &'a str,
    },
    Close,
}

impl OutboundFrame<'_> {
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum InboundFrame {
    #[serde(rename = "version")]
    Version {
        version: Vec<u32>,
        #[serde(default)]
        is_latest: bool,
    },
    #[serde(rename = "connection.update")]
    ConnectionUpdate {
        #[serde(default)]
        connection: Option<WireConnection>,
        #[serde(default)]
        last_disconnect: Option<WireDisconnect>,
        #[serde(default)]
        qr: Option<String>,
    },
    #[serde(rename = "messages.upsert")]
    MessagesUpsert {
        kind: String,
        #[serde(default)]
        messages: Vec<WireMessage>,
    },
    #[serde(rename = "creds.update")]
    CredsUpdate {
        #[serde(default)]
        creds: Option<serde_json::Value>,
        #[serde(default)]
        keys: BTreeMap<String, Option<serde_json::Value>>,
    },
    #[serde(rename = "send.result")]
    SendResult {
        id: u64,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireConnection {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Deserialize)]
struct WireDisconnect {
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    key: WireKey,
    #[serde(default)]
    message: Option<WireContent>,
}

#[derive(Debug, Default, Deserialize)]
struct WireKey {
    #[serde(default)]
    remote_jid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    conversation: Option<String>,
    #[serde(default)]
    extended_text_message: Option<WireExtendedText>,
}

#[derive(Debug, Deserialize)]
struct WireExtendedText {
    #[serde(default)]
    text: Option<String>,
}

/// A decoded stdout line.
#[derive(Debug)]
pub enum Decoded {
    Event(SessionEvent),
    SendResult {
        id: u64,
        result: std::result::Result<(), String>,
    },
    /// A frame type this client does not handle.
    Ignored,
}

pub fn decode_line(line: &str) -> Result<Decoded> {
    let frame: InboundFrame = serde_json::from_str(line)?;
    Ok(match frame {
        InboundFrame::Version { version, is_latest } => {
            Decoded::Event(SessionEvent::Version(VersionInfo { version, is_latest }))
        }
        InboundFrame::ConnectionUpdate {
            connection,
            last_disconnect,
            qr,
        } => Decoded::Event(SessionEvent::ConnectionUpdate(ConnectionUpdate {
            connection: connection.map(|c| match c {
                WireConnection::Connecting => ConnectionState::Connecting,
                WireConnection::Open => ConnectionState::Open,
                WireConnection::Close => ConnectionState::Closed,
            }),
            last_disconnect: last_disconnect.map(|d| DisconnectInfo {
                status_code: d.status_code,
                message: d.message,
            }),
            qr,
        })),
        InboundFrame::MessagesUpsert { kind, messages } => {
            Decoded::Event(SessionEvent::MessagesUpsert(MessagesUpsert {
                kind: UpsertKind::parse(&kind),
                messages: messages.into_iter().map(into_inbound).collect(),
            }))
        }
        InboundFrame::CredsUpdate { creds, keys } => {
            Decoded::Event(SessionEvent::CredentialsUpdate(CredentialUpdate { creds, keys }))
        }
        InboundFrame::SendResult { id, ok, error } => Decoded::SendResult {
            id,
            result: if ok {
                Ok(())
            } else {
                Err(error.unwrap_or_else(|| "send rejected".to_string()))
            },
        },
        InboundFrame::Unknown => Decoded::Ignored,
    })
}

fn into_inbound(m: WireMessage) -> InboundMessage {
    InboundMessage {
        sender: m.key.remote_jid.map(Jid),
        content: m.message.map(|c| MessageContent {
            conversation: c.conversation,
            extended_text: c.extended_text_message.and_then(|e| e.text),
        }),
    }
}

/// Map a malformed line into a session error carrying a short preview.
pub fn decode_error(line: &str, err: &Error) -> Error {
    Error::Session(format!(
        "bridge frame parse failed: {err}\nstdout line: {}",
        truncate_text(line, 500)
    ))
}

pub(crate) fn truncate_text(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_connection_close_with_reason() {
        let line = r#"{"type":"connection.update","connection":"close","last_disconnect":{"status_code":401,"message":"Connection Failure"}}"#;
        let Decoded::Event(SessionEvent::ConnectionUpdate(u)) = decode_line(line).unwrap() else {
            panic!("expected connection update");
        };
        assert_eq!(u.connection, Some(ConnectionState::Closed));
        assert_eq!(
            u.last_disconnect,
            Some(DisconnectInfo {
                status_code: Some(401),
                message: Some("Connection Failure".to_string()),
            })
        );
        assert!(u.qr.is_none());
    }

    #[test]
    fn decodes_pairing_only_update() {
        let line = r#"{"type":"connection.update","qr":"2@xyz"}"#;
        let Decoded::Event(SessionEvent::ConnectionUpdate(u)) = decode_line(line).unwrap() else {
            panic!("expected connection update");
        };
        assert!(u.connection.is_none());
        assert_eq!(u.qr.as_deref(), Some("2@xyz"));
    }

    #[test]
    fn decodes_upsert_with_extended_text_and_missing_content() {
        let line = json!({
            "type": "messages.upsert",
            "kind": "notify",
            "messages": [
                {"key": {"remote_jid": "1@s.whatsapp.net"},
                 "message": {"extended_text_message": {"text": "/sendbatch hi"}}},
                {"key": {"remote_jid": "2@s.whatsapp.net"}, "message": null}
            ]
        })
        .to_string();
        let Decoded::Event(SessionEvent::MessagesUpsert(m)) = decode_line(&line).unwrap() else {
            panic!("expected upsert");
        };
        assert_eq!(m.kind, UpsertKind::Notify);
        assert_eq!(m.messages.len(), 2);
        assert_eq!(m.messages[0].text_content(), Some("/sendbatch hi"));
        assert_eq!(
            m.messages[0].sender,
            Some(Jid("1@s.whatsapp.net".to_string()))
        );
        assert!(m.messages[1].content.is_none());
    }

    #[test]
    fn decodes_creds_update_with_deleted_keys() {
        let line = r#"{"type":"creds.update","creds":{"me":1},"keys":{"pre-key:1":{"a":1},"pre-key:2":null}}"#;
        let Decoded::Event(SessionEvent::CredentialsUpdate(c)) = decode_line(line).unwrap() else {
            panic!("expected creds update");
        };
        assert_eq!(c.creds, Some(json!({"me": 1})));
        assert_eq!(c.keys.get("pre-key:1"), Some(&Some(json!({"a": 1}))));
        assert_eq!(c.keys.get("pre-key:2"), Some(&None));
    }

    #[test]
    fn decodes_send_results_and_version() {
        match decode_line(r#"{"type":"send.result","id":7,"ok":true}"#).unwrap() {
            Decoded::SendResult { id, result } => {
                assert_eq!(id, 7);
                assert!(result.is_ok());
            }
            other => panic!("unexpected {other:?}"),
        }
        match decode_line(r#"{"type":"send.result","id":8,"ok":false}"#).unwrap() {
            Decoded::SendResult { result, .. } => {
                assert_eq!(result, Err("send rejected".to_string()))
            }
            other => panic!("unexpected {other:?}"),
        }
        match decode_line(r#"{"type":"version","version":[2,3000,5],"is_latest":false}"#).unwrap()
        {
            Decoded::Event(SessionEvent::Version(v)) => {
                assert_eq!(v.dotted(), "2.3000.5");
                assert!(!v.is_latest);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_frames_are_ignored_and_garbage_errors() {
        assert!(matches!(
            decode_line(r#"{"type":"presence.update","id":"x"}"#).unwrap(),
            Decoded::Ignored
        ));
        assert!(decode_line("not json").is_err());
    }

    #[test]
    fn outbound_frames_are_single_lines() {
        let keys = BTreeMap::new();
        let creds = json!({"me": 1});
        let init = OutboundFrame::Init {
            auth_dir: "auth_info_baileys",
            creds: Some(&creds),
            keys: &keys,
        }
        .to_line()
        .unwrap();
        assert!(init.ends_with('\n'));
        assert_eq!(init.matches('\n').count(), 1);
        let v: serde_json::Value = serde_json::from_str(init.trim_end()).unwrap();
        assert_eq!(v["type"], "init");
        assert_eq!(v["creds"]["me"], 1);

        let send = OutboundFrame::Send {
            id: 3,
            to: "1@s.whatsapp.net",
            text: "line1\nline2",
        }
        .to_line()
        .unwrap();
        assert_eq!(send.matches('\n').count(), 1);
        let v: serde_json::Value = serde_json::from_str(send.trim_end()).unwrap();
        assert_eq!(v["type"], "send");
        assert_eq!(v["text"], "line1\nline2");

        assert_eq!(OutboundFrame::Close.to_line().unwrap(), "{\"type\":\"close\"}\n");
    }
}
