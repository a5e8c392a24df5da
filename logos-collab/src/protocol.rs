//! JSON wire protocol.
//!
//! One text frame carries one event, tagged by `type`:
//!
//! ```text
//! client → server   {"type":"lock","layerId":"sleeve-1"}
//! server → client   {"type":"layerLocked","layerId":"sleeve-1","userId":"…","expiresAt":…}
//! ```
//!
//! Replies go only to the requesting connection; room notifications go to
//! every other connection on the document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CollabError, Result};
use crate::locks::LayerLock;
use crate::presence::Session;
use crate::update_log::{CatchUp, UpdateEvent};
use crate::versions::{Version, VersionDiff};
use crate::{ConnectionId, DocumentId, DocumentState, LayerId, UserId};

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Join {
        document_id: DocumentId,
        user_id: UserId,
    },
    Leave,
    Heartbeat,
    Edit {
        #[serde(default)]
        layer_id: Option<LayerId>,
        action: String,
        #[serde(default)]
        payload: Value,
    },
    Lock {
        layer_id: LayerId,
    },
    Unlock {
        layer_id: LayerId,
    },
    /// Missed events after a timestamp or a sequence number. With neither,
    /// everything retained is returned.
    CatchUp {
        #[serde(default)]
        since_timestamp: Option<u64>,
        #[serde(default)]
        since_sequence: Option<u64>,
    },
    CreateVersion {
        #[serde(default)]
        message: Option<String>,
    },
    ListVersions {
        #[serde(default)]
        limit: Option<usize>,
    },
    RestoreVersion {
        version: u64,
    },
    CompareVersions {
        v1: u64,
        v2: u64,
    },
    Ping,
}

impl ClientEvent {
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Events sent by the server, as replies or room notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Reply to `join`: who is here and what is locked.
    Joined {
        session: Session,
        active_users: Vec<Session>,
        locks: Vec<LayerLock>,
        latest_sequence: u64,
    },
    Left,
    UserJoined {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    UserLeft {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    LayerLocked {
        layer_id: LayerId,
        user_id: UserId,
        expires_at: u64,
    },
    LayerUnlocked {
        layer_id: LayerId,
        user_id: UserId,
    },
    LockRejected {
        layer_id: LayerId,
        holder: UserId,
    },
    Edited {
        event: UpdateEvent,
    },
    VersionCreated {
        version: Version,
    },
    VersionRestored {
        version: Version,
        state: DocumentState,
    },
    CatchUp {
        events: Vec<UpdateEvent>,
    },
    ResyncRequired {
        oldest_retained: Option<u64>,
        latest_sequence: u64,
    },
    Versions {
        versions: Vec<Version>,
    },
    VersionDiff {
        diff: VersionDiff,
    },
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
    Pong,
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ServerEvent::Error { .. })
    }
}

impl From<&CollabError> for ServerEvent {
    fn from(e: &CollabError) -> Self {
        ServerEvent::Error {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

impl From<CatchUp> for ServerEvent {
    fn from(catch_up: CatchUp) -> Self {
        match catch_up {
            CatchUp::Events(events) => ServerEvent::CatchUp { events },
            CatchUp::ResyncRequired {
                oldest_retained,
                latest_sequence,
            } => ServerEvent::ResyncRequired {
                oldest_retained,
                latest_sequence,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_decode_join() {
        let doc = Uuid::new_v4();
        let user = Uuid::new_v4();
        let text = json!({ "type": "join", "documentId": doc, "userId": user }).to_string();
        assert_eq!(
            ClientEvent::decode(&text).unwrap(),
            ClientEvent::Join {
                document_id: doc,
                user_id: user
            }
        );
    }

    #[test]
    fn test_decode_optional_fields_default() {
        let edit = ClientEvent::decode(r#"{"type":"edit","action":"cursor.move"}"#).unwrap();
        assert_eq!(
            edit,
            ClientEvent::Edit {
                layer_id: None,
                action: "cursor.move".into(),
                payload: Value::Null
            }
        );

        let catch_up = ClientEvent::decode(r#"{"type":"catchUp","sinceSequence":4}"#).unwrap();
        assert_eq!(
            catch_up,
            ClientEvent::CatchUp {
                since_timestamp: None,
                since_sequence: Some(4)
            }
        );

        assert_eq!(ClientEvent::decode(r#"{"type":"leave"}"#).unwrap(), ClientEvent::Leave);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = ClientEvent::decode(r#"{"type":"teleport"}"#).unwrap_err();
        assert!(matches!(err, CollabError::Protocol(_)));
        assert_eq!(err.code(), "protocol_error");
    }

    #[test]
    fn test_server_event_wire_shape() {
        let user = Uuid::new_v4();
        let text = ServerEvent::LayerLocked {
            layer_id: "sleeve-1".into(),
            user_id: user,
            expires_at: 42,
        }
        .encode()
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "layerLocked");
        assert_eq!(value["layerId"], "sleeve-1");
        assert_eq!(value["expiresAt"], 42);
    }

    #[test]
    fn test_error_event_from_collab_error() {
        let holder = Uuid::new_v4();
        let event = ServerEvent::from(&CollabError::LayerLocked {
            layer_id: "a".into(),
            holder,
        });
        match event {
            ServerEvent::Error {
                code, retryable, ..
            } => {
                assert_eq!(code, "layer_locked");
                assert!(retryable);
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[test]
    fn test_resync_from_catch_up() {
        let event = ServerEvent::from(CatchUp::ResyncRequired {
            oldest_retained: Some(7),
            latest_sequence: 20,
        });
        let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "resyncRequired");
        assert_eq!(value["oldestRetained"], 7);
    }
}
