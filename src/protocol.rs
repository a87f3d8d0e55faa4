use serde::{Deserialize, Serialize};

use crate::component::DialogueMessage;
use crate::notice::NarrativeNotice;
use crate::persistence::NarrativeSnapshot;
use crate::replication::ReplicationUpdate;

/// Colyseus ROOM_DATA code; every frame is `[13, "msgType", {data}]`
const ROOM_DATA: u64 = 13;

// ============================================================================
// Client -> Server Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "completeTask")]
    CompleteTask { task: String, argument: String },

    #[serde(rename = "beginQuest")]
    BeginQuest {
        quest: String,
        start_state: Option<String>,
    },

    #[serde(rename = "restartQuest")]
    RestartQuest {
        quest: String,
        start_state: Option<String>,
    },

    #[serde(rename = "forgetQuest")]
    ForgetQuest { quest: String },

    /// Start talking; `speaker` is the world entity, `npc_name` overrides the
    /// dialogue's own speaker name
    #[serde(rename = "beginDialogue")]
    BeginDialogue {
        dialogue: String,
        speaker: Option<String>,
        npc_name: Option<String>,
    },

    /// Player picked a reply, by node id
    #[serde(rename = "selectDialogueOption")]
    SelectDialogueOption { node: String },

    #[serde(rename = "exitDialogue")]
    ExitDialogue,

    /// Follower asks for a full snapshot, e.g. after falling behind the log
    #[serde(rename = "requestSnapshot")]
    RequestSnapshot,
}

impl ClientMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            ClientMessage::CompleteTask { .. } => "completeTask",
            ClientMessage::BeginQuest { .. } => "beginQuest",
            ClientMessage::RestartQuest { .. } => "restartQuest",
            ClientMessage::ForgetQuest { .. } => "forgetQuest",
            ClientMessage::BeginDialogue { .. } => "beginDialogue",
            ClientMessage::SelectDialogueOption { .. } => "selectDialogueOption",
            ClientMessage::ExitDialogue => "exitDialogue",
            ClientMessage::RequestSnapshot => "requestSnapshot",
        }
    }
}

// ============================================================================
// Server -> Client Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "welcome")]
    Welcome { actor: String, session_id: String },

    /// Full state; the follower applies only log entries after `sequence`
    #[serde(rename = "snapshot")]
    Snapshot {
        snapshot: NarrativeSnapshot,
        sequence: u64,
    },

    #[serde(rename = "narrativeUpdates")]
    NarrativeUpdates { updates: Vec<ReplicationUpdate> },

    #[serde(rename = "dialogue")]
    Dialogue { message: DialogueMessage },

    #[serde(rename = "notice")]
    Notice { notice: NarrativeNotice },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::Snapshot { .. } => "snapshot",
            ServerMessage::NarrativeUpdates { .. } => "narrativeUpdates",
            ServerMessage::Dialogue { .. } => "dialogue",
            ServerMessage::Notice { .. } => "notice",
            ServerMessage::Error { .. } => "error",
        }
    }
}

// ============================================================================
// MessagePack Encoding
// ============================================================================

/// Encode a server message as `[13, "msgType", {data}]`
pub fn encode_server_message(msg: &ServerMessage) -> Result<Vec<u8>, String> {
    use rmpv::Value;

    let data = match msg {
        ServerMessage::Welcome { actor, session_id } => Value::Map(vec![
            (Value::String("actor".into()), Value::String(actor.clone().into())),
            (
                Value::String("sessionId".into()),
                Value::String(session_id.clone().into()),
            ),
        ]),
        ServerMessage::Snapshot { snapshot, sequence } => Value::Map(vec![
            (Value::String("snapshot".into()), to_value(snapshot)?),
            (Value::String("sequence".into()), Value::Integer((*sequence).into())),
        ]),
        ServerMessage::NarrativeUpdates { updates } => {
            let values = updates.iter().map(to_value).collect::<Result<Vec<_>, _>>()?;
            Value::Map(vec![(Value::String("updates".into()), Value::Array(values))])
        }
        ServerMessage::Dialogue { message } => {
            Value::Map(vec![(Value::String("message".into()), to_value(message)?)])
        }
        ServerMessage::Notice { notice } => {
            Value::Map(vec![(Value::String("notice".into()), to_value(notice)?)])
        }
        ServerMessage::Error { code, message } => Value::Map(vec![
            (Value::String("code".into()), Value::String(code.clone().into())),
            (Value::String("message".into()), Value::String(message.clone().into())),
        ]),
    };

    frame(msg.msg_type(), data)
}

/// Encode a client message, used by followers and tools
pub fn encode_client_message(msg: &ClientMessage) -> Result<Vec<u8>, String> {
    use rmpv::Value;

    let mut map = Vec::new();
    let mut push = |key: &str, value: &str| {
        map.push((Value::String(key.into()), Value::String(value.into())));
    };

    match msg {
        ClientMessage::CompleteTask { task, argument } => {
            push("task", task);
            push("argument", argument);
        }
        ClientMessage::BeginQuest { quest, start_state }
        | ClientMessage::RestartQuest { quest, start_state } => {
            push("quest", quest);
            if let Some(state) = start_state {
                push("startState", state);
            }
        }
        ClientMessage::ForgetQuest { quest } => push("quest", quest),
        ClientMessage::BeginDialogue {
            dialogue,
            speaker,
            npc_name,
        } => {
            push("dialogue", dialogue);
            if let Some(speaker) = speaker {
                push("speaker", speaker);
            }
            if let Some(name) = npc_name {
                push("npcName", name);
            }
        }
        ClientMessage::SelectDialogueOption { node } => push("node", node),
        ClientMessage::ExitDialogue | ClientMessage::RequestSnapshot => {}
    }

    frame(msg.msg_type(), Value::Map(map))
}

/// Decode a client message from MessagePack format
/// Expected format: [13, "msg_type", {data}]
pub fn decode_client_message(data: &[u8]) -> Result<ClientMessage, String> {
    let (msg_type, msg_data) = unframe(data)?;

    let required = |key: &str| {
        extract_string(&msg_data, key)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("{} requires '{}'", msg_type, key))
    };

    match msg_type.as_str() {
        "completeTask" => Ok(ClientMessage::CompleteTask {
            task: required("task")?,
            argument: required("argument")?,
        }),
        "beginQuest" => Ok(ClientMessage::BeginQuest {
            quest: required("quest")?,
            start_state: extract_string(&msg_data, "startState"),
        }),
        "restartQuest" => Ok(ClientMessage::RestartQuest {
            quest: required("quest")?,
            start_state: extract_string(&msg_data, "startState"),
        }),
        "forgetQuest" => Ok(ClientMessage::ForgetQuest {
            quest: required("quest")?,
        }),
        "beginDialogue" => Ok(ClientMessage::BeginDialogue {
            dialogue: required("dialogue")?,
            speaker: extract_string(&msg_data, "speaker"),
            npc_name: extract_string(&msg_data, "npcName"),
        }),
        "selectDialogueOption" => Ok(ClientMessage::SelectDialogueOption {
            node: required("node")?,
        }),
        "exitDialogue" => Ok(ClientMessage::ExitDialogue),
        "requestSnapshot" => Ok(ClientMessage::RequestSnapshot),
        _ => Err(format!("Unknown message type: {}", msg_type)),
    }
}

/// Decode a server message on the follower side
pub fn decode_server_message(data: &[u8]) -> Result<ServerMessage, String> {
    let (msg_type, msg_data) = unframe(data)?;

    let field = |key: &str| {
        msg_data
            .as_map()
            .and_then(|map| map.iter().find(|(k, _)| k.as_str() == Some(key)))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| format!("{} is missing '{}'", msg_type, key))
    };

    match msg_type.as_str() {
        "welcome" => Ok(ServerMessage::Welcome {
            actor: extract_string(&msg_data, "actor").unwrap_or_default(),
            session_id: extract_string(&msg_data, "sessionId").unwrap_or_default(),
        }),
        "snapshot" => Ok(ServerMessage::Snapshot {
            snapshot: from_value(field("snapshot")?)?,
            sequence: field("sequence")?
                .as_u64()
                .ok_or("Snapshot sequence must be an integer")?,
        }),
        "narrativeUpdates" => Ok(ServerMessage::NarrativeUpdates {
            updates: from_value(field("updates")?)?,
        }),
        "dialogue" => Ok(ServerMessage::Dialogue {
            message: from_value(field("message")?)?,
        }),
        "notice" => Ok(ServerMessage::Notice {
            notice: from_value(field("notice")?)?,
        }),
        "error" => Ok(ServerMessage::Error {
            code: extract_string(&msg_data, "code").unwrap_or_default(),
            message: extract_string(&msg_data, "message").unwrap_or_default(),
        }),
        _ => Err(format!("Unknown message type: {}", msg_type)),
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn frame(msg_type: &str, data: rmpv::Value) -> Result<Vec<u8>, String> {
    use rmpv::Value;

    let array = Value::Array(vec![
        Value::Integer(ROOM_DATA.into()),
        Value::String(msg_type.into()),
        data,
    ]);

    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &array)
        .map_err(|e| format!("Failed to encode message: {}", e))?;
    Ok(buf)
}

fn unframe(data: &[u8]) -> Result<(String, rmpv::Value), String> {
    use std::io::Cursor;

    let mut cursor = Cursor::new(data);
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| format!("Failed to decode MessagePack: {}", e))?;

    let array = value.as_array().ok_or("Expected array")?;
    if array.len() < 2 {
        return Err("Array too short".to_string());
    }

    let protocol = array[0].as_u64().ok_or("Protocol code must be integer")?;
    if protocol != ROOM_DATA {
        return Err(format!("Unexpected protocol code: {}", protocol));
    }

    let msg_type = array[1].as_str().ok_or("Message type must be string")?;
    let msg_data = array.get(2).cloned().unwrap_or(rmpv::Value::Nil);
    Ok((msg_type.to_string(), msg_data))
}

fn to_value<T: Serialize>(value: &T) -> Result<rmpv::Value, String> {
    rmpv::ext::to_value(value).map_err(|e| format!("Failed to encode payload: {}", e))
}

fn from_value<T: serde::de::DeserializeOwned>(value: rmpv::Value) -> Result<T, String> {
    rmpv::ext::from_value(value).map_err(|e| format!("Failed to decode payload: {}", e))
}

fn extract_string(value: &rmpv::Value, key: &str) -> Option<String> {
    value.as_map().and_then(|map| {
        map.iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .and_then(|(_, v)| v.as_str().map(|s| s.to_string()))
    })
}
