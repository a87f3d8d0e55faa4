//! Error type shared across the narrative runtime.

use crate::quest::QuestCompletion;

#[derive(Debug, thiserror::Error)]
pub enum NarrativeError {
    #[error("quest '{quest}' has a state with no name")]
    UnnamedState { quest: String },

    #[error("quest '{quest}' has more than one state named '{state}'")]
    DuplicateState { quest: String, state: String },

    #[error("quest '{quest}' has no start state")]
    NoStartState { quest: String },

    #[error("quest '{quest}' has no state named '{state}'")]
    UnknownState { quest: String, state: String },

    #[error("quest '{quest}' is already tracked ({completion})")]
    AlreadyTracked {
        quest: String,
        completion: QuestCompletion,
    },

    #[error("quest '{0}' is not tracked")]
    NotTracked(String),

    #[error("unknown quest '{0}'")]
    UnknownQuest(String),

    #[error("unknown dialogue '{0}'")]
    UnknownDialogue(String),

    #[error("dialogue '{0}' has no root node")]
    MissingRoot(String),

    #[error("dialogue '{dialogue}' has no node '{node}'")]
    UnknownNode { dialogue: String, node: String },

    #[error("not in a dialogue")]
    NotInDialogue,

    #[error("{operation} requires authority")]
    NotAuthority { operation: &'static str },

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("unknown {category} kind '{kind}'")]
    UnknownCapability { category: &'static str, kind: String },

    #[error("invalid parameters for '{kind}': {reason}")]
    InvalidParams { kind: String, reason: String },

    #[error("script error: {0}")]
    Script(String),

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("snapshot encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("snapshot decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl From<mlua::Error> for NarrativeError {
    fn from(e: mlua::Error) -> Self {
        NarrativeError::Script(e.to_string())
    }
}

pub type Result<T, E = NarrativeError> = std::result::Result<T, E>;
