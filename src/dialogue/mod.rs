//! Dialogue System Module
//!
//! Branching NPC/player conversations: the authored graph, the walker that
//! picks what can be said right now, and line-by-line playback.

pub mod definition;
pub mod playback;
pub mod walker;

pub use definition::{
    DialogueAsset, DialogueNode, NodeId, RawDialogueFile, Shot, ShotSettings, Speaker,
};
pub use playback::{DialoguePlayback, LineRequest, PlaybackState, Presenter};
pub use walker::DialogueWalker;
