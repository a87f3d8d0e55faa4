//! Dialogue Definition Structures
//!
//! A dialogue is a bipartite graph of NPC and player lines stored in an arena.
//! NPC lines may follow NPC lines (a monologue) or offer player replies;
//! player lines always lead back to NPC lines.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityRegistry, CapabilitySpec};
use crate::error::{NarrativeError, Result};
use crate::node::NodeBase;

/// A dialogue definition loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct RawDialogueFile {
    pub dialogue: RawDialogue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDialogue {
    pub id: String,
    /// Speaker name used when the caller does not supply one
    #[serde(default)]
    pub npc_name: String,
    #[serde(default)]
    pub description: String,
    pub root: Option<String>,
    pub npc_talking_shot: Option<Shot>,
    pub player_talking_shot: Option<Shot>,
    pub select_reply_shot: Option<Shot>,
    #[serde(default)]
    pub nodes: Vec<RawDialogueNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDialogueNode {
    pub id: String,
    pub speaker: Speaker,
    #[serde(default)]
    pub text: String,
    pub sound: Option<String>,
    pub animation: Option<String>,
    pub shot: Option<Shot>,
    /// Vertical position in the authoring graph; higher lines are tried first
    #[serde(default)]
    pub y: f32,
    #[serde(default)]
    pub replies: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<CapabilitySpec>,
    #[serde(default)]
    pub events: Vec<CapabilitySpec>,
}

// ============================================================================
// Resolved Dialogue Structures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Npc,
    Player,
}

fn default_pause_at_end() -> bool {
    true
}

fn default_play_rate() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotSettings {
    #[serde(default = "default_pause_at_end")]
    pub pause_at_end: bool,
    #[serde(default)]
    pub loop_count: u32,
    #[serde(default = "default_play_rate")]
    pub play_rate: f32,
}

impl Default for ShotSettings {
    fn default() -> Self {
        Self {
            pause_at_end: true,
            loop_count: 0,
            play_rate: 1.0,
        }
    }
}

/// A camera sequence the presentation layer can play
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shot {
    pub sequence: String,
    #[serde(default)]
    pub settings: ShotSettings,
}

impl Shot {
    pub fn new(sequence: &str) -> Self {
        Self {
            sequence: sequence.to_string(),
            settings: ShotSettings::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DialogueNode {
    pub node: NodeBase,
    pub speaker: Speaker,
    pub text: String,
    pub sound: Option<String>,
    pub animation: Option<String>,
    pub shot: Option<Shot>,
    pub pos_y: f32,
    /// NPC lines that can follow this one, in authoring order
    pub npc_replies: Vec<NodeId>,
    /// Player lines offered after this one, in authoring order
    pub player_replies: Vec<NodeId>,
}

impl DialogueNode {
    pub fn name(&self) -> &str {
        self.node.id_str()
    }

    pub fn is_npc(&self) -> bool {
        self.speaker == Speaker::Npc
    }
}

#[derive(Debug, Clone)]
pub struct DialogueAsset {
    pub id: String,
    pub npc_name: String,
    pub description: String,
    pub npc_talking_shot: Option<Shot>,
    pub player_talking_shot: Option<Shot>,
    pub select_reply_shot: Option<Shot>,
    root: Option<NodeId>,
    nodes: Vec<DialogueNode>,
}

impl DialogueAsset {
    pub fn new(id: &str, npc_name: &str) -> Self {
        Self {
            id: id.to_string(),
            npc_name: npc_name.to_string(),
            description: String::new(),
            npc_talking_shot: None,
            player_talking_shot: None,
            select_reply_shot: None,
            root: None,
            nodes: Vec::new(),
        }
    }

    pub fn add_node(&mut self, speaker: Speaker, id: &str, text: &str) -> NodeId {
        let node_id = NodeId(self.nodes.len());
        self.nodes.push(DialogueNode {
            node: NodeBase::new(id),
            speaker,
            text: text.to_string(),
            sound: None,
            animation: None,
            shot: None,
            pos_y: 0.0,
            npc_replies: Vec::new(),
            player_replies: Vec::new(),
        });
        node_id
    }

    pub fn add_npc(&mut self, id: &str, text: &str, pos_y: f32) -> NodeId {
        let node_id = self.add_node(Speaker::Npc, id, text);
        self.nodes[node_id.0].pos_y = pos_y;
        node_id
    }

    pub fn add_player(&mut self, id: &str, text: &str) -> NodeId {
        self.add_node(Speaker::Player, id, text)
    }

    /// Connect `from` to `to`. Player lines cannot lead to player lines.
    pub fn link(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        let from_speaker = self.nodes[from.0].speaker;
        match (from_speaker, self.nodes[to.0].speaker) {
            (Speaker::Player, Speaker::Player) => Err(NarrativeError::InvalidTemplate(format!(
                "dialogue '{}': player line '{}' cannot lead to player line '{}'",
                self.id,
                self.nodes[from.0].name(),
                self.nodes[to.0].name()
            ))),
            (_, Speaker::Npc) => {
                self.nodes[from.0].npc_replies.push(to);
                Ok(())
            }
            (Speaker::Npc, Speaker::Player) => {
                self.nodes[from.0].player_replies.push(to);
                Ok(())
            }
        }
    }

    /// The root must be an NPC line
    pub fn set_root(&mut self, root: NodeId) -> Result<()> {
        if !self.nodes[root.0].is_npc() {
            return Err(NarrativeError::InvalidTemplate(format!(
                "dialogue '{}' root '{}' is not an NPC line",
                self.id,
                self.nodes[root.0].name()
            )));
        }
        self.root = Some(root);
        Ok(())
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &DialogueNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut DialogueNode {
        &mut self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&DialogueNode> {
        self.nodes.get(id.0)
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|node| node.name() == name)
            .map(NodeId)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_names(&self, ids: &[NodeId]) -> Vec<String> {
        ids.iter().map(|id| self.node(*id).name().to_string()).collect()
    }

    /// Resolve node names from the wire back into ids
    pub fn resolve_names(&self, names: &[String]) -> Result<Vec<NodeId>> {
        names
            .iter()
            .map(|name| {
                self.find_node(name).ok_or_else(|| NarrativeError::UnknownNode {
                    dialogue: self.id.clone(),
                    node: name.clone(),
                })
            })
            .collect()
    }

    /// Resolve a dialogue from raw TOML data
    pub fn from_raw(raw: &RawDialogue, capabilities: &CapabilityRegistry) -> Result<Self> {
        let mut dialogue = DialogueAsset::new(&raw.id, &raw.npc_name);
        dialogue.description = raw.description.clone();
        dialogue.npc_talking_shot = raw.npc_talking_shot.clone();
        dialogue.player_talking_shot = raw.player_talking_shot.clone();
        dialogue.select_reply_shot = raw.select_reply_shot.clone();

        let mut ids: HashMap<&str, NodeId> = HashMap::new();
        for raw_node in &raw.nodes {
            if raw_node.id.is_empty() {
                return Err(NarrativeError::InvalidTemplate(format!(
                    "dialogue '{}' has a line with no id",
                    raw.id
                )));
            }
            let node_id = dialogue.add_node(raw_node.speaker, &raw_node.id, &raw_node.text);
            if ids.insert(raw_node.id.as_str(), node_id).is_some() {
                return Err(NarrativeError::InvalidTemplate(format!(
                    "dialogue '{}' has more than one line named '{}'",
                    raw.id, raw_node.id
                )));
            }

            let node = dialogue.node_mut(node_id);
            node.node =
                capabilities.build_node(&raw_node.id, &raw_node.conditions, &raw_node.events)?;
            node.sound = raw_node.sound.clone();
            node.animation = raw_node.animation.clone();
            node.shot = raw_node.shot.clone();
            node.pos_y = raw_node.y;
        }

        let lookup = |name: &str| {
            ids.get(name).copied().ok_or_else(|| NarrativeError::UnknownNode {
                dialogue: raw.id.clone(),
                node: name.to_string(),
            })
        };

        for raw_node in &raw.nodes {
            let from = lookup(&raw_node.id)?;
            for reply in &raw_node.replies {
                dialogue.link(from, lookup(reply)?)?;
            }
        }

        if let Some(ref root) = raw.root {
            dialogue.set_root(lookup(root)?)?;
        }

        Ok(dialogue)
    }
}
