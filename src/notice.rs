//! Notifications queued for the host (UI, chat log, analytics).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NarrativeNotice {
    QuestStarted {
        quest: String,
    },
    QuestRestarted {
        quest: String,
    },
    QuestForgotten {
        quest: String,
    },
    QuestNewState {
        quest: String,
        state: String,
        description: String,
    },
    QuestTaskProgress {
        quest: String,
        branch: String,
        task: String,
        current: u32,
        required: u32,
    },
    QuestBranchCompleted {
        quest: String,
        branch: String,
    },
    QuestSucceeded {
        quest: String,
        message: String,
    },
    QuestFailed {
        quest: String,
        message: String,
    },
    /// Only raised for tasks the task catalog knows about
    TaskCompleted {
        task: String,
        argument: String,
    },
    DialogueBegan {
        dialogue: String,
        npc_name: String,
    },
    DialogueUpdated {
        dialogue: String,
        npc_lines: Vec<String>,
        player_replies: Vec<String>,
    },
    DialogueFinished {
        dialogue: String,
    },
}

impl NarrativeNotice {
    pub fn quest_id(&self) -> Option<&str> {
        match self {
            NarrativeNotice::QuestStarted { quest }
            | NarrativeNotice::QuestRestarted { quest }
            | NarrativeNotice::QuestForgotten { quest }
            | NarrativeNotice::QuestNewState { quest, .. }
            | NarrativeNotice::QuestTaskProgress { quest, .. }
            | NarrativeNotice::QuestBranchCompleted { quest, .. }
            | NarrativeNotice::QuestSucceeded { quest, .. }
            | NarrativeNotice::QuestFailed { quest, .. } => Some(quest),
            _ => None,
        }
    }
}
