//! Quest System Module
//!
//! Quests are state machines: named states joined by branches that complete
//! once their task requirements are met.

pub mod definition;
pub mod state;

pub use definition::{
    BranchId, QuestBranch, QuestState, QuestTask, QuestTemplate, RawQuestFile, StateCompletion,
    StateId,
};
pub use state::{QuestCompletion, QuestInstance, QuestProgress, QuestScope};
