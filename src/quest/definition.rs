//! Quest Definition Structures
//!
//! Quest templates are authored as TOML and resolved into an arena of states
//! and branches addressed by [`StateId`] / [`BranchId`]. Templates are shared
//! read-only between every actor running the quest.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::capability::{CapabilityRegistry, CapabilitySpec};
use crate::error::{NarrativeError, Result};
use crate::ledger::make_task_string;
use crate::node::NodeBase;

/// A quest definition loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct RawQuestFile {
    pub quest: RawQuest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawQuest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Defaults to the first state in the file
    pub start_state: Option<String>,
    #[serde(default)]
    pub states: Vec<RawState>,
    #[serde(default)]
    pub branches: Vec<RawBranch>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawState {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub completion: StateCompletion,
    #[serde(default)]
    pub events: Vec<CapabilitySpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawBranch {
    pub id: Option<String>,
    pub from: String,
    pub to: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tasks: Vec<RawTask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTask {
    pub task: String,
    pub argument: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub retroactive: bool,
}

fn default_quantity() -> u32 {
    1
}

// ============================================================================
// Resolved Quest Structures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchId(pub usize);

/// What entering a state means for the quest as a whole
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateCompletion {
    #[default]
    Continue,
    Accept,
    Reject,
}

impl StateCompletion {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StateCompletion::Continue)
    }
}

/// A task requirement on a branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestTask {
    /// Canonical task string this requirement counts
    pub task: String,
    pub quantity: u32,
    /// Seed progress from the ledger when the branch is reached
    pub retroactive: bool,
}

impl QuestTask {
    pub fn new(task: &str, argument: &str, quantity: u32) -> Self {
        Self {
            task: make_task_string(task, argument),
            quantity,
            retroactive: false,
        }
    }

    pub fn retroactive(mut self) -> Self {
        self.retroactive = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct QuestState {
    /// Node id is the state name
    pub node: NodeBase,
    pub description: String,
    pub completion: StateCompletion,
    /// Outgoing branches in authoring order
    pub branches: Vec<BranchId>,
}

impl QuestState {
    pub fn name(&self) -> &str {
        self.node.id_str()
    }
}

#[derive(Debug, Clone)]
pub struct QuestBranch {
    pub node: NodeBase,
    pub description: String,
    pub owner: StateId,
    /// A branch without a destination never transitions
    pub destination: Option<StateId>,
    pub tasks: Vec<QuestTask>,
}

impl QuestBranch {
    pub fn name(&self) -> &str {
        self.node.id_str()
    }
}

#[derive(Debug, Clone)]
pub struct QuestTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    start: Option<StateId>,
    states: Vec<QuestState>,
    branches: Vec<QuestBranch>,
}

impl QuestTemplate {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            start: None,
            states: Vec::new(),
            branches: Vec::new(),
        }
    }

    /// Add a state. The first state added becomes the start state unless
    /// [`set_start`](Self::set_start) picks another.
    pub fn add_state(&mut self, name: &str, completion: StateCompletion) -> StateId {
        let id = StateId(self.states.len());
        self.states.push(QuestState {
            node: NodeBase::new(name),
            description: String::new(),
            completion,
            branches: Vec::new(),
        });
        if self.start.is_none() {
            self.start = Some(id);
        }
        id
    }

    pub fn add_branch(
        &mut self,
        from: StateId,
        to: Option<StateId>,
        tasks: Vec<QuestTask>,
    ) -> BranchId {
        let id = BranchId(self.branches.len());
        self.branches.push(QuestBranch {
            node: NodeBase::new(&format!("branch_{}", id.0)),
            description: String::new(),
            owner: from,
            destination: to,
            tasks,
        });
        self.states[from.0].branches.push(id);
        id
    }

    pub fn set_start(&mut self, state: StateId) {
        self.start = Some(state);
    }

    pub fn state(&self, id: StateId) -> &QuestState {
        &self.states[id.0]
    }

    pub fn state_mut(&mut self, id: StateId) -> &mut QuestState {
        &mut self.states[id.0]
    }

    pub fn branch(&self, id: BranchId) -> &QuestBranch {
        &self.branches[id.0]
    }

    pub fn branch_mut(&mut self, id: BranchId) -> &mut QuestBranch {
        &mut self.branches[id.0]
    }

    pub fn states(&self) -> impl Iterator<Item = (StateId, &QuestState)> {
        self.states
            .iter()
            .enumerate()
            .map(|(index, state)| (StateId(index), state))
    }

    pub fn branches(&self) -> impl Iterator<Item = (BranchId, &QuestBranch)> {
        self.branches
            .iter()
            .enumerate()
            .map(|(index, branch)| (BranchId(index), branch))
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn find_state(&self, name: &str) -> Option<StateId> {
        if name.is_empty() {
            return None;
        }
        self.states
            .iter()
            .position(|state| state.name() == name)
            .map(StateId)
    }

    pub fn find_branch(&self, name: &str) -> Option<BranchId> {
        self.branches
            .iter()
            .position(|branch| branch.name() == name)
            .map(BranchId)
    }

    pub fn start_state(&self) -> Option<StateId> {
        self.start
    }

    /// Every state needs a unique, non-empty name and there must be a start
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for state in &self.states {
            let name = state.name();
            if name.is_empty() {
                return Err(NarrativeError::UnnamedState {
                    quest: self.id.clone(),
                });
            }
            if !seen.insert(name) {
                return Err(NarrativeError::DuplicateState {
                    quest: self.id.clone(),
                    state: name.to_string(),
                });
            }
        }

        if self.start.is_none() {
            return Err(NarrativeError::NoStartState {
                quest: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Pick the state a new instance begins in: an explicit state name, or the
    /// designated start state.
    pub fn resolve_start(&self, start_state: Option<&str>) -> Result<StateId> {
        match start_state.filter(|name| !name.is_empty()) {
            Some(name) => self
                .find_state(name)
                .ok_or_else(|| NarrativeError::UnknownState {
                    quest: self.id.clone(),
                    state: name.to_string(),
                }),
            None => self.start.ok_or_else(|| NarrativeError::NoStartState {
                quest: self.id.clone(),
            }),
        }
    }

    /// Resolve a quest from raw TOML data
    pub fn from_raw(raw: &RawQuest, capabilities: &CapabilityRegistry) -> Result<Self> {
        let mut quest = QuestTemplate::new(&raw.id, &raw.name);
        quest.description = raw.description.clone();

        for raw_state in &raw.states {
            let id = quest.add_state(&raw_state.id, raw_state.completion);
            let state = quest.state_mut(id);
            state.description = raw_state.description.clone();
            state.node.events = raw_state
                .events
                .iter()
                .map(|spec| capabilities.build_event(spec))
                .collect::<Result<Vec<_>>>()?;
        }

        if let Some(ref start) = raw.start_state {
            let start = quest.find_state(start).ok_or_else(|| {
                NarrativeError::InvalidTemplate(format!(
                    "quest '{}' starts in unknown state '{}'",
                    raw.id, start
                ))
            })?;
            quest.set_start(start);
        }

        for (index, raw_branch) in raw.branches.iter().enumerate() {
            let from = quest.find_state(&raw_branch.from).ok_or_else(|| {
                NarrativeError::InvalidTemplate(format!(
                    "quest '{}' branch {} leaves unknown state '{}'",
                    raw.id, index, raw_branch.from
                ))
            })?;

            let to = match raw_branch.to {
                Some(ref to) => Some(quest.find_state(to).ok_or_else(|| {
                    NarrativeError::InvalidTemplate(format!(
                        "quest '{}' branch {} leads to unknown state '{}'",
                        raw.id, index, to
                    ))
                })?),
                None => {
                    warn!(
                        "Quest '{}' branch {} from '{}' has no destination",
                        raw.id, index, raw_branch.from
                    );
                    None
                }
            };

            let tasks = raw_branch
                .tasks
                .iter()
                .map(|t| QuestTask {
                    task: make_task_string(&t.task, &t.argument),
                    quantity: t.quantity,
                    retroactive: t.retroactive,
                })
                .collect();

            let branch_id = quest.add_branch(from, to, tasks);
            let branch = quest.branch_mut(branch_id);
            branch.description = raw_branch.description.clone();
            if let Some(ref id) = raw_branch.id {
                branch.node.id = Some(id.clone());
            }
        }

        Ok(quest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUARD_QUEST: &str = r#"
        [quest]
        id = "guard_intro"
        name = "Meet the Guard"
        description = "Introduce yourself to the town guard"
        start_state = "find_guard"

        [[quest.states]]
        id = "find_guard"
        description = "Find the guard at the gate"
        events = [{ kind = "set_fact", key = "looking_for_guard", value = 1 }]

        [[quest.states]]
        id = "done"
        description = "You met the guard"
        completion = "accept"

        [[quest.branches]]
        id = "talk"
        from = "find_guard"
        to = "done"
        description = "Talk to the guard"
        tasks = [{ task = "Talk", argument = "Guard" }]
    "#;

    #[test]
    fn test_quest_from_toml() {
        let raw: RawQuestFile = toml::from_str(GUARD_QUEST).unwrap();
        let quest = QuestTemplate::from_raw(&raw.quest, &CapabilityRegistry::new()).unwrap();

        assert_eq!(quest.id, "guard_intro");
        assert_eq!(quest.state_count(), 2);
        quest.validate().unwrap();

        let start = quest.start_state().unwrap();
        assert_eq!(quest.state(start).name(), "find_guard");
        assert_eq!(quest.state(start).node.events.len(), 1);

        let done = quest.find_state("done").unwrap();
        assert_eq!(quest.state(done).completion, StateCompletion::Accept);

        let talk = quest.find_branch("talk").unwrap();
        let branch = quest.branch(talk);
        assert_eq!(branch.owner, start);
        assert_eq!(branch.destination, Some(done));
        assert_eq!(branch.tasks, vec![QuestTask::new("Talk", "Guard", 1)]);
    }

    #[test]
    fn test_unknown_branch_destination_fails_to_load() {
        let source = GUARD_QUEST.replace("to = \"done\"", "to = \"nowhere\"");
        let raw: RawQuestFile = toml::from_str(&source).unwrap();
        let err = QuestTemplate::from_raw(&raw.quest, &CapabilityRegistry::new()).unwrap_err();
        assert!(matches!(err, NarrativeError::InvalidTemplate(_)));
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let mut quest = QuestTemplate::new("q", "Quest");
        quest.add_state("start", StateCompletion::Continue);
        quest.add_state("", StateCompletion::Accept);

        assert!(matches!(quest.validate(), Err(NarrativeError::UnnamedState { .. })));
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut quest = QuestTemplate::new("q", "Quest");
        quest.add_state("start", StateCompletion::Continue);
        quest.add_state("start", StateCompletion::Accept);

        match quest.validate() {
            Err(NarrativeError::DuplicateState { state, .. }) => assert_eq!(state, "start"),
            other => panic!("expected duplicate state error, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_start() {
        let mut quest = QuestTemplate::new("q", "Quest");
        let a = quest.add_state("a", StateCompletion::Continue);
        let b = quest.add_state("b", StateCompletion::Continue);

        assert_eq!(quest.resolve_start(None).unwrap(), a);
        assert_eq!(quest.resolve_start(Some("")).unwrap(), a);
        assert_eq!(quest.resolve_start(Some("b")).unwrap(), b);
        assert!(matches!(
            quest.resolve_start(Some("c")),
            Err(NarrativeError::UnknownState { .. })
        ));

        assert!(QuestTemplate::new("empty", "Empty").resolve_start(None).is_err());
    }
}
