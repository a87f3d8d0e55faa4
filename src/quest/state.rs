//! Quest State Tracking
//!
//! Runtime state of one quest for one actor: the current state, the states
//! visited so far, task progress on the current state's branches and every
//! task string the quest has seen while running.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::definition::{BranchId, QuestTemplate, StateCompletion, StateId};
use crate::error::{NarrativeError, Result};
use crate::facts::Facts;
use crate::ledger::TaskLedger;
use crate::node::{EventContext, NarrativeCommand};
use crate::notice::NarrativeNotice;
use crate::persistence::SavedQuest;

/// Completion of a quest for an actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestCompletion {
    NotStarted,
    Started,
    Succeeded,
    Failed,
}

impl QuestCompletion {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestCompletion::NotStarted => "not_started",
            QuestCompletion::Started => "started",
            QuestCompletion::Succeeded => "succeeded",
            QuestCompletion::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, QuestCompletion::Succeeded | QuestCompletion::Failed)
    }
}

impl fmt::Display for QuestCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task event did to a quest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QuestProgress {
    NoChange,
    MadeProgress,
    Updated,
    Succeeded,
    Failed,
}

/// Everything a quest touches outside itself while it runs
pub struct QuestScope<'a> {
    pub actor: &'a str,
    pub ledger: &'a TaskLedger,
    pub facts: &'a mut Facts,
    pub commands: &'a mut Vec<NarrativeCommand>,
    pub notices: &'a mut Vec<NarrativeNotice>,
}

impl QuestScope<'_> {
    fn events(&mut self) -> EventContext<'_> {
        EventContext {
            actor: self.actor,
            ledger: self.ledger,
            facts: &mut *self.facts,
            commands: &mut *self.commands,
        }
    }
}

struct RunResult {
    final_state: StateId,
    branch: Option<BranchId>,
    completion: StateCompletion,
}

#[derive(Debug, Clone)]
pub struct QuestInstance {
    template: Arc<QuestTemplate>,
    current: StateId,
    reached: BTreeSet<StateId>,
    activities: HashSet<String>,
    completion: QuestCompletion,
    /// Task progress per branch, indexed like the template's branches
    progress: Vec<Vec<u32>>,
    previous_branch: Option<BranchId>,
}

impl QuestInstance {
    fn blank(template: Arc<QuestTemplate>, start: StateId) -> Self {
        let progress = template
            .branches()
            .map(|(_, branch)| vec![0; branch.tasks.len()])
            .collect();
        Self {
            template,
            current: start,
            reached: BTreeSet::new(),
            activities: HashSet::new(),
            completion: QuestCompletion::Started,
            progress,
            previous_branch: None,
        }
    }

    /// Validate the template and enter the start state (or `start_state` when
    /// given). Nothing is touched if validation fails.
    pub fn begin(
        template: Arc<QuestTemplate>,
        start_state: Option<&str>,
        scope: &mut QuestScope<'_>,
    ) -> Result<Self> {
        template.validate()?;
        let start = template.resolve_start(start_state)?;

        let mut quest = Self::blank(template, start);
        quest.enter_state(start, scope);
        Ok(quest)
    }

    /// Rebuild a quest from a save without firing entry events
    pub fn resume(
        template: Arc<QuestTemplate>,
        saved: &SavedQuest,
        ledger: &TaskLedger,
    ) -> Result<Self> {
        template.validate()?;
        let current = template
            .find_state(&saved.current_state)
            .ok_or_else(|| NarrativeError::UnknownState {
                quest: template.id.clone(),
                state: saved.current_state.clone(),
            })?;

        let mut quest = Self::blank(Arc::clone(&template), current);
        quest.completion =
            completion_after(QuestCompletion::Started, template.state(current).completion);

        let state = template.state(current);
        for &branch_id in &state.branches {
            quest.reach_branch(branch_id, ledger);
            let branch = template.branch(branch_id);
            if let Some(saved_progress) = saved.branches.get(branch.name()) {
                for (index, task) in branch.tasks.iter().enumerate() {
                    if let Some(&value) = saved_progress.get(index) {
                        quest.progress[branch_id.0][index] = value.min(task.quantity);
                    }
                }
            }
        }

        for name in &saved.reached_states {
            match template.find_state(name) {
                Some(id) => {
                    quest.reached.insert(id);
                }
                None => warn!("Quest '{}' save names unknown state '{}'", template.id, name),
            }
        }
        quest.reached.insert(current);

        Ok(quest)
    }

    pub fn to_saved(&self) -> SavedQuest {
        let branches: BTreeMap<String, Vec<u32>> = self
            .template
            .branches()
            .map(|(id, branch)| (branch.name().to_string(), self.progress[id.0].clone()))
            .collect();

        SavedQuest {
            quest_id: self.template.id.clone(),
            current_state: self.current_state_name().to_string(),
            branches,
            reached_states: self.reached_state_names(),
        }
    }

    fn enter_state(&mut self, state_id: StateId, scope: &mut QuestScope<'_>) {
        let template = Arc::clone(&self.template);
        let state = template.state(state_id);

        self.current = state_id;
        self.reached.insert(state_id);
        self.completion = completion_after(self.completion, state.completion);

        state.node.process_events(&mut scope.events());

        debug!("Quest '{}' entered state '{}'", template.id, state.name());
        scope.notices.push(NarrativeNotice::QuestNewState {
            quest: template.id.clone(),
            state: state.name().to_string(),
            description: state.description.clone(),
        });

        for &branch_id in &state.branches {
            self.reach_branch(branch_id, scope.ledger);
        }
    }

    /// Reset a branch's progress when its owning state is entered
    fn reach_branch(&mut self, branch_id: BranchId, ledger: &TaskLedger) {
        let branch = self.template.branch(branch_id);
        self.progress[branch_id.0] = branch
            .tasks
            .iter()
            .map(|task| {
                if task.retroactive {
                    ledger.count_of(&task.task).min(task.quantity)
                } else {
                    0
                }
            })
            .collect();
    }

    fn branch_complete(&self, branch_id: BranchId) -> bool {
        self.template
            .branch(branch_id)
            .tasks
            .iter()
            .zip(&self.progress[branch_id.0])
            .all(|(task, &current)| current >= task.quantity)
    }

    /// Count `event` against the current state's branches and report the first
    /// branch that is now complete
    fn run_state(
        &mut self,
        event: Option<&str>,
        made_progress: &mut bool,
        notices: &mut Vec<NarrativeNotice>,
    ) -> RunResult {
        let template = Arc::clone(&self.template);
        let state = template.state(self.current);

        for &branch_id in &state.branches {
            let branch = template.branch(branch_id);

            if let Some(event) = event {
                for (index, task) in branch.tasks.iter().enumerate() {
                    if task.task != event {
                        continue;
                    }
                    let current = &mut self.progress[branch_id.0][index];
                    if *current < task.quantity {
                        *current += 1;
                        *made_progress = true;
                        notices.push(NarrativeNotice::QuestTaskProgress {
                            quest: template.id.clone(),
                            branch: branch.name().to_string(),
                            task: task.task.clone(),
                            current: *current,
                            required: task.quantity,
                        });
                    }
                }
            }

            if let Some(destination) = branch.destination {
                if self.branch_complete(branch_id) {
                    notices.push(NarrativeNotice::QuestBranchCompleted {
                        quest: template.id.clone(),
                        branch: branch.name().to_string(),
                    });
                    return RunResult {
                        final_state: destination,
                        branch: Some(branch_id),
                        completion: template.state(destination).completion,
                    };
                }
            }
        }

        RunResult {
            final_state: self.current,
            branch: None,
            completion: state.completion,
        }
    }

    /// Feed a task string to the quest. Each newly entered state is run again
    /// with the same task string, so satisfied branches cascade in one call.
    pub fn update_quest(&mut self, event: &str, scope: &mut QuestScope<'_>) -> QuestProgress {
        if self.completion != QuestCompletion::Started {
            return QuestProgress::NoChange;
        }

        self.activities.insert(event.to_string());

        let mut made_progress = false;
        let mut changed_state = false;
        let mut hops = 0;

        let mut result = self.run_state(Some(event), &mut made_progress, scope.notices);
        while result.final_state != self.current {
            self.enter_state(result.final_state, scope);
            self.previous_branch = result.branch;
            changed_state = true;

            hops += 1;
            if hops > self.template.state_count() {
                warn!(
                    "Quest '{}' keeps cycling between satisfied states, stopping in '{}'",
                    self.template.id,
                    self.current_state_name()
                );
                break;
            }

            result = self.run_state(Some(event), &mut made_progress, scope.notices);
        }

        if changed_state {
            match self.template.state(self.current).completion {
                StateCompletion::Accept => QuestProgress::Succeeded,
                StateCompletion::Reject => QuestProgress::Failed,
                StateCompletion::Continue => QuestProgress::Updated,
            }
        } else if made_progress {
            QuestProgress::MadeProgress
        } else {
            QuestProgress::NoChange
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn id(&self) -> &str {
        &self.template.id
    }

    pub fn template(&self) -> &Arc<QuestTemplate> {
        &self.template
    }

    pub fn completion(&self) -> QuestCompletion {
        self.completion
    }

    pub fn current_state(&self) -> StateId {
        self.current
    }

    pub fn current_state_name(&self) -> &str {
        self.template.state(self.current).name()
    }

    pub fn current_description(&self) -> &str {
        &self.template.state(self.current).description
    }

    pub fn has_reached(&self, state_name: &str) -> bool {
        self.template
            .find_state(state_name)
            .is_some_and(|id| self.reached.contains(&id))
    }

    pub fn reached_state_names(&self) -> Vec<String> {
        self.reached
            .iter()
            .map(|id| self.template.state(*id).name().to_string())
            .collect()
    }

    pub fn has_activity(&self, task_string: &str) -> bool {
        self.activities.contains(task_string)
    }

    pub fn previous_branch(&self) -> Option<BranchId> {
        self.previous_branch
    }

    /// Task progress on a branch, in task order
    pub fn branch_progress(&self, branch: BranchId) -> &[u32] {
        &self.progress[branch.0]
    }
}

fn completion_after(current: QuestCompletion, entered: StateCompletion) -> QuestCompletion {
    match entered {
        StateCompletion::Accept => QuestCompletion::Succeeded,
        StateCompletion::Reject => QuestCompletion::Failed,
        StateCompletion::Continue => current,
    }
}
