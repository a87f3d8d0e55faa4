//! Graph Nodes
//!
//! Every quest state, quest branch and dialogue line is a node carrying guard
//! conditions and side-effect events. Conditions and events are capability
//! objects built by the [`CapabilityRegistry`](crate::capability::CapabilityRegistry).

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::facts::Facts;
use crate::ledger::TaskLedger;
use crate::quest::{QuestCompletion, QuestInstance};

// ============================================================================
// Evaluation contexts
// ============================================================================

/// Read-only view of an actor handed to conditions
pub struct NarrativeContext<'a> {
    pub actor: &'a str,
    pub ledger: &'a TaskLedger,
    pub quests: &'a [QuestInstance],
    pub facts: &'a Facts,
}

impl NarrativeContext<'_> {
    /// Completion of a tracked quest, `None` when the actor has never begun it
    pub fn quest_completion(&self, quest_id: &str) -> Option<QuestCompletion> {
        self.quests
            .iter()
            .find(|quest| quest.id() == quest_id)
            .map(|quest| quest.completion())
    }
}

/// Narrative mutations requested by events. They run after the operation
/// that fired the event has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NarrativeCommand {
    CompleteTask { task: String, argument: String },
    BeginQuest { quest: String, start_state: Option<String> },
    ForgetQuest { quest: String },
}

/// Mutable view of an actor handed to events
pub struct EventContext<'a> {
    pub actor: &'a str,
    pub ledger: &'a TaskLedger,
    pub facts: &'a mut Facts,
    pub commands: &'a mut Vec<NarrativeCommand>,
}

impl EventContext<'_> {
    pub fn defer(&mut self, command: NarrativeCommand) {
        self.commands.push(command);
    }
}

// ============================================================================
// Capabilities
// ============================================================================

pub trait Condition: fmt::Debug + Send + Sync {
    fn evaluate(&self, ctx: &NarrativeContext<'_>) -> bool;

    /// Human readable text for editors and logs
    fn describe(&self) -> String;
}

pub trait Event: fmt::Debug + Send + Sync {
    /// Returns false when the event could not do its work
    fn execute(&self, ctx: &mut EventContext<'_>) -> bool;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct ConditionSlot {
    pub condition: Arc<dyn Condition>,
    pub negate: bool,
}

impl ConditionSlot {
    pub fn new(condition: Arc<dyn Condition>) -> Self {
        Self {
            condition,
            negate: false,
        }
    }

    pub fn negated(condition: Arc<dyn Condition>) -> Self {
        Self {
            condition,
            negate: true,
        }
    }

    pub fn holds(&self, ctx: &NarrativeContext<'_>) -> bool {
        self.condition.evaluate(ctx) != self.negate
    }
}

// ============================================================================
// NodeBase
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct NodeBase {
    pub id: Option<String>,
    pub conditions: Vec<ConditionSlot>,
    pub events: Vec<Arc<dyn Event>>,
}

impl NodeBase {
    pub fn new(id: &str) -> Self {
        Self {
            id: (!id.is_empty()).then(|| id.to_string()),
            ..Self::default()
        }
    }

    pub fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }

    /// True when every condition holds. Stops at the first failing condition.
    pub fn are_conditions_met(&self, ctx: &NarrativeContext<'_>) -> bool {
        self.conditions.iter().all(|slot| slot.holds(ctx))
    }

    /// Run every event in order. A failing event does not stop the others.
    pub fn process_events(&self, ctx: &mut EventContext<'_>) {
        for event in &self.events {
            if !event.execute(ctx) {
                debug!(
                    "Event '{}' on node '{}' did not complete",
                    event.describe(),
                    self.id_str()
                );
            }
        }
    }
}
