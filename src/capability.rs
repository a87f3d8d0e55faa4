//! Capability Registry
//!
//! Maps condition and event kind names to factories so quest and dialogue
//! files can attach them by name:
//!
//! ```toml
//! conditions = [{ kind = "has_task", task = "Talk", argument = "Guard" }]
//! events = [{ kind = "set_fact", key = "met_guard", value = 1 }]
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{NarrativeError, Result};
use crate::ledger::make_task_string;
use crate::node::{
    Condition, ConditionSlot, Event, EventContext, NarrativeCommand, NarrativeContext, NodeBase,
};
use crate::quest::QuestCompletion;
use crate::script::{ScriptCondition, ScriptEvent, ScriptHost};

/// A condition or event as written in a data file
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilitySpec {
    pub kind: String,
    #[serde(default)]
    pub negate: bool,
    #[serde(flatten)]
    pub params: toml::Table,
}

impl CapabilitySpec {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            negate: false,
            params: toml::Table::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }
}

pub type ConditionFactory = Box<dyn Fn(&toml::Table) -> Result<Arc<dyn Condition>> + Send + Sync>;
pub type EventFactory = Box<dyn Fn(&toml::Table) -> Result<Arc<dyn Event>> + Send + Sync>;

/// Deserialize a capability's parameter table into its typed form
pub fn parse_params<T: DeserializeOwned>(kind: &str, params: &toml::Table) -> Result<T> {
    toml::Value::Table(params.clone())
        .try_into()
        .map_err(|e| NarrativeError::InvalidParams {
            kind: kind.to_string(),
            reason: e.to_string(),
        })
}

pub struct CapabilityRegistry {
    conditions: HashMap<String, ConditionFactory>,
    events: HashMap<String, EventFactory>,
}

impl CapabilityRegistry {
    /// An empty registry with no kinds at all
    pub fn empty() -> Self {
        Self {
            conditions: HashMap::new(),
            events: HashMap::new(),
        }
    }

    /// Registry with every built-in condition and event
    pub fn new() -> Self {
        let mut registry = Self::empty();

        registry.register_condition("has_task", |params| {
            let params: HasTaskParams = parse_params("has_task", params)?;
            Ok(Arc::new(HasTask::new(&params.task, &params.argument, params.quantity)))
        });
        registry.register_condition("quest_status", |params| {
            let condition: QuestStatusIs = parse_params("quest_status", params)?;
            Ok(Arc::new(condition))
        });
        registry.register_condition("fact_at_least", |params| {
            let condition: FactAtLeast = parse_params("fact_at_least", params)?;
            Ok(Arc::new(condition))
        });

        registry.register_event("complete_task", |params| {
            let event: CompleteTaskEvent = parse_params("complete_task", params)?;
            Ok(Arc::new(event))
        });
        registry.register_event("begin_quest", |params| {
            let event: BeginQuestEvent = parse_params("begin_quest", params)?;
            Ok(Arc::new(event))
        });
        registry.register_event("forget_quest", |params| {
            let event: ForgetQuestEvent = parse_params("forget_quest", params)?;
            Ok(Arc::new(event))
        });
        registry.register_event("set_fact", |params| {
            let event: SetFact = parse_params("set_fact", params)?;
            Ok(Arc::new(event))
        });
        registry.register_event("add_fact", |params| {
            let event: AddFact = parse_params("add_fact", params)?;
            Ok(Arc::new(event))
        });

        registry
    }

    /// Add the `script` condition and event kinds backed by a Lua host
    pub fn with_scripts(mut self, host: Arc<ScriptHost>) -> Self {
        let condition_host = Arc::clone(&host);
        self.register_condition("script", move |params| {
            let params: ScriptParams = parse_params("script", params)?;
            Ok(Arc::new(ScriptCondition::new(
                Arc::clone(&condition_host),
                &params.function,
            )))
        });
        self.register_event("script", move |params| {
            let params: ScriptParams = parse_params("script", params)?;
            Ok(Arc::new(ScriptEvent::new(Arc::clone(&host), &params.function)))
        });
        self
    }

    pub fn register_condition<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&toml::Table) -> Result<Arc<dyn Condition>> + Send + Sync + 'static,
    {
        self.conditions.insert(kind.to_string(), Box::new(factory));
    }

    pub fn register_event<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&toml::Table) -> Result<Arc<dyn Event>> + Send + Sync + 'static,
    {
        self.events.insert(kind.to_string(), Box::new(factory));
    }

    pub fn has_condition(&self, kind: &str) -> bool {
        self.conditions.contains_key(kind)
    }

    pub fn has_event(&self, kind: &str) -> bool {
        self.events.contains_key(kind)
    }

    pub fn build_condition(&self, spec: &CapabilitySpec) -> Result<ConditionSlot> {
        let factory =
            self.conditions
                .get(&spec.kind)
                .ok_or_else(|| NarrativeError::UnknownCapability {
                    category: "condition",
                    kind: spec.kind.clone(),
                })?;
        Ok(ConditionSlot {
            condition: factory(&spec.params)?,
            negate: spec.negate,
        })
    }

    pub fn build_event(&self, spec: &CapabilitySpec) -> Result<Arc<dyn Event>> {
        let factory = self
            .events
            .get(&spec.kind)
            .ok_or_else(|| NarrativeError::UnknownCapability {
                category: "event",
                kind: spec.kind.clone(),
            })?;
        factory(&spec.params)
    }

    /// Build a node with its conditions and events resolved
    pub fn build_node(
        &self,
        id: &str,
        conditions: &[CapabilitySpec],
        events: &[CapabilitySpec],
    ) -> Result<NodeBase> {
        let mut node = NodeBase::new(id);
        node.conditions = conditions
            .iter()
            .map(|spec| self.build_condition(spec))
            .collect::<Result<Vec<_>>>()?;
        node.events = events
            .iter()
            .map(|spec| self.build_event(spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(node)
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct HasTaskParams {
    task: String,
    argument: String,
    #[serde(default = "default_quantity")]
    quantity: u32,
}

#[derive(Debug, Deserialize)]
struct ScriptParams {
    function: String,
}

// ============================================================================
// Built-in conditions
// ============================================================================

/// The actor has completed a task at least `quantity` times
#[derive(Debug, Clone)]
pub struct HasTask {
    pub task_string: String,
    pub quantity: u32,
}

impl HasTask {
    pub fn new(task: &str, argument: &str, quantity: u32) -> Self {
        Self {
            task_string: make_task_string(task, argument),
            quantity,
        }
    }
}

impl Condition for HasTask {
    fn evaluate(&self, ctx: &NarrativeContext<'_>) -> bool {
        ctx.ledger.has_at_least(&self.task_string, self.quantity)
    }

    fn describe(&self) -> String {
        format!("Has completed '{}' x{}", self.task_string, self.quantity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestStatusQuery {
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
    Finished,
}

impl QuestStatusQuery {
    pub fn matches(self, completion: Option<QuestCompletion>) -> bool {
        match self {
            QuestStatusQuery::NotStarted => {
                matches!(completion, None | Some(QuestCompletion::NotStarted))
            }
            QuestStatusQuery::InProgress => completion == Some(QuestCompletion::Started),
            QuestStatusQuery::Succeeded => completion == Some(QuestCompletion::Succeeded),
            QuestStatusQuery::Failed => completion == Some(QuestCompletion::Failed),
            QuestStatusQuery::Finished => matches!(
                completion,
                Some(QuestCompletion::Succeeded | QuestCompletion::Failed)
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestStatusIs {
    pub quest: String,
    pub status: QuestStatusQuery,
}

impl Condition for QuestStatusIs {
    fn evaluate(&self, ctx: &NarrativeContext<'_>) -> bool {
        self.status.matches(ctx.quest_completion(&self.quest))
    }

    fn describe(&self) -> String {
        format!("Quest '{}' is {:?}", self.quest, self.status)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FactAtLeast {
    pub key: String,
    pub value: i64,
}

impl Condition for FactAtLeast {
    fn evaluate(&self, ctx: &NarrativeContext<'_>) -> bool {
        ctx.facts.get(&self.key) >= self.value
    }

    fn describe(&self) -> String {
        format!("{} >= {}", self.key, self.value)
    }
}

// ============================================================================
// Built-in events
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CompleteTaskEvent {
    pub task: String,
    pub argument: String,
}

impl Event for CompleteTaskEvent {
    fn execute(&self, ctx: &mut EventContext<'_>) -> bool {
        ctx.defer(NarrativeCommand::CompleteTask {
            task: self.task.clone(),
            argument: self.argument.clone(),
        });
        true
    }

    fn describe(&self) -> String {
        format!("Complete task {} ({})", self.task, self.argument)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BeginQuestEvent {
    pub quest: String,
    #[serde(default)]
    pub start_state: Option<String>,
}

impl Event for BeginQuestEvent {
    fn execute(&self, ctx: &mut EventContext<'_>) -> bool {
        ctx.defer(NarrativeCommand::BeginQuest {
            quest: self.quest.clone(),
            start_state: self.start_state.clone(),
        });
        true
    }

    fn describe(&self) -> String {
        format!("Begin quest {}", self.quest)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForgetQuestEvent {
    pub quest: String,
}

impl Event for ForgetQuestEvent {
    fn execute(&self, ctx: &mut EventContext<'_>) -> bool {
        ctx.defer(NarrativeCommand::ForgetQuest {
            quest: self.quest.clone(),
        });
        true
    }

    fn describe(&self) -> String {
        format!("Forget quest {}", self.quest)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetFact {
    pub key: String,
    pub value: i64,
}

impl Event for SetFact {
    fn execute(&self, ctx: &mut EventContext<'_>) -> bool {
        ctx.facts.set(&self.key, self.value);
        true
    }

    fn describe(&self) -> String {
        format!("Set {} = {}", self.key, self.value)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddFact {
    pub key: String,
    pub delta: i64,
}

impl Event for AddFact {
    fn execute(&self, ctx: &mut EventContext<'_>) -> bool {
        ctx.facts.add(&self.key, self.delta);
        true
    }

    fn describe(&self) -> String {
        format!("Add {} to {}", self.delta, self.key)
    }
}
