//! Narrative Component
//!
//! One per actor. Owns the actor's task ledger, quests, facts and dialogue,
//! and is the only place narrative state changes. On the authority every
//! change is appended to the replication log; a follower only changes by
//! replaying that log.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{DialogueTiming, NarrativeConfig};
use crate::dialogue::{
    DialogueAsset, DialoguePlayback, DialogueWalker, NodeId, PlaybackState, Presenter, Speaker,
};
use crate::error::{NarrativeError, Result};
use crate::facts::Facts;
use crate::ledger::{TaskLedger, make_task_string};
use crate::node::{EventContext, NarrativeCommand, NarrativeContext};
use crate::notice::NarrativeNotice;
use crate::persistence::NarrativeSnapshot;
use crate::quest::{QuestCompletion, QuestInstance, QuestProgress, QuestScope, QuestTemplate};
use crate::registry::Catalog;
use crate::replication::{
    Clock, ReplicationInbox, ReplicationLog, ReplicationUpdate, SystemClock, UpdateKind,
};

pub const TALK_TO_NPC_TASK: &str = "TalkToNPC";
pub const SELECT_REPLY_TASK: &str = "SelectDialogueReply";

/// Upper bound on rounds of event-issued commands per operation
const MAX_COMMAND_ROUNDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetRole {
    /// Single player: owns state and presents it locally
    Standalone,
    /// Server copy: owns state and records the replication log
    Authority,
    /// Client copy: changes only through replicated updates
    Follower,
}

/// Dialogue traffic from the authority to the follower
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DialogueMessage {
    Began {
        dialogue: String,
        npc_name: String,
        npc_lines: Vec<String>,
        player_replies: Vec<String>,
    },
    Options {
        dialogue: String,
        npc_lines: Vec<String>,
        player_replies: Vec<String>,
    },
    Ended {
        dialogue: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Input was stale or invalid; nothing changed
    Rejected,
    /// A new NPC chain is playing
    Continued,
    /// No NPC line answered the reply
    Ended,
}

#[derive(Debug, Clone)]
pub struct ActiveDialogue {
    pub asset: Arc<DialogueAsset>,
    pub speaker: Option<String>,
    pub npc_name: String,
    pub npc_chain: Vec<NodeId>,
    pub player_replies: Vec<NodeId>,
}

pub struct NarrativeComponent {
    actor: String,
    role: NetRole,
    catalog: Arc<dyn Catalog>,
    clock: Arc<dyn Clock>,
    timing: DialogueTiming,
    save_on_quest_update: bool,

    ledger: TaskLedger,
    quests: Vec<QuestInstance>,
    facts: Facts,

    log: ReplicationLog,
    inbox: ReplicationInbox,

    dialogue: Option<ActiveDialogue>,
    dialogue_outbox: Vec<DialogueMessage>,
    presenter: Option<Box<dyn Presenter>>,
    playback: Option<DialoguePlayback>,

    notices: Vec<NarrativeNotice>,
    commands: Vec<NarrativeCommand>,

    dirty: bool,
    saved_facts_revision: u64,
    save_requested: bool,
}

impl NarrativeComponent {
    pub fn new(
        actor: &str,
        role: NetRole,
        catalog: Arc<dyn Catalog>,
        config: &NarrativeConfig,
    ) -> Self {
        Self {
            actor: actor.to_string(),
            role,
            catalog,
            clock: Arc::new(SystemClock::new()),
            timing: config.dialogue.clone(),
            save_on_quest_update: config.autosave.on_quest_updated,
            ledger: TaskLedger::new(),
            quests: Vec::new(),
            facts: Facts::new(),
            log: ReplicationLog::new(config.replication.stale_after_secs),
            inbox: ReplicationInbox::new(),
            dialogue: None,
            dialogue_outbox: Vec::new(),
            presenter: None,
            playback: None,
            notices: Vec::new(),
            commands: Vec::new(),
            dirty: false,
            saved_facts_revision: 0,
            save_requested: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn set_presenter(&mut self, presenter: Box<dyn Presenter>) {
        self.presenter = Some(presenter);
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn role(&self) -> NetRole {
        self.role
    }

    fn owns_state(&self) -> bool {
        self.role != NetRole::Follower
    }

    fn require_authority(&self, operation: &'static str) -> Result<()> {
        if self.owns_state() {
            Ok(())
        } else {
            warn!(
                "{} rejected for '{}': followers cannot change narrative state",
                operation, self.actor
            );
            Err(NarrativeError::NotAuthority { operation })
        }
    }

    fn context(&self) -> NarrativeContext<'_> {
        NarrativeContext {
            actor: &self.actor,
            ledger: &self.ledger,
            quests: &self.quests,
            facts: &self.facts,
        }
    }

    fn replicate(&mut self, update: UpdateKind) {
        if self.role == NetRole::Authority {
            let now = self.clock.now_secs();
            self.log.append(update, now);
        }
    }

    /// Persisted state changed
    fn touch(&mut self) {
        self.dirty = true;
    }

    /// A quest changed; ask the host for a save if configured to
    fn touch_quest(&mut self) {
        self.dirty = true;
        if self.save_on_quest_update {
            self.save_requested = true;
        }
    }

    // ========================================================================
    // Quests
    // ========================================================================

    /// Start tracking a quest. Fails if the template is invalid, the start
    /// state is unknown, or the quest is already tracked in any status.
    pub fn begin_quest(
        &mut self,
        template: Arc<QuestTemplate>,
        start_state: Option<&str>,
    ) -> Result<&QuestInstance> {
        self.require_authority("begin_quest")?;
        let quest_id = template.id.clone();
        self.begin_quest_inner(template, start_state, true)?;
        self.run_commands();
        self.quest(&quest_id)
            .ok_or(NarrativeError::NotTracked(quest_id))
    }

    /// Look the quest up in the catalog and begin it
    pub fn begin_quest_by_id(
        &mut self,
        quest_id: &str,
        start_state: Option<&str>,
    ) -> Result<&QuestInstance> {
        let template = self
            .catalog
            .find_quest(quest_id)
            .ok_or_else(|| NarrativeError::UnknownQuest(quest_id.to_string()))?;
        self.begin_quest(template, start_state)
    }

    fn begin_quest_inner(
        &mut self,
        template: Arc<QuestTemplate>,
        start_state: Option<&str>,
        replicate: bool,
    ) -> Result<()> {
        if let Some(existing) = self.quest(&template.id) {
            return Err(NarrativeError::AlreadyTracked {
                quest: template.id.clone(),
                completion: existing.completion(),
            });
        }

        let first_notice = self.notices.len();
        let quest = {
            let mut scope = QuestScope {
                actor: &self.actor,
                ledger: &self.ledger,
                facts: &mut self.facts,
                commands: &mut self.commands,
                notices: &mut self.notices,
            };
            QuestInstance::begin(Arc::clone(&template), start_state, &mut scope)?
        };

        info!(
            "{} began quest '{}' in state '{}'",
            self.actor,
            quest.id(),
            quest.current_state_name()
        );
        self.notices.insert(
            first_notice,
            NarrativeNotice::QuestStarted {
                quest: template.id.clone(),
            },
        );
        self.quests.push(quest);

        if replicate {
            self.replicate(UpdateKind::BeginQuest {
                quest: template.id.clone(),
                start_state: start_state.filter(|s| !s.is_empty()).map(str::to_string),
            });
        }
        self.touch_quest();
        Ok(())
    }

    /// Drop a tracked quest and begin it again from the start (or `start_state`)
    pub fn restart_quest(
        &mut self,
        template: Arc<QuestTemplate>,
        start_state: Option<&str>,
    ) -> Result<()> {
        self.require_authority("restart_quest")?;
        self.restart_quest_inner(template, start_state, true)?;
        self.run_commands();
        Ok(())
    }

    fn restart_quest_inner(
        &mut self,
        template: Arc<QuestTemplate>,
        start_state: Option<&str>,
        replicate: bool,
    ) -> Result<()> {
        let index = self
            .quest_index(&template.id)
            .ok_or_else(|| NarrativeError::NotTracked(template.id.clone()))?;

        // Check everything that can fail before dropping the old instance
        template.validate()?;
        template.resolve_start(start_state)?;

        self.quests.remove(index);
        info!("{} restarted quest '{}'", self.actor, template.id);
        self.notices.push(NarrativeNotice::QuestRestarted {
            quest: template.id.clone(),
        });
        self.begin_quest_inner(Arc::clone(&template), start_state, false)?;

        if replicate {
            self.replicate(UpdateKind::RestartQuest {
                quest: template.id.clone(),
                start_state: start_state.filter(|s| !s.is_empty()).map(str::to_string),
            });
        }
        Ok(())
    }

    /// Stop tracking a quest entirely. Fails without changing anything when
    /// the quest is not tracked.
    pub fn forget_quest(&mut self, quest_id: &str) -> Result<()> {
        self.require_authority("forget_quest")?;
        self.forget_quest_inner(quest_id, true)
    }

    fn forget_quest_inner(&mut self, quest_id: &str, replicate: bool) -> Result<()> {
        let index = self
            .quest_index(quest_id)
            .ok_or_else(|| NarrativeError::NotTracked(quest_id.to_string()))?;

        self.quests.remove(index);
        info!("{} forgot quest '{}'", self.actor, quest_id);
        self.notices.push(NarrativeNotice::QuestForgotten {
            quest: quest_id.to_string(),
        });

        if replicate {
            self.replicate(UpdateKind::ForgetQuest {
                quest: quest_id.to_string(),
            });
        }
        self.touch_quest();
        Ok(())
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Record that the actor did something. Returns true when the task was
    /// new to the actor or moved any quest.
    pub fn complete_task(&mut self, task: &str, argument: &str) -> bool {
        if !self.owns_state() {
            warn!(
                "Follower '{}' tried to complete task {} ({}); only the authority updates quests",
                self.actor, task, argument
            );
            return false;
        }

        let relevant = self.complete_task_inner(task, argument);
        self.run_commands();
        relevant
    }

    fn complete_task_inner(&mut self, task: &str, argument: &str) -> bool {
        if task.is_empty() || argument.is_empty() {
            warn!(
                "Ignoring task with empty name or argument: '{}' ('{}')",
                task, argument
            );
            return false;
        }

        if self.catalog.find_task(task).is_some() {
            self.notices.push(NarrativeNotice::TaskCompleted {
                task: task.to_string(),
                argument: argument.to_string(),
            });
        } else {
            warn!("Task '{}' is not in the task catalog", task);
        }

        let task_string = make_task_string(task, argument);
        self.apply_task_string(&task_string)
    }

    /// Count a canonical task string and run it through every quest. Always
    /// replicated, relevant or not.
    fn apply_task_string(&mut self, task_string: &str) -> bool {
        let mut relevant = self.ledger.record(task_string);
        let mut quest_changed = false;

        for quest in &mut self.quests {
            let mut scope = QuestScope {
                actor: &self.actor,
                ledger: &self.ledger,
                facts: &mut self.facts,
                commands: &mut self.commands,
                notices: &mut self.notices,
            };
            let progress = quest.update_quest(task_string, &mut scope);

            match progress {
                QuestProgress::NoChange => {}
                QuestProgress::MadeProgress => relevant = true,
                QuestProgress::Updated => {
                    relevant = true;
                    quest_changed = true;
                }
                QuestProgress::Succeeded => {
                    relevant = true;
                    quest_changed = true;
                    info!("{} succeeded quest '{}'", self.actor, quest.id());
                    self.notices.push(NarrativeNotice::QuestSucceeded {
                        quest: quest.id().to_string(),
                        message: quest.current_description().to_string(),
                    });
                }
                QuestProgress::Failed => {
                    relevant = true;
                    quest_changed = true;
                    info!("{} failed quest '{}'", self.actor, quest.id());
                    self.notices.push(NarrativeNotice::QuestFailed {
                        quest: quest.id().to_string(),
                        message: quest.current_description().to_string(),
                    });
                }
            }
        }

        self.replicate(UpdateKind::CompleteTask {
            task: task_string.to_string(),
        });

        if quest_changed {
            self.touch_quest();
        } else {
            self.touch();
        }
        relevant
    }

    /// Execute commands queued by events. Followers drop them: the
    /// authority's log already carries their effects.
    fn run_commands(&mut self) {
        if !self.owns_state() {
            if !self.commands.is_empty() {
                debug!("Follower discarding {} event commands", self.commands.len());
                self.commands.clear();
            }
            return;
        }

        let mut rounds = 0;
        while !self.commands.is_empty() {
            rounds += 1;
            if rounds > MAX_COMMAND_ROUNDS {
                error!(
                    "Narrative events for '{}' keep issuing commands, dropping {}",
                    self.actor,
                    self.commands.len()
                );
                self.commands.clear();
                break;
            }

            for command in std::mem::take(&mut self.commands) {
                self.execute_command(command);
            }
        }
    }

    fn execute_command(&mut self, command: NarrativeCommand) {
        match command {
            NarrativeCommand::CompleteTask { task, argument } => {
                self.complete_task_inner(&task, &argument);
            }
            NarrativeCommand::BeginQuest { quest, start_state } => {
                match self.catalog.find_quest(&quest) {
                    Some(template) => {
                        let begun = self.begin_quest_inner(template, start_state.as_deref(), true);
                        if let Err(e) = begun {
                            warn!("Event could not begin quest '{}': {}", quest, e);
                        }
                    }
                    None => warn!("Event names unknown quest '{}'", quest),
                }
            }
            NarrativeCommand::ForgetQuest { quest } => {
                if let Err(e) = self.forget_quest_inner(&quest, true) {
                    warn!("Event could not forget quest '{}': {}", quest, e);
                }
            }
        }
    }

    // ========================================================================
    // Dialogue
    // ========================================================================

    /// Begin a dialogue at its root. `npc_name` overrides the dialogue's own
    /// speaker name; beginning completes the `TalkToNPC` task with it.
    pub fn begin_dialogue(
        &mut self,
        asset: Arc<DialogueAsset>,
        speaker: Option<&str>,
        npc_name: Option<&str>,
    ) -> Result<()> {
        self.require_authority("begin_dialogue")?;

        let Some(root) = asset.root() else {
            error!("Tried beginning dialogue '{}' but it has no root", asset.id);
            return Err(NarrativeError::MissingRoot(asset.id.clone()));
        };

        let (npc_chain, player_replies) = self.walk_from(&asset, root);
        let npc_name = npc_name
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| asset.npc_name.clone());

        info!("{} began dialogue '{}' with {}", self.actor, asset.id, npc_name);
        self.process_npc_events(&asset, &npc_chain);

        self.dialogue_outbox.push(DialogueMessage::Began {
            dialogue: asset.id.clone(),
            npc_name: npc_name.clone(),
            npc_lines: asset.node_names(&npc_chain),
            player_replies: asset.node_names(&player_replies),
        });
        self.notices.push(NarrativeNotice::DialogueBegan {
            dialogue: asset.id.clone(),
            npc_name: npc_name.clone(),
        });
        self.push_dialogue_update(&asset, &npc_chain, &player_replies);

        self.playback = None;
        self.dialogue = Some(ActiveDialogue {
            asset: Arc::clone(&asset),
            speaker: speaker.map(str::to_string),
            npc_name: npc_name.clone(),
            npc_chain,
            player_replies,
        });
        if self.role == NetRole::Standalone {
            self.play_current_chain();
        }

        self.complete_task_inner(TALK_TO_NPC_TASK, &npc_name);
        self.run_commands();
        Ok(())
    }

    pub fn begin_dialogue_by_id(
        &mut self,
        dialogue_id: &str,
        speaker: Option<&str>,
        npc_name: Option<&str>,
    ) -> Result<()> {
        let asset = self
            .catalog
            .find_dialogue(dialogue_id)
            .ok_or_else(|| NarrativeError::UnknownDialogue(dialogue_id.to_string()))?;
        self.begin_dialogue(asset, speaker, npc_name)
    }

    /// The player picked a reply. Stale or invalid picks are rejected without
    /// side effects.
    pub fn select_dialogue_option(&mut self, reply: NodeId) -> Result<SelectOutcome> {
        self.require_authority("select_dialogue_option")?;

        let Some(active) = self.dialogue.as_ref() else {
            return Err(NarrativeError::NotInDialogue);
        };
        let asset = Arc::clone(&active.asset);

        let Some(line) = asset.get(reply) else {
            debug!("Rejecting reply {:?}: not in dialogue '{}'", reply, asset.id);
            return Ok(SelectOutcome::Rejected);
        };
        if line.speaker != Speaker::Player || !active.player_replies.contains(&reply) {
            debug!("Rejecting reply '{}': it was not offered", line.name());
            return Ok(SelectOutcome::Rejected);
        }
        if !line.node.are_conditions_met(&self.context()) {
            debug!("Rejecting reply '{}': its conditions no longer hold", line.name());
            return Ok(SelectOutcome::Rejected);
        }

        {
            let mut ctx = EventContext {
                actor: &self.actor,
                ledger: &self.ledger,
                facts: &mut self.facts,
                commands: &mut self.commands,
            };
            line.node.process_events(&mut ctx);
        }

        if self.role == NetRole::Standalone {
            self.speak_reply(reply);
        }

        self.complete_task_inner(SELECT_REPLY_TASK, line.name());
        self.run_commands();

        let next = {
            let ctx = self.context();
            DialogueWalker::new(&asset, &ctx).first_npc_reply(reply)
        };

        let Some(next) = next else {
            self.exit_dialogue();
            return Ok(SelectOutcome::Ended);
        };

        let (npc_chain, player_replies) = self.walk_from(&asset, next);
        self.process_npc_events(&asset, &npc_chain);

        self.dialogue_outbox.push(DialogueMessage::Options {
            dialogue: asset.id.clone(),
            npc_lines: asset.node_names(&npc_chain),
            player_replies: asset.node_names(&player_replies),
        });
        self.push_dialogue_update(&asset, &npc_chain, &player_replies);

        if let Some(active) = self.dialogue.as_mut() {
            active.npc_chain = npc_chain;
            active.player_replies = player_replies;
        }
        if self.role == NetRole::Standalone {
            self.play_current_chain();
        }

        self.run_commands();
        Ok(SelectOutcome::Continued)
    }

    /// Leave the current dialogue. Accepted from any role.
    pub fn exit_dialogue(&mut self) -> bool {
        let Some(active) = self.dialogue.take() else {
            return false;
        };

        if let (Some(playback), Some(presenter)) =
            (self.playback.as_mut(), self.presenter.as_mut())
        {
            playback.stop(presenter.as_mut());
        }
        self.playback = None;

        if self.owns_state() {
            self.dialogue_outbox.push(DialogueMessage::Ended {
                dialogue: active.asset.id.clone(),
            });
        }
        self.notices.push(NarrativeNotice::DialogueFinished {
            dialogue: active.asset.id.clone(),
        });
        debug!("{} left dialogue '{}'", self.actor, active.asset.id);
        true
    }

    /// Follower side of dialogue replication
    pub fn receive_dialogue(&mut self, message: DialogueMessage) -> Result<()> {
        if self.owns_state() {
            warn!("'{}' owns its state and ignores replicated dialogue", self.actor);
            return Ok(());
        }

        match message {
            DialogueMessage::Began {
                dialogue,
                npc_name,
                npc_lines,
                player_replies,
            } => {
                let asset = self
                    .catalog
                    .find_dialogue(&dialogue)
                    .ok_or(NarrativeError::UnknownDialogue(dialogue))?;
                let npc_chain = asset.resolve_names(&npc_lines)?;
                let player_replies = asset.resolve_names(&player_replies)?;

                self.notices.push(NarrativeNotice::DialogueBegan {
                    dialogue: asset.id.clone(),
                    npc_name: npc_name.clone(),
                });
                self.push_dialogue_update(&asset, &npc_chain, &player_replies);

                self.playback = None;
                self.dialogue = Some(ActiveDialogue {
                    asset,
                    speaker: None,
                    npc_name,
                    npc_chain,
                    player_replies,
                });
                self.play_current_chain();
            }
            DialogueMessage::Options {
                dialogue,
                npc_lines,
                player_replies,
            } => {
                let asset = match self.dialogue.as_ref() {
                    Some(active) if active.asset.id == dialogue => Arc::clone(&active.asset),
                    _ => return Err(NarrativeError::NotInDialogue),
                };
                let npc_chain = asset.resolve_names(&npc_lines)?;
                let player_replies = asset.resolve_names(&player_replies)?;
                self.push_dialogue_update(&asset, &npc_chain, &player_replies);

                if let Some(active) = self.dialogue.as_mut() {
                    active.npc_chain = npc_chain;
                    active.player_replies = player_replies;
                }
                self.play_current_chain();
            }
            DialogueMessage::Ended { .. } => {
                self.exit_dialogue();
            }
        }
        Ok(())
    }

    /// Present the player's reply locally while the authority decides
    pub fn speak_reply(&mut self, reply: NodeId) {
        let (Some(playback), Some(presenter)) =
            (self.playback.as_mut(), self.presenter.as_mut())
        else {
            return;
        };
        playback.play_player_line(reply, presenter.as_mut());
    }

    /// The presenter finished the current line
    pub fn finish_line(&mut self) -> Option<PlaybackState> {
        let (Some(playback), Some(presenter)) =
            (self.playback.as_mut(), self.presenter.as_mut())
        else {
            return None;
        };
        Some(playback.finish_play(presenter.as_mut()).clone())
    }

    fn walk_from(&self, asset: &DialogueAsset, start: NodeId) -> (Vec<NodeId>, Vec<NodeId>) {
        let ctx = self.context();
        let walker = DialogueWalker::new(asset, &ctx);
        let chain = walker.reply_chain(start);
        let replies = chain
            .last()
            .map(|last| walker.player_replies(*last))
            .unwrap_or_default();
        (chain, replies)
    }

    /// NPC line events only run when nobody else has to agree on the result
    fn process_npc_events(&mut self, asset: &DialogueAsset, chain: &[NodeId]) {
        for id in chain {
            let line = asset.node(*id);
            if line.node.events.is_empty() {
                continue;
            }
            if self.role == NetRole::Standalone {
                let mut ctx = EventContext {
                    actor: &self.actor,
                    ledger: &self.ledger,
                    facts: &mut self.facts,
                    commands: &mut self.commands,
                };
                line.node.process_events(&mut ctx);
            } else {
                warn!(
                    "NPC line '{}' in '{}' has events; they only run in standalone games",
                    line.name(),
                    asset.id
                );
            }
        }
    }

    fn push_dialogue_update(
        &mut self,
        asset: &DialogueAsset,
        chain: &[NodeId],
        replies: &[NodeId],
    ) {
        self.notices.push(NarrativeNotice::DialogueUpdated {
            dialogue: asset.id.clone(),
            npc_lines: asset.node_names(chain),
            player_replies: asset.node_names(replies),
        });
    }

    fn play_current_chain(&mut self) {
        let (Some(active), Some(presenter)) = (self.dialogue.as_ref(), self.presenter.as_mut())
        else {
            return;
        };
        let playback = self.playback.get_or_insert_with(|| {
            DialoguePlayback::new(Arc::clone(&active.asset), &active.npc_name, self.timing.clone())
        });
        playback.queue_chain(&active.npc_chain, &active.player_replies, presenter.as_mut());
    }

    // ========================================================================
    // Replication
    // ========================================================================

    /// Entries the follower has not seen, given the last sequence it applied
    pub fn updates_since(&self, sequence: u64) -> &[ReplicationUpdate] {
        self.log.since(sequence)
    }

    pub fn replication_log(&self) -> &ReplicationLog {
        &self.log
    }

    /// Replay replicated updates on a follower. Returns how many were new.
    pub fn apply_updates(&mut self, updates: impl IntoIterator<Item = ReplicationUpdate>) -> usize {
        if self.owns_state() {
            warn!("'{}' owns its state and ignores replicated updates", self.actor);
            return 0;
        }

        self.inbox.receive(updates);
        let fresh = self.inbox.take_unapplied();
        let count = fresh.len();

        for update in fresh {
            match update {
                UpdateKind::CompleteTask { task } => {
                    self.apply_task_string(&task);
                }
                UpdateKind::BeginQuest { quest, start_state } => {
                    let Some(template) = self.catalog.find_quest(&quest) else {
                        warn!("Replicated begin names unknown quest '{}'", quest);
                        continue;
                    };
                    let begun = self.begin_quest_inner(template, start_state.as_deref(), false);
                    if let Err(e) = begun {
                        warn!("Replicated begin of quest '{}' failed: {}", quest, e);
                    }
                }
                UpdateKind::RestartQuest { quest, start_state } => {
                    let Some(template) = self.catalog.find_quest(&quest) else {
                        warn!("Replicated restart names unknown quest '{}'", quest);
                        continue;
                    };
                    let restarted =
                        self.restart_quest_inner(template, start_state.as_deref(), false);
                    if let Err(e) = restarted {
                        warn!("Replicated restart of quest '{}' failed: {}", quest, e);
                    }
                }
                UpdateKind::ForgetQuest { quest } => {
                    if let Err(e) = self.forget_quest_inner(&quest, false) {
                        warn!("Replicated forget of quest '{}' failed: {}", quest, e);
                    }
                }
            }
        }

        self.run_commands();
        count
    }

    /// Seed a follower with the authority's snapshot taken at `sequence`
    pub fn seed_from_authority(&mut self, snapshot: &NarrativeSnapshot, sequence: u64) -> usize {
        let restored = self.restore(snapshot);
        self.inbox.mark_applied(sequence);
        restored
    }

    // ========================================================================
    // Save / load
    // ========================================================================

    pub fn snapshot(&self) -> NarrativeSnapshot {
        NarrativeSnapshot {
            quests: self.quests.iter().map(QuestInstance::to_saved).collect(),
            tasks: self.ledger.to_counts(),
            facts: self.facts.to_values(),
        }
    }

    /// Replace quests, ledger and facts with a saved snapshot. Entry events do not
    /// fire and nothing is replicated. Returns the number of quests restored.
    pub fn restore(&mut self, snapshot: &NarrativeSnapshot) -> usize {
        self.ledger = TaskLedger::from_counts(snapshot.tasks.clone());
        self.facts = Facts::from_values(snapshot.facts.clone());
        self.quests.clear();

        for saved in &snapshot.quests {
            let Some(template) = self.catalog.find_quest(&saved.quest_id) else {
                warn!("Save for '{}' names unknown quest '{}'", self.actor, saved.quest_id);
                continue;
            };
            if self.quest_index(&saved.quest_id).is_some() {
                warn!("Save for '{}' lists quest '{}' twice", self.actor, saved.quest_id);
                continue;
            }
            match QuestInstance::resume(template, saved, &self.ledger) {
                Ok(quest) => self.quests.push(quest),
                Err(e) => warn!("Could not restore quest '{}': {}", saved.quest_id, e),
            }
        }

        info!("Restored {} quests for '{}'", self.quests.len(), self.actor);
        self.mark_saved();
        self.quests.len()
    }

    /// True once after a quest changed, when saving on quest updates is on
    pub fn needs_save(&self) -> bool {
        self.save_requested
    }

    /// True when anything persisted changed since the last save
    pub fn is_dirty(&self) -> bool {
        self.dirty || self.facts.revision() != self.saved_facts_revision
    }

    pub fn mark_saved(&mut self) {
        self.dirty = false;
        self.save_requested = false;
        self.saved_facts_revision = self.facts.revision();
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn quest_index(&self, quest_id: &str) -> Option<usize> {
        self.quests.iter().position(|quest| quest.id() == quest_id)
    }

    pub fn quest(&self, quest_id: &str) -> Option<&QuestInstance> {
        self.quests.iter().find(|quest| quest.id() == quest_id)
    }

    pub fn quests(&self) -> &[QuestInstance] {
        &self.quests
    }

    fn completion_of(&self, quest_id: &str) -> Option<QuestCompletion> {
        self.quest(quest_id).map(QuestInstance::completion)
    }

    pub fn is_quest_started_or_finished(&self, quest_id: &str) -> bool {
        self.completion_of(quest_id)
            .is_some_and(|c| c != QuestCompletion::NotStarted)
    }

    pub fn is_quest_in_progress(&self, quest_id: &str) -> bool {
        self.completion_of(quest_id) == Some(QuestCompletion::Started)
    }

    pub fn is_quest_succeeded(&self, quest_id: &str) -> bool {
        self.completion_of(quest_id) == Some(QuestCompletion::Succeeded)
    }

    pub fn is_quest_failed(&self, quest_id: &str) -> bool {
        self.completion_of(quest_id) == Some(QuestCompletion::Failed)
    }

    pub fn is_quest_finished(&self, quest_id: &str) -> bool {
        self.completion_of(quest_id).is_some_and(|c| c.is_finished())
    }

    pub fn quests_with(&self, completion: QuestCompletion) -> Vec<&QuestInstance> {
        self.quests
            .iter()
            .filter(|quest| quest.completion() == completion)
            .collect()
    }

    pub fn in_progress_quests(&self) -> Vec<&QuestInstance> {
        self.quests_with(QuestCompletion::Started)
    }

    pub fn succeeded_quests(&self) -> Vec<&QuestInstance> {
        self.quests_with(QuestCompletion::Succeeded)
    }

    pub fn failed_quests(&self) -> Vec<&QuestInstance> {
        self.quests_with(QuestCompletion::Failed)
    }

    pub fn has_completed_task(&self, task: &str, argument: &str, quantity: u32) -> bool {
        self.ledger
            .has_at_least(&make_task_string(task, argument), quantity)
    }

    pub fn times_task_completed(&self, task: &str, argument: &str) -> u32 {
        self.ledger.count_of(&make_task_string(task, argument))
    }

    /// Whether the task happened while the quest was running
    pub fn has_completed_task_in_quest(&self, quest_id: &str, task: &str, argument: &str) -> bool {
        self.quest(quest_id)
            .is_some_and(|quest| quest.has_activity(&make_task_string(task, argument)))
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    pub fn facts(&self) -> &Facts {
        &self.facts
    }

    pub fn set_fact(&mut self, key: &str, value: i64) {
        self.facts.set(key, value);
    }

    pub fn current_dialogue(&self) -> Option<&ActiveDialogue> {
        self.dialogue.as_ref()
    }

    pub fn is_in_dialogue(&self) -> bool {
        self.dialogue.is_some()
    }

    pub fn drain_notices(&mut self) -> Vec<NarrativeNotice> {
        std::mem::take(&mut self.notices)
    }

    pub fn drain_dialogue_messages(&mut self) -> Vec<DialogueMessage> {
        std::mem::take(&mut self.dialogue_outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{BeginQuestEvent, FactAtLeast, SetFact};
    use crate::dialogue::playback::tests::RecordingPresenter;
    use crate::node::ConditionSlot;
    use crate::quest::{QuestTask, StateCompletion};
    use crate::registry::NarrativeRegistry;
    use crate::replication::ManualClock;
    use std::sync::Mutex;

    fn guard_quest() -> QuestTemplate {
        let mut quest = QuestTemplate::new("guard_intro", "Meet the Guard");
        let a = quest.add_state("A", StateCompletion::Continue);
        let b = quest.add_state("B", StateCompletion::Accept);
        quest.state_mut(b).description = "You met the guard".to_string();
        quest.add_branch(a, Some(b), vec![QuestTask::new("Talk", "Guard", 1)]);
        quest
    }

    fn sequel_quest() -> QuestTemplate {
        let mut quest = QuestTemplate::new("sequel", "The Sequel");
        quest.add_state("start", StateCompletion::Continue);
        quest
    }

    /// Guard greeting: root offers two replies, "friend" leads on, "bye" ends
    fn gate_dialogue() -> DialogueAsset {
        let mut dialogue = DialogueAsset::new("gate", "Captain Rhea");
        let halt = dialogue.add_npc("halt", "Halt!", 0.0);
        let friend = dialogue.add_player("friend", "A friend.");
        let bye = dialogue.add_player("bye", "Never mind.");
        let welcome = dialogue.add_npc("welcome", "Welcome to town.", 0.0);
        let again = dialogue.add_npc("again", "Anything else?", 0.0);
        dialogue.link(halt, friend).unwrap();
        dialogue.link(halt, bye).unwrap();
        dialogue.link(friend, welcome).unwrap();
        dialogue.link(welcome, again).unwrap();
        dialogue.link(again, bye).unwrap();
        dialogue.set_root(halt).unwrap();
        dialogue
    }

    fn registry() -> Arc<NarrativeRegistry> {
        let mut registry = NarrativeRegistry::new();
        let mut guard = guard_quest();
        let done = guard.find_state("B").unwrap();
        guard.state_mut(done).node.events.push(Arc::new(BeginQuestEvent {
            quest: "sequel".to_string(),
            start_state: None,
        }));
        registry.insert_quest(guard);
        registry.insert_quest(sequel_quest());
        registry.insert_dialogue(gate_dialogue());
        Arc::new(registry)
    }

    fn component(role: NetRole) -> NarrativeComponent {
        NarrativeComponent::new("player", role, registry(), &NarrativeConfig::default())
    }

    fn node(component: &NarrativeComponent, name: &str) -> NodeId {
        component.current_dialogue().unwrap().asset.find_node(name).unwrap()
    }

    #[test]
    fn test_begin_and_complete_quest() {
        let mut narrative = component(NetRole::Authority);
        let quest = narrative.begin_quest_by_id("guard_intro", None).unwrap();
        assert_eq!(quest.current_state_name(), "A");
        assert!(narrative.is_quest_in_progress("guard_intro"));
        assert!(narrative.needs_save());

        assert!(narrative.complete_task("Talk", "Guard"));
        assert!(narrative.is_quest_succeeded("guard_intro"));
        assert!(narrative.is_quest_finished("guard_intro"));
        assert!(narrative.has_completed_task_in_quest("guard_intro", "Talk", "Guard"));

        // The accept state's event began the sequel after the task finished
        assert!(narrative.is_quest_in_progress("sequel"));
        assert_eq!(narrative.in_progress_quests().len(), 1);
        assert_eq!(narrative.succeeded_quests().len(), 1);

        let notices = narrative.drain_notices();
        assert!(notices.contains(&NarrativeNotice::QuestSucceeded {
            quest: "guard_intro".to_string(),
            message: "You met the guard".to_string(),
        }));
        assert!(matches!(
            notices.first(),
            Some(NarrativeNotice::QuestStarted { quest }) if quest == "guard_intro"
        ));
    }

    #[test]
    fn test_begin_rejects_tracked_quest() {
        let mut narrative = component(NetRole::Standalone);
        narrative.begin_quest_by_id("guard_intro", None).unwrap();
        let err = narrative.begin_quest_by_id("guard_intro", None).unwrap_err();
        assert!(matches!(
            err,
            NarrativeError::AlreadyTracked {
                completion: QuestCompletion::Started,
                ..
            }
        ));
        assert_eq!(narrative.quests().len(), 1);
    }

    #[test]
    fn test_begin_with_unknown_start_state_changes_nothing() {
        let mut narrative = component(NetRole::Authority);
        let err = narrative.begin_quest_by_id("guard_intro", Some("Z")).unwrap_err();
        assert!(matches!(err, NarrativeError::UnknownState { .. }));
        assert!(narrative.quests().is_empty());
        assert!(narrative.replication_log().is_empty());
    }

    #[test]
    fn test_forget_untracked_quest_fails_without_mutation() {
        let mut narrative = component(NetRole::Authority);
        narrative.begin_quest_by_id("sequel", None).unwrap();
        let log_len = narrative.replication_log().len();

        assert!(matches!(
            narrative.forget_quest("guard_intro"),
            Err(NarrativeError::NotTracked(_))
        ));
        assert_eq!(narrative.quests().len(), 1);
        assert_eq!(narrative.replication_log().len(), log_len);

        narrative.forget_quest("sequel").unwrap();
        assert!(narrative.quests().is_empty());
        assert!(!narrative.is_quest_started_or_finished("sequel"));
    }

    #[test]
    fn test_restart_quest() {
        let mut narrative = component(NetRole::Authority);
        let template = registry().find_quest("guard_intro").unwrap();
        assert!(narrative.restart_quest(Arc::clone(&template), None).is_err());

        narrative.begin_quest(Arc::clone(&template), None).unwrap();
        narrative.complete_task("Talk", "Guard");
        assert!(narrative.is_quest_succeeded("guard_intro"));

        narrative.restart_quest(Arc::clone(&template), None).unwrap();
        assert!(narrative.is_quest_in_progress("guard_intro"));
        assert_eq!(narrative.quest("guard_intro").unwrap().current_state_name(), "A");

        let last = narrative.replication_log().entries().last().unwrap();
        assert_eq!(
            last.update,
            UpdateKind::RestartQuest {
                quest: "guard_intro".to_string(),
                start_state: None,
            }
        );
    }

    #[test]
    fn test_complete_task_relevance() {
        let mut narrative = component(NetRole::Authority);
        // First time seen counts as relevant
        assert!(narrative.complete_task("Wave", "Baker"));
        assert!(!narrative.complete_task("Wave", "Baker"));
        assert_eq!(narrative.times_task_completed("Wave", "Baker"), 2);
        assert!(narrative.has_completed_task("wave", "baker", 2));

        // Irrelevant tasks are still replicated
        assert_eq!(narrative.replication_log().len(), 2);
    }

    #[test]
    fn test_empty_task_is_rejected() {
        let mut narrative = component(NetRole::Authority);
        assert!(!narrative.complete_task("", "Guard"));
        assert!(!narrative.complete_task("Talk", ""));
        assert!(narrative.ledger().is_empty());
        assert!(narrative.replication_log().is_empty());
    }

    #[test]
    fn test_task_notice_only_for_catalog_tasks() {
        let mut narrative = component(NetRole::Standalone);
        narrative.complete_task("Wave", "Baker");
        narrative.complete_task(TALK_TO_NPC_TASK, "Baker");
        let notices = narrative.drain_notices();
        assert_eq!(
            notices,
            vec![NarrativeNotice::TaskCompleted {
                task: TALK_TO_NPC_TASK.to_string(),
                argument: "Baker".to_string(),
            }]
        );
    }

    #[test]
    fn test_follower_rejects_local_mutation() {
        let mut narrative = component(NetRole::Follower);
        assert!(matches!(
            narrative.begin_quest_by_id("guard_intro", None),
            Err(NarrativeError::NotAuthority { .. })
        ));
        assert!(!narrative.complete_task("Talk", "Guard"));
        assert!(matches!(
            narrative.forget_quest("guard_intro"),
            Err(NarrativeError::NotAuthority { .. })
        ));
        assert!(matches!(
            narrative.begin_dialogue_by_id("gate", None, None),
            Err(NarrativeError::NotAuthority { .. })
        ));
        assert!(narrative.quests().is_empty());
        assert!(narrative.ledger().is_empty());
    }

    #[test]
    fn test_follower_replays_authority() {
        let mut authority = component(NetRole::Authority);
        let mut follower = component(NetRole::Follower);

        authority.begin_quest_by_id("guard_intro", None).unwrap();
        authority.complete_task("Talk", "Guard");

        let applied = follower.apply_updates(authority.updates_since(0).to_vec());
        assert_eq!(applied, 3);
        assert!(follower.is_quest_succeeded("guard_intro"));
        assert!(follower.is_quest_in_progress("sequel"));
        assert_eq!(follower.ledger(), authority.ledger());

        // Resending the same buffer is a no-op
        assert_eq!(follower.apply_updates(authority.updates_since(0).to_vec()), 0);
        assert_eq!(follower.times_task_completed("Talk", "Guard"), 1);
    }

    #[test]
    fn test_log_prunes_with_clock() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut narrative = component(NetRole::Authority).with_clock(clock.clone());
        narrative.complete_task("Wave", "Baker");
        clock.advance(10.0);
        narrative.complete_task("Wave", "Baker");
        clock.advance(40.0);
        narrative.complete_task("Wave", "Baker");

        let times: Vec<f64> = narrative
            .replication_log()
            .entries()
            .iter()
            .map(|e| e.created_at)
            .collect();
        assert_eq!(times, vec![50.0]);
    }

    #[test]
    fn test_dialogue_flow() {
        let mut narrative = component(NetRole::Authority);
        narrative.begin_dialogue_by_id("gate", Some("npc_17"), None).unwrap();
        assert!(narrative.is_in_dialogue());
        assert!(narrative.has_completed_task(TALK_TO_NPC_TASK, "Captain Rhea", 1));

        let active = narrative.current_dialogue().unwrap();
        assert_eq!(active.speaker.as_deref(), Some("npc_17"));
        assert_eq!(active.asset.node_names(&active.npc_chain), vec!["halt"]);
        assert_eq!(active.asset.node_names(&active.player_replies), vec!["friend", "bye"]);

        let friend = node(&narrative, "friend");
        assert_eq!(narrative.select_dialogue_option(friend).unwrap(), SelectOutcome::Continued);
        assert!(narrative.has_completed_task(SELECT_REPLY_TASK, "friend", 1));
        let active = narrative.current_dialogue().unwrap();
        assert_eq!(active.asset.node_names(&active.npc_chain), vec!["welcome", "again"]);
        assert_eq!(active.asset.node_names(&active.player_replies), vec!["bye"]);

        // "friend" is no longer on offer
        assert_eq!(narrative.select_dialogue_option(friend).unwrap(), SelectOutcome::Rejected);

        let bye = node(&narrative, "bye");
        assert_eq!(narrative.select_dialogue_option(bye).unwrap(), SelectOutcome::Ended);
        assert!(!narrative.is_in_dialogue());
        assert!(matches!(
            narrative.select_dialogue_option(bye),
            Err(NarrativeError::NotInDialogue)
        ));

        let messages = narrative.drain_dialogue_messages();
        assert!(matches!(
            messages.first(),
            Some(DialogueMessage::Began { npc_name, .. }) if npc_name == "Captain Rhea"
        ));
        assert!(matches!(messages.last(), Some(DialogueMessage::Ended { .. })));
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn test_reply_rejected_when_conditions_fail() {
        let mut narrative = component(NetRole::Authority);
        let mut dialogue = gate_dialogue();
        let friend = dialogue.find_node("friend").unwrap();
        dialogue.node_mut(friend).node.conditions.push(ConditionSlot::negated(Arc::new(FactAtLeast {
            key: "hostile".to_string(),
            value: 1,
        })));
        narrative.begin_dialogue(Arc::new(dialogue), None, Some("Rhea")).unwrap();
        assert!(narrative.has_completed_task(TALK_TO_NPC_TASK, "Rhea", 1));

        // Offered when the dialogue began, then the world changed
        narrative.set_fact("hostile", 1);
        assert_eq!(narrative.select_dialogue_option(friend).unwrap(), SelectOutcome::Rejected);
        assert!(!narrative.has_completed_task(SELECT_REPLY_TASK, "friend", 1));
        assert!(narrative.is_in_dialogue());
    }

    #[test]
    fn test_dialogue_without_root_fails() {
        let mut narrative = component(NetRole::Authority);
        let mut dialogue = DialogueAsset::new("empty", "Nobody");
        dialogue.add_npc("orphan", "...", 0.0);
        assert!(matches!(
            narrative.begin_dialogue(Arc::new(dialogue), None, None),
            Err(NarrativeError::MissingRoot(_))
        ));
        assert!(!narrative.is_in_dialogue());
    }

    #[test]
    fn test_npc_events_only_in_standalone() {
        let mut dialogue = gate_dialogue();
        let halt = dialogue.find_node("halt").unwrap();
        dialogue.node_mut(halt).node.events.push(Arc::new(SetFact {
            key: "was_halted".to_string(),
            value: 1,
        }));
        let dialogue = Arc::new(dialogue);

        let mut standalone = component(NetRole::Standalone);
        standalone.begin_dialogue(Arc::clone(&dialogue), None, None).unwrap();
        assert_eq!(standalone.facts().get("was_halted"), 1);

        let mut authority = component(NetRole::Authority);
        authority.begin_dialogue(dialogue, None, None).unwrap();
        assert_eq!(authority.facts().get("was_halted"), 0);
    }

    #[test]
    fn test_follower_dialogue_playback() {
        let mut authority = component(NetRole::Authority);
        let mut follower = component(NetRole::Follower);
        follower.set_presenter(Box::new(RecordingPresenter::default()));

        authority.begin_dialogue_by_id("gate", None, None).unwrap();
        for message in authority.drain_dialogue_messages() {
            follower.receive_dialogue(message).unwrap();
        }
        assert!(follower.is_in_dialogue());

        let bye = node(&follower, "bye");
        let friend = node(&follower, "friend");
        assert_eq!(follower.finish_line(), Some(PlaybackState::AwaitingReply(vec![friend, bye])));

        // Followers may leave on their own
        assert!(follower.exit_dialogue());
        assert!(follower.drain_dialogue_messages().is_empty());
    }

    #[derive(Default, Clone)]
    struct SharedPresenter(Arc<Mutex<Vec<String>>>);

    impl Presenter for SharedPresenter {
        fn play_line(&mut self, line: &crate::dialogue::LineRequest) {
            self.0.lock().unwrap().push(line.text.clone());
        }

        fn play_shot(&mut self, _shot: &crate::dialogue::Shot) {}

        fn stop_shot(&mut self) {}
    }

    #[test]
    fn test_standalone_plays_lines() {
        let presenter = SharedPresenter::default();
        let mut narrative = component(NetRole::Standalone);
        narrative.set_presenter(Box::new(presenter.clone()));

        narrative.begin_dialogue_by_id("gate", None, None).unwrap();
        narrative.finish_line();
        let friend = node(&narrative, "friend");
        narrative.select_dialogue_option(friend).unwrap();

        // The answer waits for the player's own line to finish
        assert_eq!(presenter.0.lock().unwrap().len(), 2);
        narrative.finish_line();
        narrative.finish_line();

        let bye = node(&narrative, "bye");
        assert_eq!(narrative.finish_line(), Some(PlaybackState::AwaitingReply(vec![bye])));
        assert_eq!(
            *presenter.0.lock().unwrap(),
            vec!["Halt!", "A friend.", "Welcome to town.", "Anything else?"]
        );
    }

    #[test]
    fn test_snapshot_and_restore() {
        let mut narrative = component(NetRole::Authority);
        narrative.begin_quest_by_id("guard_intro", None).unwrap();
        narrative.complete_task("Wave", "Baker");
        let snapshot = narrative.snapshot();
        assert!(narrative.is_dirty());

        let mut restored = component(NetRole::Authority);
        assert_eq!(restored.restore(&snapshot), 1);
        assert!(restored.is_quest_in_progress("guard_intro"));
        assert_eq!(restored.times_task_completed("Wave", "Baker"), 1);
        assert!(restored.replication_log().is_empty());
        assert!(!restored.is_dirty());
        assert_eq!(restored.snapshot(), snapshot);

        restored.complete_task("Talk", "Guard");
        assert!(restored.is_quest_succeeded("guard_intro"));
    }

    #[test]
    fn test_facts_survive_restore() {
        let mut narrative = component(NetRole::Authority);
        narrative.mark_saved();
        narrative.set_fact("friendly", 1);
        assert!(narrative.is_dirty());

        let snapshot = narrative.snapshot();
        narrative.mark_saved();
        assert!(!narrative.is_dirty());

        let mut restored = component(NetRole::Follower);
        restored.seed_from_authority(&snapshot, 0);
        assert_eq!(restored.facts().get("friendly"), 1);
        assert!(!restored.is_dirty());
        assert_eq!(restored.snapshot(), snapshot);
    }
}
