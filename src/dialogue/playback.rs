//! Dialogue Playback
//!
//! Walks a received NPC chain line by line through a [`Presenter`]. The host
//! reports the end of each line (voice clip finished or display timer fired)
//! with [`DialoguePlayback::finish_play`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::definition::{DialogueAsset, NodeId, Shot, Speaker};
use crate::config::DialogueTiming;

/// Presentation side effects: audio, animation, camera and subtitles
pub trait Presenter: Send {
    fn play_line(&mut self, line: &LineRequest);
    fn play_shot(&mut self, shot: &Shot);
    fn stop_shot(&mut self);
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineRequest {
    pub node: NodeId,
    pub speaker: Speaker,
    pub speaker_name: String,
    pub text: String,
    pub sound: Option<String>,
    pub animation: Option<String>,
    /// `None` when a voice clip decides how long the line lasts
    pub display_time: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackState {
    Speaking(NodeId),
    AwaitingReply(Vec<NodeId>),
    Idle,
}

pub struct DialoguePlayback {
    asset: Arc<DialogueAsset>,
    npc_name: String,
    timing: DialogueTiming,
    queue: VecDeque<NodeId>,
    replies: Vec<NodeId>,
    state: PlaybackState,
}

impl DialoguePlayback {
    pub fn new(asset: Arc<DialogueAsset>, npc_name: &str, timing: DialogueTiming) -> Self {
        Self {
            asset,
            npc_name: npc_name.to_string(),
            timing,
            queue: VecDeque::new(),
            replies: Vec::new(),
            state: PlaybackState::Idle,
        }
    }

    pub fn asset(&self) -> &Arc<DialogueAsset> {
        &self.asset
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    /// Start speaking a new NPC chain, replacing anything queued
    pub fn play_chain(
        &mut self,
        chain: &[NodeId],
        replies: &[NodeId],
        presenter: &mut dyn Presenter,
    ) -> &PlaybackState {
        self.queue = chain.iter().copied().collect();
        self.replies = replies.to_vec();
        self.advance(presenter)
    }

    /// Play a chain after the line being spoken, or right away when nothing is
    pub fn queue_chain(
        &mut self,
        chain: &[NodeId],
        replies: &[NodeId],
        presenter: &mut dyn Presenter,
    ) -> &PlaybackState {
        self.queue.extend(chain.iter().copied());
        self.replies = replies.to_vec();
        if matches!(self.state, PlaybackState::Speaking(_)) {
            return &self.state;
        }
        self.advance(presenter)
    }

    /// Speak the player's chosen reply
    pub fn play_player_line(
        &mut self,
        node: NodeId,
        presenter: &mut dyn Presenter,
    ) -> &PlaybackState {
        self.queue.clear();
        self.replies.clear();

        let asset = Arc::clone(&self.asset);
        let line = asset.node(node);
        if let Some(shot) = line.shot.as_ref().or(asset.player_talking_shot.as_ref()) {
            presenter.play_shot(shot);
        }
        presenter.play_line(&LineRequest {
            node,
            speaker: Speaker::Player,
            speaker_name: String::new(),
            text: line.text.clone(),
            sound: line.sound.clone(),
            animation: line.animation.clone(),
            display_time: line.sound.is_none().then(|| self.timing.player_line_time()),
        });

        self.state = PlaybackState::Speaking(node);
        &self.state
    }

    /// The current line is done; move to the next one
    pub fn finish_play(&mut self, presenter: &mut dyn Presenter) -> &PlaybackState {
        self.advance(presenter)
    }

    pub fn stop(&mut self, presenter: &mut dyn Presenter) {
        self.queue.clear();
        self.replies.clear();
        self.state = PlaybackState::Idle;
        presenter.stop_shot();
    }

    fn advance(&mut self, presenter: &mut dyn Presenter) -> &PlaybackState {
        let asset = Arc::clone(&self.asset);

        while let Some(id) = self.queue.pop_front() {
            let line = asset.node(id);
            // Silent lines only carry conditions/events
            if line.text.trim().is_empty() {
                continue;
            }

            if let Some(shot) = line.shot.as_ref().or(asset.npc_talking_shot.as_ref()) {
                presenter.play_shot(shot);
            }
            presenter.play_line(&LineRequest {
                node: id,
                speaker: Speaker::Npc,
                speaker_name: self.npc_name.clone(),
                text: line.text.clone(),
                sound: line.sound.clone(),
                animation: line.animation.clone(),
                display_time: line
                    .sound
                    .is_none()
                    .then(|| self.timing.line_display_time(&line.text)),
            });

            self.state = PlaybackState::Speaking(id);
            return &self.state;
        }

        if self.replies.is_empty() {
            self.state = PlaybackState::Idle;
        } else {
            if let Some(shot) = asset.select_reply_shot.as_ref() {
                presenter.play_shot(shot);
            }
            self.state = PlaybackState::AwaitingReply(std::mem::take(&mut self.replies));
        }
        &self.state
    }
}
