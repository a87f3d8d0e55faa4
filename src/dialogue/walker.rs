//! Dialogue graph walking. Every call re-evaluates conditions; nothing is cached.

use super::definition::{DialogueAsset, NodeId};
use crate::node::NarrativeContext;

pub struct DialogueWalker<'a, 'c> {
    asset: &'a DialogueAsset,
    ctx: &'a NarrativeContext<'c>,
}

impl<'a, 'c> DialogueWalker<'a, 'c> {
    pub fn new(asset: &'a DialogueAsset, ctx: &'a NarrativeContext<'c>) -> Self {
        Self { asset, ctx }
    }

    fn speakable(&self, id: NodeId) -> bool {
        self.asset.node(id).node.are_conditions_met(self.ctx)
    }

    /// The NPC lines spoken in a row starting at `start`.
    ///
    /// `start` is always included. After it, each step takes the highest
    /// positioned NPC follow-up whose conditions hold. Lines already in the
    /// chain are skipped so a cyclic graph still terminates.
    pub fn reply_chain(&self, start: NodeId) -> Vec<NodeId> {
        let mut chain = vec![start];
        let mut current = start;

        loop {
            let mut candidates = self.asset.node(current).npc_replies.clone();
            candidates.sort_by(|a, b| {
                self.asset
                    .node(*b)
                    .pos_y
                    .total_cmp(&self.asset.node(*a).pos_y)
            });

            let next = candidates
                .into_iter()
                .find(|id| !chain.contains(id) && self.speakable(*id));

            match next {
                Some(id) => {
                    chain.push(id);
                    current = id;
                }
                None => break,
            }
        }

        chain
    }

    /// Player replies offered after `node`, in authoring order
    pub fn player_replies(&self, node: NodeId) -> Vec<NodeId> {
        self.asset
            .node(node)
            .player_replies
            .iter()
            .copied()
            .filter(|id| self.speakable(*id))
            .collect()
    }

    /// First NPC line (authoring order) that answers a chosen player reply
    pub fn first_npc_reply(&self, player_node: NodeId) -> Option<NodeId> {
        self.asset
            .node(player_node)
            .npc_replies
            .iter()
            .copied()
            .find(|id| self.speakable(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{FactAtLeast, HasTask};
    use crate::facts::Facts;
    use crate::ledger::TaskLedger;
    use crate::node::ConditionSlot;
    use std::sync::Arc;

    fn fact_gate(asset: &mut DialogueAsset, node: NodeId, key: &str) {
        asset.node_mut(node).node.conditions.push(ConditionSlot::new(Arc::new(FactAtLeast {
            key: key.to_string(),
            value: 1,
        })));
    }

    fn walk<R>(
        asset: &DialogueAsset,
        facts: &Facts,
        f: impl FnOnce(&DialogueWalker<'_, '_>) -> R,
    ) -> R {
        let ledger = TaskLedger::new();
        let ctx = NarrativeContext {
            actor: "player",
            ledger: &ledger,
            quests: &[],
            facts,
        };
        let walker = DialogueWalker::new(asset, &ctx);
        f(&walker)
    }

    #[test]
    fn test_chain_prefers_higher_position() {
        let mut asset = DialogueAsset::new("d", "npc");
        let root = asset.add_npc("root", "Hello.", 0.0);
        let low = asset.add_npc("low", "At ten.", 10.0);
        let high = asset.add_npc("high", "At twenty.", 20.0);
        let after = asset.add_npc("after", "And then.", 0.0);
        asset.link(root, low).unwrap();
        asset.link(root, high).unwrap();
        asset.link(high, after).unwrap();

        let chain = walk(&asset, &Facts::new(), |w| w.reply_chain(root));
        assert_eq!(chain, vec![root, high, after]);

        // Same inputs, same chain
        let again = walk(&asset, &Facts::new(), |w| w.reply_chain(root));
        assert_eq!(again, chain);
    }

    #[test]
    fn test_chain_skips_failing_lines() {
        let mut asset = DialogueAsset::new("d", "npc");
        let root = asset.add_npc("root", "Hello.", 0.0);
        let gated = asset.add_npc("gated", "You again!", 50.0);
        let fallback = asset.add_npc("fallback", "A stranger.", 10.0);
        asset.link(root, gated).unwrap();
        asset.link(root, fallback).unwrap();
        fact_gate(&mut asset, gated, "met_before");

        let chain = walk(&asset, &Facts::new(), |w| w.reply_chain(root));
        assert_eq!(chain, vec![root, fallback]);

        let mut facts = Facts::new();
        facts.set("met_before", 1);
        let chain = walk(&asset, &facts, |w| w.reply_chain(root));
        assert_eq!(chain, vec![root, gated]);
    }

    #[test]
    fn test_start_is_always_in_chain() {
        let mut asset = DialogueAsset::new("d", "npc");
        let root = asset.add_npc("root", "Hello.", 0.0);
        fact_gate(&mut asset, root, "never_set");

        assert_eq!(walk(&asset, &Facts::new(), |w| w.reply_chain(root)), vec![root]);
    }

    #[test]
    fn test_cycle_terminates() {
        let mut asset = DialogueAsset::new("d", "npc");
        let a = asset.add_npc("a", "One.", 0.0);
        let b = asset.add_npc("b", "Two.", 0.0);
        asset.link(a, b).unwrap();
        asset.link(b, a).unwrap();

        assert_eq!(walk(&asset, &Facts::new(), |w| w.reply_chain(a)), vec![a, b]);
    }

    #[test]
    fn test_player_replies_keep_authoring_order() {
        let mut asset = DialogueAsset::new("d", "npc");
        let root = asset.add_npc("root", "Well?", 0.0);
        let first = asset.add_player("first", "Yes.");
        let hidden = asset.add_player("hidden", "The password is swordfish.");
        let last = asset.add_player("last", "No.");
        asset.link(root, first).unwrap();
        asset.link(root, hidden).unwrap();
        asset.link(root, last).unwrap();
        asset.node_mut(hidden).node.conditions.push(ConditionSlot::new(Arc::new(HasTask::new(
            "Learn", "Password", 1,
        ))));

        assert_eq!(walk(&asset, &Facts::new(), |w| w.player_replies(root)), vec![first, last]);
    }

    #[test]
    fn test_first_npc_reply_uses_authoring_order() {
        let mut asset = DialogueAsset::new("d", "npc");
        let reply = asset.add_player("reply", "Tell me more.");
        let low = asset.add_npc("low", "First written.", 0.0);
        let high = asset.add_npc("high", "Second written.", 99.0);
        asset.link(reply, low).unwrap();
        asset.link(reply, high).unwrap();

        assert_eq!(walk(&asset, &Facts::new(), |w| w.first_npc_reply(reply)), Some(low));

        fact_gate(&mut asset, low, "never_set");
        assert_eq!(walk(&asset, &Facts::new(), |w| w.first_npc_reply(reply)), Some(high));

        fact_gate(&mut asset, high, "never_set");
        assert_eq!(walk(&asset, &Facts::new(), |w| w.first_npc_reply(reply)), None);
    }
}
