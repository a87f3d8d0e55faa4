//! Narrative Registry
//!
//! Loads quest templates, dialogue assets and the task catalog from a data
//! directory:
//!
//! ```text
//! data/
//!   quests/**/*.toml      one [quest] per file
//!   dialogues/**/*.toml   one [dialogue] per file
//!   tasks/*.toml          table of task name -> descriptor
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::capability::CapabilityRegistry;
use crate::dialogue::{DialogueAsset, RawDialogueFile};
use crate::error::{NarrativeError, Result};
use crate::quest::{QuestTemplate, RawQuestFile};

/// A task the game knows how to raise
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskDescriptor {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// What the argument names, e.g. "NPC name" or "item id"
    #[serde(default)]
    pub argument: String,
}

impl TaskDescriptor {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            argument: String::new(),
        }
    }
}

/// Lookups the narrative component needs from the outside world
pub trait Catalog: Send + Sync {
    fn find_quest(&self, id: &str) -> Option<Arc<QuestTemplate>>;
    fn find_dialogue(&self, id: &str) -> Option<Arc<DialogueAsset>>;
    fn find_task(&self, name: &str) -> Option<TaskDescriptor>;
}

/// Registry for all narrative definitions
#[derive(Debug, Default)]
pub struct NarrativeRegistry {
    quests: HashMap<String, Arc<QuestTemplate>>,
    dialogues: HashMap<String, Arc<DialogueAsset>>,
    tasks: HashMap<String, TaskDescriptor>,
}

impl NarrativeRegistry {
    /// Registry pre-filled with the tasks the runtime raises itself
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.insert_task(TaskDescriptor {
            name: "TalkToNPC".to_string(),
            description: "Began a dialogue".to_string(),
            argument: "NPC name".to_string(),
        });
        registry.insert_task(TaskDescriptor {
            name: "SelectDialogueReply".to_string(),
            description: "Chose a dialogue reply".to_string(),
            argument: "Reply id".to_string(),
        });
        registry
    }

    /// Load quests, dialogues and tasks. Missing directories are skipped and
    /// files that fail to parse are logged and skipped.
    pub fn load_from_directory(
        &mut self,
        data_dir: &Path,
        capabilities: &CapabilityRegistry,
    ) -> Result<()> {
        self.load_tasks(&data_dir.join("tasks"))?;
        self.load_quests(&data_dir.join("quests"), capabilities)?;
        self.load_dialogues(&data_dir.join("dialogues"), capabilities)?;
        Ok(())
    }

    fn load_tasks(&mut self, dir: &Path) -> Result<()> {
        if !dir.exists() {
            warn!("Task directory does not exist: {:?}", dir);
            return Ok(());
        }

        for path in collect_toml(dir)? {
            let content = std::fs::read_to_string(&path)?;
            let table: HashMap<String, TaskDescriptor> = match toml::from_str(&content) {
                Ok(table) => table,
                Err(e) => {
                    warn!("Failed to parse tasks {:?}: {}", path, e);
                    continue;
                }
            };

            for (name, mut task) in table {
                if self.tasks.contains_key(&name) {
                    warn!("Duplicate task '{}' in {:?}, overwriting", name, path);
                }
                task.name = name.clone();
                self.tasks.insert(name, task);
            }
        }

        info!("Loaded {} task definitions", self.tasks.len());
        Ok(())
    }

    fn load_quests(&mut self, dir: &Path, capabilities: &CapabilityRegistry) -> Result<()> {
        if !dir.exists() {
            warn!("Quest directory does not exist: {:?}", dir);
            return Ok(());
        }

        let mut count = 0;
        for path in collect_toml(dir)? {
            match load_quest_file(&path, capabilities) {
                Ok(quest) => {
                    if let Err(e) = quest.validate() {
                        warn!("Quest '{}' will refuse to start: {}", quest.id, e);
                    }
                    info!("Loaded quest: {} ({})", quest.name, quest.id);
                    self.insert_quest(quest);
                    count += 1;
                }
                Err(e) => warn!("Failed to load quest {:?}: {}", path, e),
            }
        }

        info!("Loaded {} quest definitions", count);
        Ok(())
    }

    fn load_dialogues(&mut self, dir: &Path, capabilities: &CapabilityRegistry) -> Result<()> {
        if !dir.exists() {
            warn!("Dialogue directory does not exist: {:?}", dir);
            return Ok(());
        }

        let mut count = 0;
        for path in collect_toml(dir)? {
            match load_dialogue_file(&path, capabilities) {
                Ok(dialogue) => {
                    if dialogue.root().is_none() {
                        warn!("Dialogue '{}' has no root and cannot begin", dialogue.id);
                    }
                    self.insert_dialogue(dialogue);
                    count += 1;
                }
                Err(e) => warn!("Failed to load dialogue {:?}: {}", path, e),
            }
        }

        info!("Loaded {} dialogues", count);
        Ok(())
    }

    pub fn insert_quest(&mut self, quest: QuestTemplate) -> Arc<QuestTemplate> {
        let quest = Arc::new(quest);
        if self.quests.insert(quest.id.clone(), Arc::clone(&quest)).is_some() {
            warn!("Duplicate quest ID '{}', overwriting", quest.id);
        }
        quest
    }

    pub fn insert_dialogue(&mut self, dialogue: DialogueAsset) -> Arc<DialogueAsset> {
        let dialogue = Arc::new(dialogue);
        if self
            .dialogues
            .insert(dialogue.id.clone(), Arc::clone(&dialogue))
            .is_some()
        {
            warn!("Duplicate dialogue ID '{}', overwriting", dialogue.id);
        }
        dialogue
    }

    pub fn insert_task(&mut self, task: TaskDescriptor) {
        self.tasks.insert(task.name.clone(), task);
    }

    pub fn quest(&self, id: &str) -> Option<&Arc<QuestTemplate>> {
        self.quests.get(id)
    }

    pub fn dialogue(&self, id: &str) -> Option<&Arc<DialogueAsset>> {
        self.dialogues.get(id)
    }

    pub fn quest_ids(&self) -> impl Iterator<Item = &String> {
        self.quests.keys()
    }

    pub fn quest_count(&self) -> usize {
        self.quests.len()
    }

    pub fn dialogue_count(&self) -> usize {
        self.dialogues.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Catalog for NarrativeRegistry {
    fn find_quest(&self, id: &str) -> Option<Arc<QuestTemplate>> {
        self.quests.get(id).cloned()
    }

    fn find_dialogue(&self, id: &str) -> Option<Arc<DialogueAsset>> {
        self.dialogues.get(id).cloned()
    }

    fn find_task(&self, name: &str) -> Option<TaskDescriptor> {
        self.tasks.get(name).cloned()
    }
}

fn load_quest_file(path: &Path, capabilities: &CapabilityRegistry) -> Result<QuestTemplate> {
    let content = std::fs::read_to_string(path)?;
    let raw: RawQuestFile = toml::from_str(&content).map_err(|e| NarrativeError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    QuestTemplate::from_raw(&raw.quest, capabilities)
}

fn load_dialogue_file(path: &Path, capabilities: &CapabilityRegistry) -> Result<DialogueAsset> {
    let content = std::fs::read_to_string(path)?;
    let raw: RawDialogueFile = toml::from_str(&content).map_err(|e| NarrativeError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    DialogueAsset::from_raw(&raw.dialogue, capabilities)
}

/// Every `.toml` file under `dir`, recursively, in a stable order
fn collect_toml(dir: &Path) -> Result<Vec<PathBuf>> {
    fn walk(dir: &Path, paths: &mut Vec<PathBuf>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, paths)?;
            } else if path.extension().is_some_and(|ext| ext == "toml") {
                paths.push(path);
            }
        }
        Ok(())
    }

    let mut paths = Vec::new();
    walk(dir, &mut paths)?;
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_data(root: &Path) {
        fs::create_dir_all(root.join("quests/town")).unwrap();
        fs::create_dir_all(root.join("dialogues")).unwrap();
        fs::create_dir_all(root.join("tasks")).unwrap();

        fs::write(
            root.join("quests/town/guard.toml"),
            r#"
            [quest]
            id = "guard_intro"
            name = "Meet the Guard"

            [[quest.states]]
            id = "find_guard"

            [[quest.states]]
            id = "done"
            completion = "accept"

            [[quest.branches]]
            from = "find_guard"
            to = "done"
            tasks = [{ task = "TalkToNPC", argument = "Captain Rhea" }]
            "#,
        )
        .unwrap();

        fs::write(root.join("quests/broken.toml"), "[quest]\nid = 3").unwrap();

        fs::write(
            root.join("dialogues/gate.toml"),
            r#"
            [dialogue]
            id = "gate"
            npc_name = "Captain Rhea"
            root = "halt"

            [[dialogue.nodes]]
            id = "halt"
            speaker = "npc"
            text = "Halt!"
            "#,
        )
        .unwrap();

        fs::write(
            root.join("tasks/core.toml"),
            r#"
            [FindItem]
            description = "Picked up an item"
            argument = "item id"
            "#,
        )
        .unwrap();
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_data(dir.path());

        let mut registry = NarrativeRegistry::new();
        registry
            .load_from_directory(dir.path(), &CapabilityRegistry::new())
            .unwrap();

        // The broken quest file is skipped
        assert_eq!(registry.quest_count(), 1);
        assert_eq!(registry.dialogue_count(), 1);
        assert!(registry.find_quest("guard_intro").is_some());
        assert!(registry.find_dialogue("gate").is_some());

        let task = registry.find_task("FindItem").unwrap();
        assert_eq!(task.name, "FindItem");
        assert_eq!(task.argument, "item id");
        assert!(registry.find_task("TalkToNPC").is_some());
        assert!(registry.find_task("Unknown").is_none());
    }

    #[test]
    fn test_missing_directories_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = NarrativeRegistry::new();
        registry
            .load_from_directory(dir.path(), &CapabilityRegistry::new())
            .unwrap();
        assert_eq!(registry.quest_count(), 0);
        assert_eq!(registry.task_count(), 2);
    }
}
