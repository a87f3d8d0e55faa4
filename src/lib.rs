//! Narrative runtime: quests driven by a task ledger, branching dialogue,
//! and authority-to-follower replication of both.

pub mod capability;
pub mod component;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod facts;
pub mod ledger;
pub mod node;
pub mod notice;
pub mod persistence;
pub mod protocol;
pub mod quest;
pub mod registry;
pub mod replication;
pub mod script;

pub use capability::{CapabilityRegistry, CapabilitySpec};
pub use component::{DialogueMessage, NarrativeComponent, NetRole, SelectOutcome};
pub use config::NarrativeConfig;
pub use error::{NarrativeError, Result};
pub use ledger::{TaskLedger, make_task_string};
pub use notice::NarrativeNotice;
pub use persistence::{Database, NarrativeSnapshot, SnapshotStore};
pub use registry::{Catalog, NarrativeRegistry, TaskDescriptor};
pub use replication::{Clock, ReplicationUpdate, UpdateKind};
pub use script::ScriptHost;
