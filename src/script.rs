//! Lua Script Host
//!
//! One sandboxed Lua VM that data files can call into through the `script`
//! condition and event kinds. Scripts define global functions; each call gets
//! a context table with the actor, task counts, facts and quest status.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use mlua::{Function, Lua, Table, Value};
use tracing::{debug, info, warn};

use crate::error::{NarrativeError, Result};
use crate::node::{Condition, Event, EventContext, NarrativeContext};

pub struct ScriptHost {
    lua: Lua,
    loaded_scripts: Mutex<HashSet<String>>,
}

impl fmt::Debug for ScriptHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptHost").finish_non_exhaustive()
    }
}

impl ScriptHost {
    pub fn new() -> Result<Self> {
        let lua = Lua::new();

        // Sandbox: no filesystem, process or module access
        let globals = lua.globals();
        globals.set("os", Value::Nil)?;
        globals.set("io", Value::Nil)?;
        globals.set("loadfile", Value::Nil)?;
        globals.set("dofile", Value::Nil)?;
        globals.set("require", Value::Nil)?;

        Ok(Self {
            lua,
            loaded_scripts: Mutex::new(HashSet::new()),
        })
    }

    /// Run a chunk so the functions it defines become callable. A script name
    /// is only loaded once.
    pub fn load_script(&self, name: &str, source: &str) -> Result<()> {
        let mut loaded = self
            .loaded_scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if loaded.contains(name) {
            return Ok(());
        }

        self.lua.load(source).set_name(name).exec()?;
        loaded.insert(name.to_string());
        debug!("Loaded script {}", name);
        Ok(())
    }

    /// Load every `.lua` file under a directory, recursively
    pub fn load_directory(&self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            warn!("Script directory does not exist: {:?}", dir);
            return Ok(0);
        }

        let mut paths = Vec::new();
        collect_scripts(dir, &mut paths)?;
        paths.sort();

        let mut count = 0;
        for path in paths {
            let source = std::fs::read_to_string(&path)?;
            let name = path
                .strip_prefix(dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            match self.load_script(&name, &source) {
                Ok(()) => count += 1,
                Err(e) => warn!("Failed to load script {:?}: {}", path, e),
            }
        }

        info!("Loaded {} narrative scripts from {:?}", count, dir);
        Ok(count)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.lua.globals().get::<Function>(name).is_ok()
    }

    /// Call a predicate function with a context table
    pub fn check(&self, function: &str, ctx: &NarrativeContext<'_>) -> Result<bool> {
        let func = self.function(function)?;
        let ctx_table = self.context_table(ctx.actor, ctx.ledger.iter(), ctx.facts.iter())?;

        let quests = self.lua.create_table()?;
        for quest in ctx.quests {
            quests.set(quest.id(), quest.completion().as_str())?;
        }
        ctx_table.set("quests", quests)?;

        Ok(func.call::<bool>(ctx_table)?)
    }

    /// Call an effect function. A returned table is read as fact updates.
    pub fn run(&self, function: &str, ctx: &mut EventContext<'_>) -> Result<()> {
        let func = self.function(function)?;
        let ctx_table = self.context_table(ctx.actor, ctx.ledger.iter(), ctx.facts.iter())?;

        if let Value::Table(updates) = func.call::<Value>(ctx_table)? {
            for pair in updates.pairs::<String, i64>() {
                let (key, value) = pair?;
                ctx.facts.set(&key, value);
            }
        }
        Ok(())
    }

    fn function(&self, name: &str) -> Result<Function> {
        self.lua
            .globals()
            .get::<Function>(name)
            .map_err(|_| NarrativeError::Script(format!("no function named '{}'", name)))
    }

    fn context_table<'a>(
        &self,
        actor: &str,
        tasks: impl Iterator<Item = (&'a str, u32)>,
        facts: impl Iterator<Item = (&'a str, i64)>,
    ) -> Result<Table> {
        let ctx_table = self.lua.create_table()?;
        ctx_table.set("actor", actor)?;

        let task_table = self.lua.create_table()?;
        for (task, count) in tasks {
            task_table.set(task, count)?;
        }
        ctx_table.set("tasks", task_table)?;

        let fact_table = self.lua.create_table()?;
        for (key, value) in facts {
            fact_table.set(key, value)?;
        }
        ctx_table.set("facts", fact_table)?;

        Ok(ctx_table)
    }
}

fn collect_scripts(dir: &Path, paths: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_scripts(&path, paths)?;
        } else if path.extension().is_some_and(|ext| ext == "lua") {
            paths.push(path);
        }
    }
    Ok(())
}

/// Condition backed by a Lua predicate. Script errors count as false.
#[derive(Debug)]
pub struct ScriptCondition {
    host: Arc<ScriptHost>,
    function: String,
}

impl ScriptCondition {
    pub fn new(host: Arc<ScriptHost>, function: &str) -> Self {
        Self {
            host,
            function: function.to_string(),
        }
    }
}

impl Condition for ScriptCondition {
    fn evaluate(&self, ctx: &NarrativeContext<'_>) -> bool {
        match self.host.check(&self.function, ctx) {
            Ok(result) => result,
            Err(e) => {
                warn!("Script condition '{}' failed: {}", self.function, e);
                false
            }
        }
    }

    fn describe(&self) -> String {
        format!("script {}", self.function)
    }
}

#[derive(Debug)]
pub struct ScriptEvent {
    host: Arc<ScriptHost>,
    function: String,
}

impl ScriptEvent {
    pub fn new(host: Arc<ScriptHost>, function: &str) -> Self {
        Self {
            host,
            function: function.to_string(),
        }
    }
}

impl Event for ScriptEvent {
    fn execute(&self, ctx: &mut EventContext<'_>) -> bool {
        match self.host.run(&self.function, ctx) {
            Ok(()) => true,
            Err(e) => {
                warn!("Script event '{}' failed: {}", self.function, e);
                false
            }
        }
    }

    fn describe(&self) -> String {
        format!("script {}", self.function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::Facts;
    use crate::ledger::TaskLedger;

    const SCRIPT: &str = r#"
        function knows_guard(ctx)
            return (ctx.tasks["talk_guard"] or 0) >= 1 and ctx.facts.gold >= 10
        end

        function pay_toll(ctx)
            return { gold = ctx.facts.gold - 10, paid_toll = 1 }
        end

        function broken(ctx)
            error("boom")
        end
    "#;

    fn host() -> Arc<ScriptHost> {
        let host = ScriptHost::new().unwrap();
        host.load_script("toll.lua", SCRIPT).unwrap();
        Arc::new(host)
    }

    #[test]
    fn test_sandbox_removes_os() {
        let host = ScriptHost::new().unwrap();
        host.load_script("probe.lua", "function has_os() return os ~= nil end")
            .unwrap();
        assert!(host.has_function("has_os"));
        assert!(!host.has_function("missing"));

        let ledger = TaskLedger::new();
        let facts = Facts::new();
        let ctx = NarrativeContext {
            actor: "player",
            ledger: &ledger,
            quests: &[],
            facts: &facts,
        };
        assert!(!host.check("has_os", &ctx).unwrap());
    }

    #[test]
    fn test_script_condition() {
        let condition = ScriptCondition::new(host(), "knows_guard");

        let mut ledger = TaskLedger::new();
        let mut facts = Facts::new();
        facts.set("gold", 12);
        {
            let ctx = NarrativeContext {
                actor: "player",
                ledger: &ledger,
                quests: &[],
                facts: &facts,
            };
            assert!(!condition.evaluate(&ctx));
        }

        ledger.record("talk_guard");
        let ctx = NarrativeContext {
            actor: "player",
            ledger: &ledger,
            quests: &[],
            facts: &facts,
        };
        assert!(condition.evaluate(&ctx));
    }

    #[test]
    fn test_script_event_updates_facts() {
        let event = ScriptEvent::new(host(), "pay_toll");
        let ledger = TaskLedger::new();
        let mut facts = Facts::new();
        facts.set("gold", 25);
        let mut commands = Vec::new();
        let mut ctx = EventContext {
            actor: "player",
            ledger: &ledger,
            facts: &mut facts,
            commands: &mut commands,
        };

        assert!(event.execute(&mut ctx));
        assert_eq!(facts.get("gold"), 15);
        assert_eq!(facts.get("paid_toll"), 1);
    }

    #[test]
    fn test_script_errors_are_contained() {
        let host = host();
        let ledger = TaskLedger::new();
        let facts = Facts::new();
        let ctx = NarrativeContext {
            actor: "player",
            ledger: &ledger,
            quests: &[],
            facts: &facts,
        };
        assert!(!ScriptCondition::new(Arc::clone(&host), "broken").evaluate(&ctx));
        assert!(!ScriptCondition::new(host, "does_not_exist").evaluate(&ctx));
    }

    #[test]
    fn test_load_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("town")).unwrap();
        std::fs::write(
            dir.path().join("town/gate.lua"),
            "function gate_open(ctx) return true end",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a script").unwrap();

        let host = ScriptHost::new().unwrap();
        assert_eq!(host.load_directory(dir.path()).unwrap(), 1);
        assert!(host.has_function("gate_open"));
    }
}
