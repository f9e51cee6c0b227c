//! Test doubles for strategy and cache unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::domain::ports::Tier;
use crate::error::{Error, Result};

/// Ordered record of tier calls across several tiers, as "tier op key".
#[derive(Debug, Default)]
pub(crate) struct OpLog {
    entries: Mutex<Vec<String>>,
}

impl OpLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, tier: &str, op: &str, key: &str) {
        self.entries.lock().push(format!("{} {} {}", tier, op, key));
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Entries for one kind of operation, e.g. "put"
    pub fn ops(&self, op: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.split(' ').nth(1) == Some(op))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// String tier whose failures and stalls are scripted by the test.
pub(crate) struct ScriptedTier {
    name: String,
    data: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
    put_gate: Mutex<Option<Arc<Notify>>>,
    log: Arc<OpLog>,
}

impl ScriptedTier {
    pub fn new(name: &str, log: &Arc<OpLog>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            data: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            put_gate: Mutex::new(None),
            log: log.clone(),
        })
    }

    /// Insert without going through the log
    pub fn seed(&self, key: &str, value: &str) {
        self.data.lock().insert(key.to_string(), value.to_string());
    }

    pub fn peek(&self, key: &str) -> Option<String> {
        self.data.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Make every subsequent call fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stall puts until the returned handle is notified
    pub fn hang_puts(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.put_gate.lock() = Some(gate.clone());
        gate
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::tier(&self.name, "scripted failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Tier<String, String> for ScriptedTier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &String) -> Result<Option<String>> {
        self.log.record(&self.name, "get", key);
        self.check()?;
        Ok(self.peek(key))
    }

    async fn put(&self, key: &String, value: &String, _ttl: Option<Duration>) -> Result<()> {
        self.log.record(&self.name, "put", key);
        self.check()?;
        let gate = self.put_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.data.lock().insert(key.clone(), value.clone());
        Ok(())
    }

    async fn put_all(&self, entries: &HashMap<String, String>) -> Result<()> {
        self.log
            .record(&self.name, "put_all", &entries.len().to_string());
        self.check()?;
        self.data
            .lock()
            .extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn remove(&self, key: &String) -> Result<bool> {
        self.log.record(&self.name, "remove", key);
        self.check()?;
        Ok(self.data.lock().remove(key).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.log.record(&self.name, "clear", "*");
        self.check()?;
        self.data.lock().clear();
        Ok(())
    }
}

/// Build tiers "L1".."Ln" sharing one log.
pub(crate) fn scripted_tiers(count: usize) -> (Vec<Arc<ScriptedTier>>, Arc<OpLog>) {
    let log = OpLog::new();
    let tiers = (1..=count)
        .map(|i| ScriptedTier::new(&format!("L{}", i), &log))
        .collect();
    (tiers, log)
}

/// Upcast for handing scripted tiers to a strategy.
pub(crate) fn as_dyn(tiers: &[Arc<ScriptedTier>]) -> Vec<Arc<dyn Tier<String, String>>> {
    tiers
        .iter()
        .map(|t| t.clone() as Arc<dyn Tier<String, String>>)
        .collect()
}
