use super::rules::{Packet, RuleSet, Verdict};
use super::FirewallBackend;
use crate::error::{VpnError, VpnResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Tables {
    installed: Option<RuleSet>,
    single_dns: Option<RuleSet>,
    fail_next_apply: bool,
    applies: usize,
}

/// In-process packet filter evaluating rule sets with the classifier.
///
/// Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill-switch rules currently installed.
    pub fn installed(&self) -> Option<RuleSet> {
        self.lock().installed.clone()
    }

    pub fn single_dns_rule(&self) -> Option<RuleSet> {
        self.lock().single_dns.clone()
    }

    /// Verdict of everything installed; no rules lets everything through.
    pub fn classify(&self, packet: &Packet) -> Verdict {
        let tables = self.lock();
        for set in [&tables.installed, &tables.single_dns].into_iter().flatten() {
            if set.classify(packet) == Verdict::Drop {
                return Verdict::Drop;
            }
        }
        Verdict::Allow
    }

    pub fn fail_next_apply(&self) {
        self.lock().fail_next_apply = true;
    }

    pub fn apply_count(&self) -> usize {
        self.lock().applies
    }

    /// Drop the rules behind the daemon's back, like an early-boot reset.
    pub fn flush(&self) {
        self.lock().installed = None;
    }

    /// Leave rules behind as a crashed instance would.
    pub fn install_stale(&self) {
        self.lock().installed = Some(RuleSet::default());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl FirewallBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn apply(&self, rules: &RuleSet) -> VpnResult<()> {
        let mut tables = self.lock();
        if std::mem::take(&mut tables.fail_next_apply) {
            return Err(VpnError::tool_failed("memory", Some(1), "transaction rejected"));
        }
        tables.applies += 1;
        tables.installed = Some(rules.clone());
        Ok(())
    }

    async fn remove(&self) -> VpnResult<()> {
        self.lock().installed = None;
        Ok(())
    }

    async fn is_installed(&self) -> VpnResult<bool> {
        Ok(self.lock().installed.is_some())
    }

    async fn set_single_dns_rule(&self, rules: Option<&RuleSet>) -> VpnResult<()> {
        self.lock().single_dns = rules.cloned();
        Ok(())
    }

    fn supports_application_rules(&self) -> bool {
        true
    }
}
