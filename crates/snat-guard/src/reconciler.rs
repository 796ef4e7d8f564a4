//! SNAT rule reconciliation.
//!
//! [`Reconciler`] turns container lifecycle events into rule table changes:
//!
//! - `Start` of a managed container: resolve its addresses, insert its rule,
//!   then attempt a rate-limited prune.
//! - `Die` of any container: drop every line carrying its tag.
//! - Prune: drop owned rules whose container is not running (or not managed).
//!
//! # Table consistency
//!
//! Every whole-table rewrite is compare-and-save. The table is loaded, the
//! change is computed, and the table is loaded again right before `save`. If
//! the second read holds different rules (see [`RuleSet::same_rules`]),
//! another process touched the table in between and the attempt restarts
//! from a fresh snapshot. Counters and the dump's timestamp comments do not
//! count as a change. After [`MAX_SAVE_ATTEMPTS`] the operation fails with
//! `StoreUnavailable`.
//!
//! # Tag index
//!
//! The reconciler keeps an index of owned rules keyed by [`Tag`]. It is
//! rebuilt from every snapshot it loads and updated on every insert and
//! removal. A `Start` for a tag the index already knows re-reads the table
//! before deciding, so a stale index never suppresses an insert.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use dfm_core::metrics as m;

use crate::config::SnatGuardConfig;
use crate::error::SnatGuardError;
use crate::event::{ContainerEvent, ContainerEventKind};
use crate::limiter::PruneLimiter;
use crate::matcher::NameMatcher;
use crate::resolver::AddressResolver;
use crate::rule::{AddressPair, FirewallRule, RuleSet, Tag, TagScheme};
use crate::store::RuleStore;

/// Attempts per compare-and-save before giving up.
pub const MAX_SAVE_ATTEMPTS: usize = 3;

/// Index entry for one tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedRule {
    /// Addresses of the first line carrying the tag, when it is an SNAT rule.
    pub addresses: Option<AddressPair>,
    /// Number of lines carrying the tag.
    pub copies: usize,
}

/// Result of a prune attempt made after a `Start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneOutcome {
    /// Prune ran and dropped `removed` lines.
    Executed { removed: usize },
    /// Too soon after the last prune.
    Skipped,
    /// Prune ran and failed; the failure has been logged.
    Failed,
}

/// What handling one event did to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// New rule inserted.
    Added { rule: FirewallRule, prune: PruneOutcome },
    /// An identical rule was already present.
    Unchanged { prune: PruneOutcome },
    /// Lines for the tag with other addresses were dropped before inserting.
    Replaced { rule: FirewallRule, prune: PruneOutcome },
    /// Lines dropped for a dead container. Zero when it had none.
    Removed(usize),
    /// `Start` of a container outside the name pattern.
    Unmanaged,
    /// Container disappeared before its addresses were read.
    Vanished,
    /// Event kind the reconciler does not act on.
    Ignored,
}

/// Summary of a startup synchronization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pruned: usize,
    pub added: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub vanished: usize,
    pub unresolved: usize,
}

enum Applied {
    Added,
    Unchanged,
    Replaced,
}

/// Event-driven owner of the SNAT rules.
///
/// Methods take `&mut self`, so one reconciler never runs two table
/// operations at once.
pub struct Reconciler<S: RuleStore, R: AddressResolver> {
    store: S,
    resolver: Arc<R>,
    matcher: NameMatcher,
    scheme: TagScheme,
    chain: String,
    limiter: PruneLimiter,
    store_timeout: Duration,
    index: HashMap<Tag, OwnedRule>,
    index_loaded: bool,
}

impl<S: RuleStore, R: AddressResolver> Reconciler<S, R> {
    /// Builds a reconciler from validated guard settings.
    pub fn new(store: S, resolver: R, config: &SnatGuardConfig) -> Result<Self, SnatGuardError> {
        Ok(Self {
            store,
            resolver: Arc::new(resolver),
            matcher: NameMatcher::new(&config.name_pattern)?,
            scheme: TagScheme::new(config.tag_prefix.clone()),
            chain: config.chain.clone(),
            limiter: PruneLimiter::new(config.prune_interval()),
            store_timeout: config.command_timeout(),
            index: HashMap::new(),
            index_loaded: false,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Resolver handle usable without holding the reconciler.
    pub fn shared_resolver(&self) -> Arc<R> {
        Arc::clone(&self.resolver)
    }

    pub fn matcher(&self) -> &NameMatcher {
        &self.matcher
    }

    pub fn scheme(&self) -> &TagScheme {
        &self.scheme
    }

    pub fn limiter(&self) -> &PruneLimiter {
        &self.limiter
    }

    /// Owned rules as of the last table read or change.
    pub fn index(&self) -> &HashMap<Tag, OwnedRule> {
        &self.index
    }

    /// Handles one event.
    ///
    /// # Errors
    ///
    /// Store and runtime failures for this event only. The caller logs them
    /// and moves on to the next event.
    pub async fn handle(&mut self, event: &ContainerEvent) -> Result<Outcome, SnatGuardError> {
        match &event.kind {
            ContainerEventKind::Start => self.on_start(&event.name).await,
            ContainerEventKind::Die => {
                let tag = self.scheme.tag_for(&event.name);
                let removed = self.remove(&tag).await?;
                Ok(Outcome::Removed(removed))
            }
            ContainerEventKind::Other(_) => Ok(Outcome::Ignored),
        }
    }

    async fn on_start(&mut self, name: &str) -> Result<Outcome, SnatGuardError> {
        if !self.matcher.is_managed(name) {
            debug!(container = name, "ignoring unmanaged container");
            return Ok(Outcome::Unmanaged);
        }

        let Some(addresses) = self.resolver.resolve(name).await? else {
            counter!(m::SNAT_RESOLUTION_RACES_TOTAL).increment(1);
            debug!(container = name, "container gone before address resolution");
            return Ok(Outcome::Vanished);
        };

        let rule = FirewallRule::new(self.scheme.tag_for(name), self.chain.clone(), addresses);
        let applied = self.apply(&rule, false).await?;
        let prune = self.prune_if_due().await;

        Ok(match applied {
            Applied::Added => Outcome::Added { rule, prune },
            Applied::Unchanged => Outcome::Unchanged { prune },
            Applied::Replaced => Outcome::Replaced { rule, prune },
        })
    }

    /// Drops every line tagged `tag`. Absent tags are a successful no-op.
    pub async fn remove(&mut self, tag: &Tag) -> Result<usize, SnatGuardError> {
        let removed = self.rewrite("remove", |rules| rules.remove_tag(tag)).await?;
        if removed > 0 {
            counter!(m::SNAT_RULES_REMOVED_TOTAL).increment(removed as u64);
            info!(tag = %tag, removed, "removed snat rule");
        }
        Ok(removed)
    }

    /// Prunes unless the last prune was less than the interval ago.
    pub async fn prune_if_due(&mut self) -> PruneOutcome {
        if !self.limiter.ready() {
            counter!(m::SNAT_PRUNES_SKIPPED_TOTAL).increment(1);
            debug!("prune skipped by rate limit");
            return PruneOutcome::Skipped;
        }

        match self.prune().await {
            Ok(removed) => PruneOutcome::Executed { removed },
            Err(e) => {
                counter!(m::SNAT_OPERATION_FAILURES_TOTAL, m::LABEL_OP => "prune").increment(1);
                warn!(error = %e, "prune failed");
                PruneOutcome::Failed
            }
        }
    }

    /// Drops owned rules whose container is not a running managed container.
    ///
    /// Runs unconditionally and counts as an execution for rate limiting,
    /// whether or not it succeeds.
    pub async fn prune(&mut self) -> Result<usize, SnatGuardError> {
        self.limiter.record();
        counter!(m::SNAT_PRUNES_EXECUTED_TOTAL).increment(1);

        let running = self.running_managed().await?;
        self.prune_against(&running).await
    }

    /// Brings the table in line with the running containers.
    ///
    /// Prunes, then inserts or fixes the rule of every running managed
    /// container. Counts as a prune execution. Containers that cannot be
    /// resolved are reported and skipped. Store failures abort the sync.
    pub async fn sync(&mut self) -> Result<SyncReport, SnatGuardError> {
        self.limiter.record();
        counter!(m::SNAT_PRUNES_EXECUTED_TOTAL).increment(1);

        let running = self.running_managed().await?;
        let mut report = SyncReport {
            pruned: self.prune_against(&running).await?,
            ..SyncReport::default()
        };

        let mut names: Vec<&String> = running.iter().collect();
        names.sort();
        for name in names {
            let addresses = match self.resolver.resolve(name).await {
                Ok(Some(addresses)) => addresses,
                Ok(None) => {
                    report.vanished += 1;
                    continue;
                }
                Err(e) => {
                    warn!(container = %name, error = %e, "cannot resolve container during sync");
                    report.unresolved += 1;
                    continue;
                }
            };

            let rule = FirewallRule::new(self.scheme.tag_for(name), self.chain.clone(), addresses);
            match self.apply(&rule, true).await? {
                Applied::Added => report.added += 1,
                Applied::Replaced => report.replaced += 1,
                Applied::Unchanged => report.unchanged += 1,
            }
        }

        Ok(report)
    }

    async fn running_managed(&self) -> Result<HashSet<String>, SnatGuardError> {
        Ok(self
            .resolver
            .running()
            .await?
            .into_iter()
            .filter(|name| self.matcher.is_managed(name))
            .collect())
    }

    async fn prune_against(&mut self, running: &HashSet<String>) -> Result<usize, SnatGuardError> {
        let removed = self
            .rewrite("prune", |rules| {
                rules.retain_owned(|tag| running.contains(tag.owner()))
            })
            .await?;
        if removed > 0 {
            counter!(m::SNAT_RULES_REMOVED_TOTAL).increment(removed as u64);
            info!(removed, "pruned stale snat rules");
        } else {
            debug!("prune found nothing stale");
        }
        Ok(removed)
    }

    /// Inserts `rule` unless an identical one is already the tag's only line.
    ///
    /// With `index_fresh` the index was built from a read made during the
    /// current operation and is trusted as is.
    async fn apply(
        &mut self,
        rule: &FirewallRule,
        index_fresh: bool,
    ) -> Result<Applied, SnatGuardError> {
        let tag = rule.tag();
        if !index_fresh && (!self.index_loaded || self.index.contains_key(tag)) {
            self.load().await?;
        }

        let mut applied = Applied::Added;
        match self.index.get(tag).cloned() {
            Some(existing)
                if existing.copies == 1 && existing.addresses == Some(rule.addresses()) =>
            {
                debug!(tag = %tag, "identical snat rule already present");
                return Ok(Applied::Unchanged);
            }
            Some(existing) => {
                info!(
                    tag = %tag,
                    copies = existing.copies,
                    "replacing snat rule with different addresses"
                );
                self.remove(tag).await?;
                applied = Applied::Replaced;
            }
            None => {}
        }

        self.insert(rule).await?;
        Ok(applied)
    }

    async fn insert(&mut self, rule: &FirewallRule) -> Result<(), SnatGuardError> {
        self.bounded("add", self.store.add(rule)).await?;
        self.index.insert(
            rule.tag().clone(),
            OwnedRule {
                addresses: Some(rule.addresses()),
                copies: 1,
            },
        );
        self.publish_owned();
        counter!(m::SNAT_RULES_ADDED_TOTAL).increment(1);
        info!(
            container = rule.owner(),
            internal = %rule.addresses().internal,
            external = %rule.addresses().external,
            "added snat rule"
        );
        Ok(())
    }

    /// Compare-and-save rewrite. `change` returns the number of dropped lines;
    /// zero means the table is left alone.
    async fn rewrite<F>(&mut self, op: &'static str, mut change: F) -> Result<usize, SnatGuardError>
    where
        F: FnMut(&mut RuleSet) -> usize + Send,
    {
        for attempt in 1..=MAX_SAVE_ATTEMPTS {
            let snapshot = self.load().await?;
            let mut rules = snapshot.clone();
            let dropped = change(&mut rules);
            if dropped == 0 {
                return Ok(0);
            }

            let current = self.load().await?;
            if !current.same_rules(&snapshot) {
                debug!(op, attempt, "rule table changed during rewrite, retrying");
                continue;
            }

            self.bounded("save", self.store.save(&rules)).await?;
            self.reindex(&rules);
            return Ok(dropped);
        }

        Err(SnatGuardError::StoreUnavailable(format!(
            "{op}: rule table kept changing, gave up after {MAX_SAVE_ATTEMPTS} attempts"
        )))
    }

    async fn load(&mut self) -> Result<RuleSet, SnatGuardError> {
        let rules = self.bounded("load", self.store.load()).await?;
        self.reindex(&rules);
        Ok(rules)
    }

    async fn bounded<T>(
        &self,
        op: &str,
        fut: impl Future<Output = Result<T, SnatGuardError>>,
    ) -> Result<T, SnatGuardError> {
        tokio::time::timeout(self.store_timeout, fut)
            .await
            .map_err(|_| {
                SnatGuardError::StoreUnavailable(format!(
                    "{op} timed out after {}ms",
                    self.store_timeout.as_millis()
                ))
            })?
    }

    fn reindex(&mut self, rules: &RuleSet) {
        self.index.clear();
        for (tag, line) in rules.owned() {
            self.index
                .entry(tag.clone())
                .and_modify(|entry| entry.copies += 1)
                .or_insert(OwnedRule {
                    addresses: line.snat,
                    copies: 1,
                });
        }
        self.index_loaded = true;
        self.publish_owned();
    }

    fn publish_owned(&self) {
        gauge!(m::SNAT_OWNED_RULES).set(self.index.len() as f64);
    }
}
