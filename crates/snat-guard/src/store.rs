//! Rule table access.
//!
//! The [`RuleStore`] trait abstracts read/modify/write access to the host's
//! NAT table so the reconciler can run against [`MemoryRuleStore`] in tests
//! and [`IptablesRuleStore`] in production.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │  Reconciler  │
//! └──────┬───────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │RuleStore │ (trait)
//!   └──────────┘
//!     │      │
//!     ▼      ▼
//! ┌────────┐ ┌──────┐
//! │iptables│ │Memory│
//! └───┬────┘ └──────┘
//!     │
//!     ▼
//!  iptables-save / iptables-restore / iptables -I
//! ```
//!
//! # Text Boundary
//!
//! [`parse_rule_set`] is the only place that reads rule text. It validates
//! the `iptables-save` layout and extracts owner tags from `--comment`
//! values, so callers receive [`RuleLine`]s with the tag already attached.

use std::future::Future;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::SnatGuardConfig;
use crate::error::SnatGuardError;
use crate::rule::{AddressPair, FirewallRule, RuleLine, RuleSet, TagScheme};

/// Read/modify/write access to the NAT rule table.
///
/// # Error Handling
///
/// - Tool missing, non-zero exit, rejected input: `SnatGuardError::StoreUnavailable`
/// - Existing table content that cannot be parsed: `SnatGuardError::CorruptRuleSet`
///
/// Both are recoverable; the caller abandons the current operation only.
pub trait RuleStore: Send + Sync + 'static {
    /// Returns a snapshot of the whole table in its original line order.
    fn load(&self) -> impl Future<Output = Result<RuleSet, SnatGuardError>> + Send;

    /// Replaces the whole table with `rules`.
    ///
    /// Either every line is applied or the table keeps its prior contents.
    fn save(&self, rules: &RuleSet) -> impl Future<Output = Result<(), SnatGuardError>> + Send;

    /// Inserts one rule at the head of its chain without a load/save cycle.
    fn add(&self, rule: &FirewallRule)
    -> impl Future<Output = Result<(), SnatGuardError>> + Send;
}

/// Parses `iptables-save` output into a [`RuleSet`].
///
/// Accepted layout: blank lines, `#` comments, `*table` headers, `:chain`
/// declarations, `-…` rules and `COMMIT`. Rules and chain declarations must
/// sit inside a table, and every table must be committed.
pub fn parse_rule_set(text: &str, scheme: &TagScheme) -> Result<RuleSet, SnatGuardError> {
    let mut lines = Vec::new();
    let mut in_table = false;
    let mut line_count = 0;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        line_count = line_no;
        let line = raw.trim_end_matches('\r');
        let corrupt = |reason: &str| SnatGuardError::CorruptRuleSet {
            line: line_no,
            reason: reason.to_owned(),
        };

        if line.trim().is_empty() || line.starts_with('#') {
            lines.push(RuleLine::foreign(line));
            continue;
        }

        if let Some(table) = line.strip_prefix('*') {
            if in_table {
                return Err(corrupt("table header before previous COMMIT"));
            }
            if table.trim().is_empty() {
                return Err(corrupt("table header without a name"));
            }
            in_table = true;
            lines.push(RuleLine::foreign(line));
            continue;
        }

        if line == "COMMIT" {
            if !in_table {
                return Err(corrupt("COMMIT outside of a table"));
            }
            in_table = false;
            lines.push(RuleLine::foreign(line));
            continue;
        }

        if !in_table {
            return Err(corrupt("line outside of a table"));
        }

        if line.starts_with(':') {
            if line.split_whitespace().count() < 2 {
                return Err(corrupt("malformed chain declaration"));
            }
            lines.push(RuleLine::foreign(line));
        } else if line.starts_with('-') {
            lines.push(parse_rule_line(line, scheme).map_err(|reason| corrupt(&reason))?);
        } else {
            return Err(corrupt("unrecognized line"));
        }
    }

    if in_table {
        return Err(SnatGuardError::CorruptRuleSet {
            line: line_count,
            reason: "table not committed".to_owned(),
        });
    }

    Ok(RuleSet::new(lines))
}

fn parse_rule_line(line: &str, scheme: &TagScheme) -> Result<RuleLine, String> {
    let tokens = tokenize(line)?;
    let value_after = |flag: &str| {
        tokens
            .iter()
            .position(|t| t == flag)
            .and_then(|i| tokens.get(i + 1))
            .map(String::as_str)
    };

    let Some(tag) = value_after("--comment").and_then(|c| scheme.parse(c)) else {
        return Ok(RuleLine::foreign(line));
    };

    let internal = value_after("-s").and_then(|s| parse_host(s.strip_suffix("/32").unwrap_or(s)));
    let external = value_after("--to-source").and_then(parse_host);
    let snat = match (internal, external) {
        (Some(internal), Some(external)) => Some(AddressPair { external, internal }),
        _ => None,
    };

    Ok(RuleLine {
        text: line.to_owned(),
        tag: Some(tag),
        snat,
    })
}

fn parse_host(s: &str) -> Option<Ipv4Addr> {
    s.parse().ok()
}

/// Splits a rule line on whitespace, honoring `"…"` with `\"` escapes.
fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => return Err("dangling escape".to_owned()),
            },
            '"' => {
                in_quotes = !in_quotes;
                in_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if in_quotes {
        return Err("unterminated quote".to_owned());
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Production store driving `iptables-save`, `iptables-restore` and `iptables`.
///
/// Only the `nat` table is read and written back. Restoring a dump that
/// contains just `*nat … COMMIT` leaves every other table untouched, and
/// `iptables-restore` commits the table atomically.
#[derive(Debug, Clone)]
pub struct IptablesRuleStore {
    save_binary: String,
    restore_binary: String,
    iptables_binary: String,
    wait_lock: bool,
    scheme: TagScheme,
}

impl IptablesRuleStore {
    pub fn new(config: &SnatGuardConfig) -> Self {
        Self {
            save_binary: config.save_binary.clone(),
            restore_binary: config.restore_binary.clone(),
            iptables_binary: config.iptables_binary.clone(),
            wait_lock: config.wait_lock,
            scheme: TagScheme::new(config.tag_prefix.clone()),
        }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn lock_args(&self) -> &'static [&'static str] {
        if self.wait_lock { &["-w"] } else { &[] }
    }
}

fn spawn_error(program: &str, e: std::io::Error) -> SnatGuardError {
    SnatGuardError::StoreUnavailable(format!("failed to run {program}: {e}"))
}

fn exit_error(program: &str, output: &std::process::Output) -> SnatGuardError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    SnatGuardError::StoreUnavailable(format!(
        "{program} exited with {}: {}",
        output.status,
        stderr.trim()
    ))
}

impl RuleStore for IptablesRuleStore {
    async fn load(&self) -> Result<RuleSet, SnatGuardError> {
        let output = self
            .command(&self.save_binary)
            .args(["-t", "nat"])
            .output()
            .await
            .map_err(|e| spawn_error(&self.save_binary, e))?;

        if !output.status.success() {
            return Err(exit_error(&self.save_binary, &output));
        }

        let text = String::from_utf8(output.stdout).map_err(|e| SnatGuardError::CorruptRuleSet {
            line: 0,
            reason: format!("output is not valid UTF-8: {e}"),
        })?;
        let rules = parse_rule_set(&text, &self.scheme)?;
        debug!(lines = rules.len(), "loaded nat table");
        Ok(rules)
    }

    async fn save(&self, rules: &RuleSet) -> Result<(), SnatGuardError> {
        let mut child = self
            .command(&self.restore_binary)
            .args(self.lock_args())
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.restore_binary, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(rules.render().as_bytes())
                .await
                .map_err(|e| {
                    SnatGuardError::StoreUnavailable(format!(
                        "failed to write to {} stdin: {e}",
                        self.restore_binary
                    ))
                })?;
            stdin.shutdown().await.map_err(|e| {
                SnatGuardError::StoreUnavailable(format!(
                    "failed to close {} stdin: {e}",
                    self.restore_binary
                ))
            })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| spawn_error(&self.restore_binary, e))?;

        if !output.status.success() {
            return Err(exit_error(&self.restore_binary, &output));
        }
        debug!(lines = rules.len(), "restored nat table");
        Ok(())
    }

    async fn add(&self, rule: &FirewallRule) -> Result<(), SnatGuardError> {
        let output = self
            .command(&self.iptables_binary)
            .args(self.lock_args())
            .args(rule.insert_args())
            .output()
            .await
            .map_err(|e| spawn_error(&self.iptables_binary, e))?;

        if !output.status.success() {
            return Err(exit_error(&self.iptables_binary, &output));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rules: RuleSet,
    fail_loads: u32,
    fail_saves: u32,
    fail_adds: u32,
    corrupt_loads: u32,
    inject_after_load: Option<RuleLine>,
    advance_counters: bool,
    delay: Option<Duration>,
    load_calls: u64,
    save_calls: u64,
    add_calls: u64,
}

/// In-memory rule table with fault injection.
///
/// Clones share the same table, so a test can keep a handle while the
/// reconciler owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryRuleStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRuleStore {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                rules,
                ..MemoryState::default()
            })),
        }
    }

    /// Store seeded with `iptables-save`-style text.
    pub fn from_text(text: &str, scheme: &TagScheme) -> Result<Self, SnatGuardError> {
        Ok(Self::new(parse_rule_set(text, scheme)?))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn rules(&self) -> RuleSet {
        self.with_state(|s| s.rules.clone())
    }

    /// Fails the next `n` loads with `StoreUnavailable`.
    pub fn fail_next_loads(&self, n: u32) {
        self.with_state(|s| s.fail_loads = n);
    }

    /// Fails the next `n` saves with `StoreUnavailable`.
    pub fn fail_next_saves(&self, n: u32) {
        self.with_state(|s| s.fail_saves = n);
    }

    /// Fails the next `n` adds with `StoreUnavailable`.
    pub fn fail_next_adds(&self, n: u32) {
        self.with_state(|s| s.fail_adds = n);
    }

    /// Fails the next `n` loads with `CorruptRuleSet`.
    pub fn corrupt_next_loads(&self, n: u32) {
        self.with_state(|s| s.corrupt_loads = n);
    }

    /// Appends `line` to the table right after the next successful load,
    /// as an external process racing with the caller would.
    pub fn inject_after_next_load(&self, line: RuleLine) {
        self.with_state(|s| s.inject_after_load = Some(line));
    }

    /// Bumps every chain's packet and byte counters after each load, as
    /// traffic through a live host does between two `iptables-save` runs.
    pub fn advance_counters_on_load(&self, enabled: bool) {
        self.with_state(|s| s.advance_counters = enabled);
    }

    /// Delays every operation, for timeout tests under paused time.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.with_state(|s| s.delay = delay);
    }

    /// Replaces the table, as an external `iptables-restore` would.
    pub fn replace_rules(&self, rules: RuleSet) {
        self.with_state(|s| s.rules = rules);
    }

    pub fn load_calls(&self) -> u64 {
        self.with_state(|s| s.load_calls)
    }

    pub fn save_calls(&self) -> u64 {
        self.with_state(|s| s.save_calls)
    }

    pub fn add_calls(&self) -> u64 {
        self.with_state(|s| s.add_calls)
    }

    async fn pause(&self) {
        if let Some(delay) = self.with_state(|s| s.delay) {
            tokio::time::sleep(delay).await;
        }
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

fn with_chain_counters(rules: &RuleSet, packets: u64) -> RuleSet {
    let lines = rules
        .lines()
        .iter()
        .map(|line| match line.text.rsplit_once(" [") {
            Some((declaration, _)) if line.text.starts_with(':') => {
                RuleLine::foreign(format!("{declaration} [{packets}:{}]", packets * 60))
            }
            _ => line.clone(),
        })
        .collect();
    RuleSet::new(lines)
}

impl RuleStore for MemoryRuleStore {
    async fn load(&self) -> Result<RuleSet, SnatGuardError> {
        self.pause().await;
        self.with_state(|s| {
            s.load_calls += 1;
            if take_failure(&mut s.fail_loads) {
                return Err(SnatGuardError::StoreUnavailable(
                    "injected load failure".to_owned(),
                ));
            }
            if take_failure(&mut s.corrupt_loads) {
                return Err(SnatGuardError::CorruptRuleSet {
                    line: 1,
                    reason: "injected corruption".to_owned(),
                });
            }
            let snapshot = s.rules.clone();
            if let Some(line) = s.inject_after_load.take() {
                let mut lines = s.rules.lines().to_vec();
                let at = lines
                    .iter()
                    .position(|l| l.text == "COMMIT")
                    .unwrap_or(lines.len());
                lines.insert(at, line);
                s.rules = RuleSet::new(lines);
            }
            if s.advance_counters {
                s.rules = with_chain_counters(&s.rules, s.load_calls);
            }
            Ok(snapshot)
        })
    }

    async fn save(&self, rules: &RuleSet) -> Result<(), SnatGuardError> {
        self.pause().await;
        self.with_state(|s| {
            s.save_calls += 1;
            if take_failure(&mut s.fail_saves) {
                return Err(SnatGuardError::StoreUnavailable(
                    "injected save failure".to_owned(),
                ));
            }
            s.rules = rules.clone();
            Ok(())
        })
    }

    async fn add(&self, rule: &FirewallRule) -> Result<(), SnatGuardError> {
        self.pause().await;
        self.with_state(|s| {
            s.add_calls += 1;
            if take_failure(&mut s.fail_adds) {
                return Err(SnatGuardError::StoreUnavailable(
                    "injected add failure".to_owned(),
                ));
            }
            s.rules.insert_at_chain_head(rule.chain(), rule.to_line());
            Ok(())
        })
    }
}
