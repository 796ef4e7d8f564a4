//! SNAT rule model.
//!
//! A [`FirewallRule`] maps one container's bridge address to a host-visible
//! address and carries a [`Tag`] naming the container that owns it. A
//! [`RuleSet`] is an ordered snapshot of the whole NAT table: a few lines
//! owned by dfm (they carry a tag) among the host's own rules, which are kept
//! verbatim and in their original order by every operation here.
//!
//! Tag recovery from rule text happens once, when a snapshot is read from the
//! rule store (see [`crate::store`]). Everything above the store boundary
//! works with the already-parsed [`RuleLine::tag`].

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;

/// Default marker prepended to container names to build a tag.
pub const DEFAULT_TAG_PREFIX: &str = "dfm_rule_";

/// Ownership marker embedded in a rule's comment field.
///
/// Equality and hashing use the full tag text, so two schemes with different
/// prefixes never produce colliding tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    text: String,
    owner_start: usize,
}

impl Tag {
    /// Full tag text, e.g. `dfm_rule_mc1`.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Container name the tag was derived from.
    pub fn owner(&self) -> &str {
        &self.text[self.owner_start..]
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Derives tags from container names and recognizes them in comments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagScheme {
    prefix: String,
}

impl TagScheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Pure and total: every name maps to exactly one tag.
    pub fn tag_for(&self, container: &str) -> Tag {
        Tag {
            text: format!("{}{container}", self.prefix),
            owner_start: self.prefix.len(),
        }
    }

    /// Recognizes a comment value produced by [`tag_for`](Self::tag_for).
    ///
    /// Returns `None` for foreign comments and for a bare prefix with no name.
    pub fn parse(&self, comment: &str) -> Option<Tag> {
        let owner = comment.strip_prefix(&self.prefix)?;
        if owner.is_empty() {
            return None;
        }
        Some(self.tag_for(owner))
    }
}

impl Default for TagScheme {
    fn default() -> Self {
        Self::new(DEFAULT_TAG_PREFIX)
    }
}

/// Host-visible and bridge-internal address of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressPair {
    /// Host address bound to the container's first published port.
    pub external: Ipv4Addr,
    /// Address assigned on the configured bridge network.
    pub internal: Ipv4Addr,
}

impl fmt::Display for AddressPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.internal, self.external)
    }
}

/// Source-NAT rule owned by one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    tag: Tag,
    chain: String,
    addresses: AddressPair,
}

impl FirewallRule {
    pub fn new(tag: Tag, chain: impl Into<String>, addresses: AddressPair) -> Self {
        Self {
            tag,
            chain: chain.into(),
            addresses,
        }
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn owner(&self) -> &str {
        self.tag.owner()
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn addresses(&self) -> AddressPair {
        self.addresses
    }

    /// Arguments for inserting the rule at the head of its chain with
    /// `iptables`, excluding the binary and lock flags.
    pub fn insert_args(&self) -> Vec<String> {
        vec![
            "-t".to_owned(),
            "nat".to_owned(),
            "-I".to_owned(),
            self.chain.clone(),
            "-s".to_owned(),
            self.addresses.internal.to_string(),
            "-m".to_owned(),
            "comment".to_owned(),
            "--comment".to_owned(),
            self.tag.to_string(),
            "-j".to_owned(),
            "SNAT".to_owned(),
            "--to-source".to_owned(),
            self.addresses.external.to_string(),
        ]
    }

    /// The rule as `iptables-save` prints it.
    pub fn restore_line(&self) -> String {
        format!(
            "-A {} -s {}/32 -m comment --comment {} -j SNAT --to-source {}",
            self.chain, self.addresses.internal, self.tag, self.addresses.external
        )
    }

    pub fn to_line(&self) -> RuleLine {
        RuleLine {
            text: self.restore_line(),
            tag: Some(self.tag.clone()),
            snat: Some(self.addresses),
        }
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.tag, self.chain, self.addresses)
    }
}

/// One line of the rule table as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleLine {
    /// Verbatim text, without the trailing newline.
    pub text: String,
    /// Owner tag, when the line carries one.
    pub tag: Option<Tag>,
    /// Source and SNAT target, when the line is an owned SNAT rule.
    pub snat: Option<AddressPair>,
}

impl RuleLine {
    /// An unowned line kept verbatim.
    pub fn foreign(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tag: None,
            snat: None,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.tag.is_some()
    }

    fn is_rule_in(&self, chain: &str) -> bool {
        self.text
            .strip_prefix("-A ")
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|c| c == chain)
    }

    /// The part of the line that defines the table, without packet and byte
    /// counters. `None` for blank lines and `#` comments.
    ///
    /// `:CHAIN POLICY [pkts:bytes]` keeps `:CHAIN POLICY`, and a rule dumped
    /// with `-c` (`[pkts:bytes] -A …`) keeps the `-A …` part.
    fn content(&self) -> Option<&str> {
        let text = self.text.trim_end();
        if text.trim_start().is_empty() || text.starts_with('#') {
            return None;
        }
        if text.starts_with(':') {
            return Some(strip_counters_suffix(text));
        }
        let counted_rule = text
            .strip_prefix('[')
            .and_then(|rest| rest.split_once("] "))
            .map(|(_, rule)| rule);
        Some(counted_rule.unwrap_or(text))
    }
}

fn strip_counters_suffix(declaration: &str) -> &str {
    match declaration.rsplit_once(' ') {
        Some((head, counters)) if counters.starts_with('[') && counters.ends_with(']') => head,
        _ => declaration,
    }
}

/// Ordered snapshot of the NAT table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    lines: Vec<RuleLine>,
}

impl RuleSet {
    pub fn new(lines: Vec<RuleLine>) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[RuleLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Owned lines in table order.
    pub fn owned(&self) -> impl Iterator<Item = (&Tag, &RuleLine)> {
        self.lines
            .iter()
            .filter_map(|line| line.tag.as_ref().map(|tag| (tag, line)))
    }

    pub fn tags(&self) -> HashSet<Tag> {
        self.owned().map(|(tag, _)| tag.clone()).collect()
    }

    pub fn contains_tag(&self, tag: &Tag) -> bool {
        self.owned().any(|(t, _)| t == tag)
    }

    /// Drops every line carrying `tag` and returns how many were dropped.
    pub fn remove_tag(&mut self, tag: &Tag) -> usize {
        self.retain_owned(|t| t != tag)
    }

    /// Keeps owned lines for which `keep` holds. Unowned lines always stay.
    ///
    /// Returns the number of dropped lines.
    pub fn retain_owned(&mut self, mut keep: impl FnMut(&Tag) -> bool) -> usize {
        let before = self.lines.len();
        self.lines
            .retain(|line| line.tag.as_ref().is_none_or(|tag| keep(tag)));
        before - self.lines.len()
    }

    /// Inserts `line` before the first rule of `chain`.
    ///
    /// Without an existing rule in the chain the line goes right after the
    /// chain declaration block, i.e. before the first rule of any chain or
    /// the table's `COMMIT`. An empty set just receives the line.
    pub fn insert_at_chain_head(&mut self, chain: &str, line: RuleLine) {
        let position = self
            .lines
            .iter()
            .position(|l| l.is_rule_in(chain))
            .or_else(|| {
                self.lines
                    .iter()
                    .position(|l| l.text.starts_with("-A ") || l.text == "COMMIT")
            })
            .unwrap_or(self.lines.len());
        self.lines.insert(position, line);
    }

    /// Text accepted by `iptables-restore`: one line each, newline-terminated.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.lines.iter().map(|l| l.text.len() + 1).sum());
        for line in &self.lines {
            out.push_str(&line.text);
            out.push('\n');
        }
        out
    }

    /// Whether both snapshots hold the same tables, chains and rules in the
    /// same order.
    ///
    /// Counters and `#` comment lines are ignored: `iptables-save` stamps
    /// its header with the current time and chain counters move with
    /// traffic, so two dumps of an unchanged table rarely match byte for byte.
    pub fn same_rules(&self, other: &RuleSet) -> bool {
        self.lines
            .iter()
            .filter_map(RuleLine::content)
            .eq(other.lines.iter().filter_map(RuleLine::content))
    }

    /// Unowned lines, in order. Used to check that host rules survive.
    pub fn foreign_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| !l.is_owned())
            .map(|l| l.text.as_str())
            .collect()
    }
}
