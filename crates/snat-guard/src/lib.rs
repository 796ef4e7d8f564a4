//! # dfm-snat-guard
//!
//! Keeps host NAT rules in step with a fleet of managed containers.
//!
//! For every managed container that starts, one SNAT rule is inserted at the
//! head of the configured chain, rewriting the container's bridge address to
//! the host address its port is published on. The rule carries a tag derived
//! from the container name. When the container dies its tagged rules are
//! removed, and a rate-limited prune drops rules whose owner is no longer
//! running. Host rules without a tag are never touched.
//!
//! # Module Structure
//!
//! - [`error`]: Domain error types (`SnatGuardError`)
//! - [`config`]: Guard configuration (`SnatGuardConfig`, builder)
//! - [`event`]: Container lifecycle events (`ContainerEvent`, `ContainerEventKind`)
//! - [`matcher`]: Managed-name filter (`NameMatcher`)
//! - [`rule`]: Rule model (`Tag`, `TagScheme`, `FirewallRule`, `RuleSet`)
//! - [`store`]: Rule table access (`RuleStore` trait, `IptablesRuleStore`, `MemoryRuleStore`)
//! - [`docker`]: Docker API abstraction (`DockerClient` trait, `BollardDockerClient`)
//! - [`resolver`]: Address lookup (`AddressResolver` trait, `DockerAddressResolver`)
//! - [`limiter`]: Prune rate limiting (`PruneLimiter`)
//! - [`reconciler`]: Event handling and pruning (`Reconciler`)
//! - [`source`]: Event feeds (`EventSource` trait, `DockerEventSource`, `ChannelEventSource`)
//! - [`guard`]: Main orchestrator (`SnatGuard`, `SnatGuardBuilder`)
//!
//! # Architecture
//!
//! ```text
//! Docker /events --EventSource--> SnatGuard loop
//!                                      |
//!                              Reconciler.handle()
//!                              /               \
//!                   AddressResolver          RuleStore
//!                   (docker inspect)   (iptables-save/-restore)
//! ```

pub mod config;
pub mod docker;
pub mod error;
pub mod event;
pub mod guard;
pub mod limiter;
pub mod matcher;
pub mod reconciler;
pub mod resolver;
pub mod rule;
pub mod source;
pub mod store;

// --- Public API Re-exports ---

// Guard (main orchestrator)
pub use guard::{SnatGuard, SnatGuardBuilder};

// Configuration
pub use config::{SnatGuardConfig, SnatGuardConfigBuilder};

// Error
pub use error::SnatGuardError;

// Events
pub use event::{ContainerEvent, ContainerEventKind};
pub use source::{ChannelEventSource, DockerEventSource, EventItem, EventSource, EventSubscription};

// Rules
pub use matcher::NameMatcher;
pub use rule::{AddressPair, FirewallRule, RuleLine, RuleSet, Tag, TagScheme};
pub use store::{IptablesRuleStore, MemoryRuleStore, RuleStore, parse_rule_set};

// Docker API
pub use docker::{BollardDockerClient, ContainerNetworks, DockerClient};
pub use resolver::{AddressResolver, DockerAddressResolver};

// Reconciliation
pub use limiter::PruneLimiter;
pub use reconciler::{Outcome, OwnedRule, PruneOutcome, Reconciler, SyncReport};
