//! The node table and the master election rules.
//!
//! [`Membership`] is a plain state machine.  It is driven by three inputs:
//!
//! - [`Membership::handle_hello`] for every hello received from a peer;
//! - [`Membership::sweep`] on every health-check tick;
//! - explicit [`Membership::promote`] / [`Membership::demote`] calls.
//!
//! Each input returns an [`Outcome`]: the events to publish and whether the
//! caller should broadcast a fresh hello right away.
//!
//! # Self-role state machine
//!
//! ```text
//!                 promote()
//!   Follower(eligible) ───────────► Master
//!         ▲                           │
//!         └──────── demote(false) ────┤
//!                                     │ demote(true)
//!   Follower(ineligible) ◄────────────┘
//! ```
//!
//! # Election (for beginners)
//!
//! There is no vote.  Every instance sweeps its node table on a timer and
//! counts the masters it can still hear.  If there are fewer than
//! `masters_required`, and this instance is eligible, and no eligible peer
//! has a strictly higher weight, it promotes itself and says so at once.
//! When two instances both believe they are master, whichever first hears
//! the other's claim steps down.  The view converges after a few ticks
//! rather than being correct at every instant.
//!
//! # Master grace period
//!
//! An ordinary node is evicted once it has been silent for `node_timeout`.
//! A master is evicted at the same moment, but it keeps counting toward the
//! live-master tally until it has been silent for `master_timeout`.  One lost
//! heartbeat therefore cannot make every follower promote at once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::node::{HelloPayload, Node, Origin, SelfRecord};

/// The reserved membership event.
pub const HELLO_EVENT: &str = "hello";

/// Event names that applications may not use as channels.
pub const RESERVED_EVENTS: [&str; 6] = [
    "promotion",
    "demotion",
    "added",
    "removed",
    "master",
    HELLO_EVENT,
];

/// Returns `true` for names in [`RESERVED_EVENTS`].
pub fn is_reserved(name: &str) -> bool {
    RESERVED_EVENTS.contains(&name)
}

/// Timing and quorum settings for the election.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElectionSettings {
    pub check_interval: Duration,
    pub node_timeout: Duration,
    pub master_timeout: Duration,
    pub masters_required: usize,
}

impl Default for ElectionSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(2000),
            node_timeout: Duration::from_millis(2000),
            master_timeout: Duration::from_millis(2000),
            masters_required: 1,
        }
    }
}

/// Invalid [`ElectionSettings`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("node timeout ({node_timeout:?}) must be greater than or equal to check interval ({check_interval:?})")]
    NodeTimeoutBelowCheckInterval {
        node_timeout: Duration,
        check_interval: Duration,
    },

    #[error("master timeout ({master_timeout:?}) must be greater than or equal to node timeout ({node_timeout:?})")]
    MasterTimeoutBelowNodeTimeout {
        master_timeout: Duration,
        node_timeout: Duration,
    },

    #[error("at least one master must be required")]
    NoMastersRequired,
}

impl ElectionSettings {
    /// # Errors
    ///
    /// Returns the first violated ordering constraint.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.node_timeout < self.check_interval {
            return Err(SettingsError::NodeTimeoutBelowCheckInterval {
                node_timeout: self.node_timeout,
                check_interval: self.check_interval,
            });
        }
        if self.master_timeout < self.node_timeout {
            return Err(SettingsError::MasterTimeoutBelowNodeTimeout {
                master_timeout: self.master_timeout,
                node_timeout: self.node_timeout,
            });
        }
        if self.masters_required == 0 {
            return Err(SettingsError::NoMastersRequired);
        }
        Ok(())
    }
}

/// Something the runtime should publish.
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Promotion(SelfRecord),
    Demotion(SelfRecord),
    Added(Node),
    Removed(Node),
    Master(Node),
}

/// Result of feeding one input into [`Membership`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Outcome {
    pub events: Vec<MembershipEvent>,
    /// Broadcast a hello now instead of waiting for the next heartbeat.
    pub announce: bool,
}

impl Outcome {
    fn absorb(&mut self, other: Outcome) {
        self.events.extend(other.events);
        self.announce |= other.announce;
    }
}

/// The node table plus this instance's own record.
#[derive(Debug)]
pub struct Membership {
    settings: ElectionSettings,
    me: SelfRecord,
    nodes: HashMap<String, Node>,
    /// Evicted masters still inside their grace period, with last-seen time.
    departed_masters: HashMap<String, Instant>,
}

impl Membership {
    /// # Errors
    ///
    /// [`SettingsError`] if the timing constraints are violated; no instance
    /// is produced.
    pub fn new(settings: ElectionSettings, me: SelfRecord) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            settings,
            me,
            nodes: HashMap::new(),
            departed_masters: HashMap::new(),
        })
    }

    pub fn me(&self) -> &SelfRecord {
        &self.me
    }

    /// Snapshot of the node table.
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// The hello body for the next broadcast.
    pub fn hello(&self) -> HelloPayload {
        self.me.to_hello()
    }

    /// Becomes master.
    pub fn promote(&mut self) -> Outcome {
        self.me.is_master_eligible = true;
        self.me.is_master = true;
        info!("promoted to master (weight {})", self.me.weight);
        Outcome {
            events: vec![MembershipEvent::Promotion(self.me.clone())],
            announce: true,
        }
    }

    /// Stops being master.  A permanent demotion also gives up eligibility.
    pub fn demote(&mut self, permanent: bool) -> Outcome {
        self.me.is_master_eligible = !permanent;
        self.me.is_master = false;
        info!("demoted (permanent: {permanent})");
        Outcome {
            events: vec![MembershipEvent::Demotion(self.me.clone())],
            announce: true,
        }
    }

    /// Sets the advertisement carried by subsequent hellos; `None` or
    /// `Some(Value::Null)` clears it.
    pub fn advertise(&mut self, info: Option<Value>) {
        self.me.info = info.filter(|value| !value.is_null());
    }

    /// Applies a hello from a peer.
    ///
    /// Ordering matters: the previous mastership flag is captured before the
    /// merge, `added` precedes any conflict demotion, and `master` is
    /// published last, whether or not this instance stepped down.
    pub fn handle_hello(&mut self, origin: &Origin, hello: &HelloPayload, now: Instant) -> Outcome {
        let mut outcome = Outcome::default();

        let previous = self.nodes.get(&origin.instance_id).map(|n| n.is_master);
        let is_new = previous.is_none();
        let was_master = previous.unwrap_or(false);

        let node = self
            .nodes
            .entry(origin.instance_id.clone())
            .or_insert_with(|| Node::discovered(origin, now));
        node.merge(origin, hello, now);
        let node = node.clone();
        self.departed_masters.remove(&node.id);

        if is_new {
            info!("node added: {} ({}:{})", node.id, node.address, node.port);
            outcome.events.push(MembershipEvent::Added(node.clone()));
        }

        if node.is_master && (is_new || !was_master) {
            let masters = self.nodes.values().filter(|n| n.is_master).count()
                + usize::from(self.me.is_master);
            if self.me.is_master && masters > self.settings.masters_required {
                info!(
                    "{masters} masters seen but {} required; stepping down for {}",
                    self.settings.masters_required, node.id
                );
                outcome.absorb(self.demote(false));
            }
            debug!("node {} claims master", node.id);
            outcome.events.push(MembershipEvent::Master(node));
        }

        outcome
    }

    /// Health check: evicts silent nodes and promotes this instance when
    /// masters are missing.
    pub fn sweep(&mut self, now: Instant) -> Outcome {
        let mut outcome = Outcome::default();
        let node_timeout = self.settings.node_timeout;
        let master_timeout = self.settings.master_timeout;

        let mut removed = Vec::new();
        self.nodes.retain(|_, node| {
            if now.saturating_duration_since(node.last_seen) > node_timeout {
                removed.push(node.clone());
                false
            } else {
                true
            }
        });

        for node in removed {
            if node.is_master {
                self.departed_masters.insert(node.id.clone(), node.last_seen);
            }
            info!("node removed: {} (silent for {:?})", node.id, now.saturating_duration_since(node.last_seen));
            outcome.events.push(MembershipEvent::Removed(node));
        }

        self.departed_masters
            .retain(|_, last_seen| now.saturating_duration_since(*last_seen) < master_timeout);

        let mut masters_found = self.departed_masters.len();
        let mut higher_weight_found = false;
        for node in self.nodes.values() {
            if node.is_master {
                masters_found += 1;
            }
            if node.is_master_eligible && node.weight > self.me.weight {
                higher_weight_found = true;
            }
        }

        if !self.me.is_master
            && masters_found < self.settings.masters_required
            && self.me.is_master_eligible
            && !higher_weight_found
        {
            debug!("{masters_found} live masters, {} required", self.settings.masters_required);
            outcome.absorb(self.promote());
        }

        outcome
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
