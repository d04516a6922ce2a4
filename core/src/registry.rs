//! Channel registry: the authoritative map of live channels.
//!
//! A channel is a named endpoint owned by exactly one connected peer. The
//! registry tracks each channel's topic bindings (response, pull,
//! subscribe) and the monitors observing channel lifecycle events through
//! glob or regular-expression patterns.
//!
//! The registry is owned by the single routing task, so plain maps suffice;
//! there is no concurrent access. Invariants maintained here:
//!
//! - channel names are unique among live channels
//! - at most one channel per peer socket
//! - removing a peer removes its channel and its monitors in one step

use bytes::Bytes;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{ChannelName, TopicName};

/// Opaque connection identity assigned by the server accept loop.
pub type PeerId = u64;

/// Outbound half of a peer connection; frames pushed here are written by
/// the peer's connection task. Dropping every clone closes the peer.
pub type FrameSender = mpsc::UnboundedSender<Bytes>;

/// A named endpoint registered by a connected peer.
#[derive(Debug)]
pub struct Channel {
    pub name: ChannelName,
    pub peer: PeerId,
    pub sender: FrameSender,
    response_topics: HashSet<TopicName>,
    pull_topics: HashMap<TopicName, Value>,
    subscribe_topics: HashMap<TopicName, Value>,
}

impl Channel {
    fn new(name: ChannelName, peer: PeerId, sender: FrameSender) -> Self {
        Self {
            name,
            peer,
            sender,
            response_topics: HashSet::new(),
            pull_topics: HashMap::new(),
            subscribe_topics: HashMap::new(),
        }
    }

    pub fn serves_response(&self, topic: &str) -> bool {
        self.response_topics.contains(topic)
    }

    pub fn pull_options(&self, topic: &str) -> Option<&Value> {
        self.pull_topics.get(topic)
    }

    pub fn subscribe_options(&self, topic: &str) -> Option<&Value> {
        self.subscribe_topics.get(topic)
    }
}

/// A channel-name pattern: a literal name, a glob, or an anchored regex.
#[derive(Debug, Clone)]
pub struct NamePattern {
    raw: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Literal,
    Pattern(Regex),
}

impl NamePattern {
    /// Parse a glob pattern; `*` matches any run, `?` a single character.
    /// A pattern without metacharacters matches as a literal name.
    pub fn glob(raw: &str) -> Result<Self, regex::Error> {
        let matcher = if raw.contains(['*', '?']) {
            Matcher::Pattern(Regex::new(&glob_to_regex(raw))?)
        } else {
            Matcher::Literal
        };
        Ok(Self {
            raw: raw.to_string(),
            matcher,
        })
    }

    /// Parse a regular-expression pattern, anchoring it to the whole name.
    pub fn regexp(raw: &str) -> Result<Self, regex::Error> {
        let mut anchored = String::with_capacity(raw.len() + 2);
        if !raw.starts_with('^') {
            anchored.push('^');
        }
        anchored.push_str(raw);
        if !raw.ends_with('$') {
            anchored.push('$');
        }
        Ok(Self {
            raw: raw.to_string(),
            matcher: Matcher::Pattern(Regex::new(&anchored)?),
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        match &self.matcher {
            Matcher::Literal => self.raw == name,
            Matcher::Pattern(regex) => regex.is_match(name),
        }
    }

    /// The pattern as originally written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::with_capacity(glob.len() + 8);
    regex.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    regex
}

/// An observer of channel lifecycle events matching a pattern.
#[derive(Debug)]
pub struct Monitor {
    pub pattern: NamePattern,
    pub peer: PeerId,
    pub sender: FrameSender,
}

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelName, Channel>,
    peers: HashMap<PeerId, ChannelName>,
    monitors: Vec<Monitor>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel for `peer` under `requested`.
    ///
    /// An empty name gets a generated id; each `#` in the name is replaced
    /// with a generated id until the result is unique; any other name must
    /// be exactly free. Returns `None` when the name cannot be claimed or
    /// the peer already owns a channel.
    pub fn register(
        &mut self,
        requested: &str,
        peer: PeerId,
        sender: FrameSender,
    ) -> Option<ChannelName> {
        if let Some(existing) = self.peers.get(&peer) {
            warn!(
                "register of '{}' refused: peer {} already owns channel '{}'",
                requested, peer, existing
            );
            return None;
        }

        let name = if requested.is_empty() {
            self.generated_name(|_| generated_id())?
        } else if requested.contains('#') {
            self.generated_name(|_| substitute_wildcards(requested))?
        } else {
            if self.channels.contains_key(requested) {
                warn!("register refused: channel '{}' already exists", requested);
                return None;
            }
            requested.to_string()
        };

        self.channels
            .insert(name.clone(), Channel::new(name.clone(), peer, sender));
        self.peers.insert(peer, name.clone());
        info!("registered channel '{}' for peer {}", name, peer);
        Some(name)
    }

    fn generated_name(&self, generate: impl Fn(usize) -> ChannelName) -> Option<ChannelName> {
        // Generated ids collide only pathologically; a bounded retry keeps
        // the loop total.
        for attempt in 0..16 {
            let candidate = generate(attempt);
            if !self.channels.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        warn!("could not generate a unique channel name");
        None
    }

    /// Remove the channel and monitors owned by `peer`, returning the
    /// removed channel record so callers can cascade queue cleanup.
    pub fn remove_peer(&mut self, peer: PeerId) -> Option<Channel> {
        self.monitors.retain(|monitor| monitor.peer != peer);
        let name = self.peers.remove(&peer)?;
        let channel = self.channels.remove(&name);
        debug!("unregistered channel '{}' for peer {}", name, peer);
        channel
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn get_by_peer(&self, peer: PeerId) -> Option<&Channel> {
        self.peers.get(&peer).and_then(|name| self.channels.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Record a response-topic binding on the peer's channel; false when
    /// the peer has no channel.
    pub fn add_response(&mut self, peer: PeerId, topic: &str) -> bool {
        match self.channel_mut_by_peer(peer) {
            Some(channel) => {
                channel.response_topics.insert(topic.to_string());
                true
            }
            None => false,
        }
    }

    /// Record a pull-topic binding; returns the channel name for queue
    /// membership, or `None` when the peer has no channel.
    pub fn add_pull(&mut self, peer: PeerId, topic: &str, options: Value) -> Option<ChannelName> {
        let channel = self.channel_mut_by_peer(peer)?;
        channel.pull_topics.insert(topic.to_string(), options);
        Some(channel.name.clone())
    }

    /// Record a subscribe-topic binding; returns the channel name for queue
    /// membership, or `None` when the peer has no channel.
    pub fn add_subscribe(
        &mut self,
        peer: PeerId,
        topic: &str,
        options: Value,
    ) -> Option<ChannelName> {
        let channel = self.channel_mut_by_peer(peer)?;
        channel.subscribe_topics.insert(topic.to_string(), options);
        Some(channel.name.clone())
    }

    fn channel_mut_by_peer(&mut self, peer: PeerId) -> Option<&mut Channel> {
        let name = self.peers.get(&peer)?;
        self.channels.get_mut(name)
    }

    /// Find the channel serving `topic` as a response topic: the named
    /// target if it qualifies, otherwise any channel that does (the
    /// broker-wide fallback used when the request targeted the broker).
    pub fn find_response_topic(&self, target: &str, topic: &str) -> Option<&Channel> {
        if let Some(channel) = self.channels.get(target) {
            if channel.serves_response(topic) {
                return Some(channel);
            }
        }
        self.channels
            .values()
            .find(|channel| channel.serves_response(topic))
    }

    /// All live channel names matching `pattern`, sorted for determinism.
    pub fn find_channel_names(&self, pattern: &NamePattern) -> Vec<ChannelName> {
        let mut names: Vec<ChannelName> = self
            .channels
            .keys()
            .filter(|name| pattern.matches(name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Register a monitor and return the currently matching names.
    pub fn add_monitor(
        &mut self,
        pattern: NamePattern,
        peer: PeerId,
        sender: FrameSender,
    ) -> Vec<ChannelName> {
        let matches = self.find_channel_names(&pattern);
        self.monitors.push(Monitor {
            pattern,
            peer,
            sender,
        });
        matches
    }

    /// Senders of every monitor whose pattern matches `name`.
    pub fn monitors_matching(&self, name: &str) -> Vec<FrameSender> {
        self.monitors
            .iter()
            .filter(|monitor| monitor.pattern.matches(name))
            .map(|monitor| monitor.sender.clone())
            .collect()
    }

    #[cfg(test)]
    fn monitor_count(&self) -> usize {
        self.monitors.len()
    }
}

fn generated_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn substitute_wildcards(requested: &str) -> ChannelName {
    let mut name = String::with_capacity(requested.len() + 32);
    for ch in requested.chars() {
        if ch == '#' {
            name.push_str(&generated_id());
        } else {
            name.push(ch);
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> FrameSender {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn exact_names_are_unique() {
        let mut registry = ChannelRegistry::new();
        assert_eq!(registry.register("alpha", 1, sender()).as_deref(), Some("alpha"));
        assert_eq!(registry.register("alpha", 2, sender()), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn one_channel_per_peer() {
        let mut registry = ChannelRegistry::new();
        assert!(registry.register("alpha", 1, sender()).is_some());
        assert_eq!(registry.register("beta", 1, sender()), None);
    }

    #[test]
    fn empty_name_is_generated() {
        let mut registry = ChannelRegistry::new();
        let name = registry.register("", 1, sender()).expect("generated name");
        assert!(!name.is_empty());
        assert!(registry.contains(&name));
    }

    #[test]
    fn wildcard_names_substitute_each_hash() {
        let mut registry = ChannelRegistry::new();
        let first = registry.register("worker-#", 1, sender()).expect("first");
        let second = registry.register("worker-#", 2, sender()).expect("second");
        assert_ne!(first, second);
        assert!(first.starts_with("worker-"));
        assert!(second.starts_with("worker-"));
        assert!(!first.contains('#'));
        assert!(registry.contains(&first));
        assert!(registry.contains(&second));
    }

    #[test]
    fn remove_peer_unregisters_exactly_its_channel() {
        let mut registry = ChannelRegistry::new();
        registry.register("alpha", 1, sender());
        registry.register("beta", 2, sender());
        let removed = registry.remove_peer(1).expect("channel removed");
        assert_eq!(removed.name, "alpha");
        assert!(!registry.contains("alpha"));
        assert!(registry.contains("beta"));
        assert!(registry.remove_peer(1).is_none());
    }

    #[test]
    fn response_topic_lookup_falls_back_broker_wide() {
        let mut registry = ChannelRegistry::new();
        registry.register("alpha", 1, sender());
        assert!(registry.add_response(1, "ping"));

        let direct = registry.find_response_topic("alpha", "ping").expect("direct");
        assert_eq!(direct.name, "alpha");

        // Target names the broker, which has no such binding: fall back to
        // scanning every channel.
        let fallback = registry.find_response_topic("broker", "ping").expect("fallback");
        assert_eq!(fallback.name, "alpha");

        assert!(registry.find_response_topic("broker", "pong").is_none());
    }

    #[test]
    fn listener_bindings_require_a_channel() {
        let mut registry = ChannelRegistry::new();
        assert!(!registry.add_response(9, "ping"));
        assert!(registry.add_pull(9, "job", Value::Null).is_none());
        assert!(registry.add_subscribe(9, "news", Value::Null).is_none());
    }

    #[test]
    fn glob_patterns_match_runs_and_single_chars() {
        let pattern = NamePattern::glob("worker-*").expect("glob");
        assert!(pattern.matches("worker-1"));
        assert!(pattern.matches("worker-abc"));
        assert!(!pattern.matches("drone-1"));

        let single = NamePattern::glob("w?rker").expect("glob");
        assert!(single.matches("worker"));
        assert!(!single.matches("wooorker"));

        let literal = NamePattern::glob("alpha").expect("glob");
        assert!(literal.matches("alpha"));
        assert!(!literal.matches("alphabet"));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let pattern = NamePattern::glob("a.b*").expect("glob");
        assert!(pattern.matches("a.b-1"));
        assert!(!pattern.matches("axb-1"));
    }

    #[test]
    fn regexp_patterns_are_anchored() {
        let pattern = NamePattern::regexp("worker-[0-9]+").expect("regexp");
        assert!(pattern.matches("worker-12"));
        assert!(!pattern.matches("worker-12-extra"));
        assert!(!pattern.matches("a-worker-12"));
    }

    #[test]
    fn find_channel_names_is_sorted() {
        let mut registry = ChannelRegistry::new();
        registry.register("worker-b", 1, sender());
        registry.register("worker-a", 2, sender());
        registry.register("drone-1", 3, sender());
        let pattern = NamePattern::glob("worker-*").expect("glob");
        assert_eq!(
            registry.find_channel_names(&pattern),
            vec!["worker-a".to_string(), "worker-b".to_string()]
        );
    }

    #[test]
    fn monitors_report_current_matches_and_die_with_their_peer() {
        let mut registry = ChannelRegistry::new();
        registry.register("worker-a", 1, sender());
        let pattern = NamePattern::glob("worker-*").expect("glob");
        let matches = registry.add_monitor(pattern, 7, sender());
        assert_eq!(matches, vec!["worker-a".to_string()]);
        assert_eq!(registry.monitors_matching("worker-b").len(), 1);
        assert_eq!(registry.monitors_matching("drone-1").len(), 0);

        registry.remove_peer(7);
        assert_eq!(registry.monitor_count(), 0);
    }
}
