//! Scan session state machine
//!
//! A session starts collecting when the first client asks for a scan. Messages
//! arriving during the grace period only fill the tree; when it expires every
//! waiting client gets one full snapshot and the session switches to streaming,
//! where each message becomes an `add` or `update` diff for all clients.

use serde::Serialize;
use statum::{machine, state};
use tracing::{debug, info};

use crate::scan::topic_tree::{TopicTree, TreeChange, TreeNode};

/// Scan output for one client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ScanEvent {
    List {
        uuid: String,
        data: Vec<TreeNode>,
    },
    Add {
        uuid: String,
        node: TreeNode,
        parent_id: String,
    },
    Update {
        uuid: String,
        node: TreeNode,
    },
}

#[state]
#[derive(Debug, Clone)]
pub enum ScanState {
    Collecting,
    Streaming,
}

#[machine]
#[derive(Debug)]
pub struct ScanSession<S: ScanState> {
    // Namespace seen so far
    tree: TopicTree,

    // Clients in request order
    clients: Vec<String>,
}

impl<S: ScanState> ScanSession<S> {
    pub fn tree(&self) -> &TopicTree {
        &self.tree
    }

    pub fn clients(&self) -> &[String] {
        &self.clients
    }

    fn add_client(&mut self, uuid: String) -> bool {
        if self.clients.contains(&uuid) {
            return false;
        }
        self.clients.push(uuid);
        true
    }
}

impl ScanSession<Collecting> {
    pub fn create(root_id: &str, first_client: String) -> Self {
        Self::new(TopicTree::new(root_id), vec![first_client])
    }

    pub fn join(&mut self, uuid: String) -> bool {
        self.add_client(uuid)
    }

    pub fn collect(&mut self, topic: &str, payload: &str) {
        self.tree.insert(topic, payload);
    }

    /// Ends the grace period: one snapshot per waiting client
    pub fn start_streaming(self) -> (ScanSession<Streaming>, Vec<ScanEvent>) {
        let snapshot = self.tree.snapshot();
        let events = self
            .clients
            .iter()
            .map(|uuid| ScanEvent::List {
                uuid: uuid.clone(),
                data: snapshot.clone(),
            })
            .collect();
        info!(
            "Scan grace period over, sending snapshot to {} clients",
            self.clients.len()
        );
        (self.transition(), events)
    }
}

impl ScanSession<Streaming> {
    /// Late client: immediate snapshot, then diffs
    pub fn join(&mut self, uuid: String) -> ScanEvent {
        self.add_client(uuid.clone());
        ScanEvent::List {
            uuid,
            data: self.tree.snapshot(),
        }
    }

    pub fn stream(&mut self, topic: &str, payload: &str) -> Vec<ScanEvent> {
        match self.tree.insert(topic, payload) {
            TreeChange::Added { node, parent_id } => self
                .clients
                .iter()
                .map(|uuid| ScanEvent::Add {
                    uuid: uuid.clone(),
                    node: node.clone(),
                    parent_id: parent_id.clone(),
                })
                .collect(),
            TreeChange::Updated { node } => self
                .clients
                .iter()
                .map(|uuid| ScanEvent::Update {
                    uuid: uuid.clone(),
                    node: node.clone(),
                })
                .collect(),
            TreeChange::Unchanged => Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
enum ScanPhase {
    #[default]
    Idle,
    Collecting(ScanSession<Collecting>),
    Streaming(ScanSession<Streaming>),
}

/// What the caller has to do after a scan request
#[derive(Debug, Clone, PartialEq)]
pub enum ScanStart {
    /// New session: subscribe the scan topic and arm the grace timer
    Started,
    /// Joined the running grace period
    Joined,
    /// Streaming already, deliver this snapshot now
    Snapshot(ScanEvent),
}

/// Holder of the (at most one) scan session
#[derive(Debug)]
pub struct Scanner {
    scan_topic: String,
    phase: ScanPhase,
}

impl Scanner {
    pub fn new(scan_topic: impl Into<String>) -> Self {
        Self {
            scan_topic: scan_topic.into(),
            phase: ScanPhase::Idle,
        }
    }

    pub fn scan_topic(&self) -> &str {
        &self.scan_topic
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.phase, ScanPhase::Idle)
    }

    pub fn is_collecting(&self) -> bool {
        matches!(self.phase, ScanPhase::Collecting(_))
    }

    pub fn request(&mut self, uuid: String) -> ScanStart {
        if !self.is_active() {
            info!("Scan started by {} on {}", uuid, self.scan_topic);
            self.phase = ScanPhase::Collecting(ScanSession::create(&self.scan_topic, uuid));
            return ScanStart::Started;
        }
        match &mut self.phase {
            ScanPhase::Idle => ScanStart::Started,
            ScanPhase::Collecting(session) => {
                debug!("Scan client {} joined during grace period", uuid);
                session.join(uuid);
                ScanStart::Joined
            }
            ScanPhase::Streaming(session) => {
                debug!("Scan client {} joined while streaming", uuid);
                ScanStart::Snapshot(session.join(uuid))
            }
        }
    }

    /// Grace timer fired; ignored unless a session is collecting
    pub fn grace_expired(&mut self) -> Vec<ScanEvent> {
        match std::mem::take(&mut self.phase) {
            ScanPhase::Collecting(session) => {
                let (session, events) = session.start_streaming();
                self.phase = ScanPhase::Streaming(session);
                events
            }
            other => {
                self.phase = other;
                Vec::new()
            }
        }
    }

    /// Feeds one broker message into the active session
    pub fn process(&mut self, topic: &str, payload: &str) -> Vec<ScanEvent> {
        match &mut self.phase {
            ScanPhase::Idle => Vec::new(),
            ScanPhase::Collecting(session) => {
                session.collect(topic, payload);
                Vec::new()
            }
            ScanPhase::Streaming(session) => session.stream(topic, payload),
        }
    }

    /// Drops the session; returns whether one was active
    pub fn stop(&mut self) -> bool {
        let was_active = self.is_active();
        if was_active {
            info!("Scan stopped");
        }
        self.phase = ScanPhase::Idle;
        was_active
    }
}
