use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Clone, Default)]
struct TreeEntry {
    value: Option<String>,
    children: BTreeMap<String, TreeEntry>,
}

/// Serializable view of a tree node. `id` is the full topic path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

/// Effect of one insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeChange {
    /// `node` is the topmost node that did not exist before
    Added { node: TreeNode, parent_id: String },
    /// Only the value of an existing leaf changed
    Updated { node: TreeNode },
    Unchanged,
}

/// Topic namespace seen during a scan, keyed by `/`-separated segments
#[derive(Debug, Clone)]
pub struct TopicTree {
    root_id: String,
    root: TreeEntry,
}

fn child_id(path: Option<&str>, segment: &str) -> String {
    match path {
        Some(path) => format!("{}/{}", path, segment),
        None => segment.to_string(),
    }
}

fn build(entry: &TreeEntry, id: String, title: &str) -> TreeNode {
    let children = entry
        .children
        .iter()
        .map(|(segment, child)| build(child, child_id(Some(&id), segment), segment))
        .collect();
    TreeNode {
        id,
        title: title.to_string(),
        value: entry.value.clone(),
        children,
    }
}

impl TopicTree {
    pub fn new(root_id: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            root: TreeEntry::default(),
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Stores `payload` at `topic`, creating missing intermediate nodes
    pub fn insert(&mut self, topic: &str, payload: &str) -> TreeChange {
        let segments: Vec<&str> = topic.split('/').collect();
        let mut first_new: Option<(usize, String)> = None;
        let mut parent_id = self.root_id.clone();
        let mut path: Option<String> = None;
        let mut entry = &mut self.root;

        for (depth, segment) in segments.iter().enumerate() {
            if first_new.is_none() && !entry.children.contains_key(*segment) {
                first_new = Some((depth, parent_id.clone()));
            }
            entry = entry.children.entry(segment.to_string()).or_default();
            let id = child_id(path.as_deref(), segment);
            parent_id = id.clone();
            path = Some(id);
        }

        let changed = entry.value.as_deref() != Some(payload);
        entry.value = Some(payload.to_string());

        match first_new {
            Some((depth, parent_id)) => TreeChange::Added {
                node: self.node_at(&segments[..=depth]),
                parent_id,
            },
            None if changed => TreeChange::Updated {
                node: self.node_at(&segments),
            },
            None => TreeChange::Unchanged,
        }
    }

    fn node_at(&self, segments: &[&str]) -> TreeNode {
        let mut entry = &self.root;
        let mut path: Option<String> = None;
        for segment in segments {
            if let Some(child) = entry.children.get(*segment) {
                entry = child;
            }
            path = Some(child_id(path.as_deref(), segment));
        }
        let title = segments.last().copied().unwrap_or_default();
        build(entry, path.unwrap_or_else(|| self.root_id.clone()), title)
    }

    /// Top-level nodes with all their descendants. Ids are full topic paths,
    /// the same ids `insert` reports in its changes.
    pub fn snapshot(&self) -> Vec<TreeNode> {
        self.root
            .children
            .iter()
            .map(|(segment, child)| build(child, child_id(None, segment), segment))
            .collect()
    }
}
