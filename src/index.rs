/// In-memory branch index over the log.
///
/// Rebuilt from the entry list on load and kept live by `record` on every
/// append. The leaf is the cursor identifying the current branch tip; moving
/// it (`branch_to`) never appends. Labels live in a side map rebuilt from
/// label entries in log order, last write wins.
use std::collections::HashMap;

use crate::entry::{SessionEntry, generate_entry_id};
use crate::error::{AgentError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub id: String,
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Default)]
pub struct BranchIndex {
    by_id: HashMap<String, usize>,
    /// parent id → child ids, in append order.
    children: HashMap<String, Vec<String>>,
    roots: Vec<String>,
    leaf: Option<String>,
    labels: HashMap<String, String>,
}

impl BranchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from scratch; the leaf lands on the last entry in log order.
    pub fn rebuild(entries: &[SessionEntry]) -> Self {
        let mut index = Self::new();
        for (i, entry) in entries.iter().enumerate() {
            index.record(entry, i);
        }
        index
    }

    /// Track a newly appended entry and move the leaf onto it.
    pub fn record(&mut self, entry: &SessionEntry, position: usize) {
        let id = entry.id().to_string();
        self.by_id.insert(id.clone(), position);
        match entry.parent_id() {
            Some(parent) => self
                .children
                .entry(parent.to_string())
                .or_default()
                .push(id.clone()),
            None => self.roots.push(id.clone()),
        }
        if let SessionEntry::Label {
            target_id, label, ..
        } = entry
        {
            match label {
                Some(name) => self.labels.insert(target_id.clone(), name.clone()),
                None => self.labels.remove(target_id),
            };
        }
        self.leaf = Some(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    pub fn entry<'a>(&self, entries: &'a [SessionEntry], id: &str) -> Option<&'a SessionEntry> {
        self.position(id).and_then(|i| entries.get(i))
    }

    pub fn leaf(&self) -> Option<&str> {
        self.leaf.as_deref()
    }

    /// Move the leaf without appending. The target must exist.
    pub fn branch_to(&mut self, id: &str) -> Result<()> {
        if !self.contains(id) {
            return Err(AgentError::UnknownEntry(id.to_string()));
        }
        self.leaf = Some(id.to_string());
        Ok(())
    }

    /// Detach the leaf entirely (empty branch).
    pub fn reset_leaf(&mut self) {
        self.leaf = None;
    }

    pub(crate) fn set_leaf(&mut self, id: Option<String>) {
        self.leaf = id;
    }

    /// Children of an entry, in append order.
    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// An 8-hex id unused in this log.
    pub fn next_id(&self) -> String {
        let taken = self.by_id.keys().cloned().collect();
        generate_entry_id(&taken)
    }

    pub fn label(&self, target_id: &str) -> Option<&str> {
        self.labels.get(target_id).map(String::as_str)
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    /// Ordered path from the root to `leaf_id` (inclusive). The walk follows
    /// parent pointers, so entries not on the branch never appear.
    pub fn path_to<'a>(
        &self,
        entries: &'a [SessionEntry],
        leaf_id: Option<&str>,
    ) -> Vec<&'a SessionEntry> {
        let mut path = Vec::new();
        let mut current = leaf_id.map(str::to_string);
        while let Some(id) = current {
            let Some(position) = self.position(&id) else {
                break;
            };
            let entry = &entries[position];
            path.push(entry);
            current = entry.parent_id().map(str::to_string);
        }
        path.reverse();
        path
    }

    /// Path to the current leaf.
    pub fn current_path<'a>(&self, entries: &'a [SessionEntry]) -> Vec<&'a SessionEntry> {
        self.path_to(entries, self.leaf())
    }

    /// The full tree, roots first. Siblings sort by timestamp ascending with
    /// the entry id as a stable tiebreaker.
    pub fn tree(&self, entries: &[SessionEntry]) -> Vec<TreeNode> {
        let mut roots = self.roots.clone();
        self.sort_siblings(entries, &mut roots);
        roots
            .into_iter()
            .map(|id| self.build_node(entries, id))
            .collect()
    }

    fn build_node(&self, entries: &[SessionEntry], id: String) -> TreeNode {
        let mut child_ids = self.children(&id).to_vec();
        self.sort_siblings(entries, &mut child_ids);
        TreeNode {
            children: child_ids
                .into_iter()
                .map(|c| self.build_node(entries, c))
                .collect(),
            id,
        }
    }

    fn sort_siblings(&self, entries: &[SessionEntry], ids: &mut [String]) {
        ids.sort_by(|a, b| {
            let ta = self.entry(entries, a).map(|e| e.timestamp()).unwrap_or("");
            let tb = self.entry(entries, b).map(|e| e.timestamp()).unwrap_or("");
            ta.cmp(tb).then_with(|| a.cmp(b))
        });
    }
}
