//! Session history collaborator.
//!
//! Indexing and parsing session files lives outside the bridge. The server
//! only consumes grouped session records and tree snapshots through the
//! [`SessionCatalog`] trait, and applies tree filters itself.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use agentbridge_protocol::{ErrorCode, SessionGroup, SessionTreeSnapshot, TreeEntry, TreeFilter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("session not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

impl CatalogError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CatalogError::NotFound(_) => ErrorCode::InvalidSessionPath,
            CatalogError::Io { .. } | CatalogError::Parse { .. } => ErrorCode::InternalError,
        }
    }
}

/// Source of persisted session records. Calls may block on disk I/O, so the
/// server runs them on the blocking pool.
pub trait SessionCatalog: Send + Sync + 'static {
    fn list_sessions(&self) -> Result<Vec<SessionGroup>, CatalogError>;

    fn load_tree(&self, session_path: &Path) -> Result<SessionTreeSnapshot, CatalogError>;
}

/// Catalog with no sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySessionCatalog;

impl SessionCatalog for EmptySessionCatalog {
    fn list_sessions(&self) -> Result<Vec<SessionGroup>, CatalogError> {
        Ok(Vec::new())
    }

    fn load_tree(&self, session_path: &Path) -> Result<SessionTreeSnapshot, CatalogError> {
        Err(CatalogError::NotFound(session_path.to_path_buf()))
    }
}

const VISIBLE_ENTRY_TYPES: [&str; 3] = ["message", "compaction", "branch_summary"];

fn keeps(filter: TreeFilter, entry: &TreeEntry) -> bool {
    let is_message = entry.entry_type == "message";
    let role = entry.role.as_deref();
    match filter {
        TreeFilter::All => true,
        TreeFilter::Default => VISIBLE_ENTRY_TYPES.contains(&entry.entry_type.as_str()),
        TreeFilter::NoTools => {
            keeps(TreeFilter::Default, entry) && !(is_message && role == Some("toolResult"))
        }
        TreeFilter::UserOnly => is_message && role == Some("user"),
        TreeFilter::LabeledOnly => entry.label.is_some() || entry.is_bookmarked,
    }
}

/// Apply `filter` to a snapshot.
///
/// Hidden entries are spliced out: each kept entry's parent becomes its
/// nearest kept ancestor, roots are recomputed, and the current leaf moves up
/// to its nearest kept ancestor.
pub fn apply_filter(snapshot: SessionTreeSnapshot, filter: TreeFilter) -> SessionTreeSnapshot {
    if filter == TreeFilter::All {
        return snapshot;
    }

    let parents: HashMap<&str, Option<&str>> = snapshot
        .entries
        .iter()
        .map(|entry| (entry.entry_id.as_str(), entry.parent_id.as_deref()))
        .collect();
    let kept: HashSet<&str> = snapshot
        .entries
        .iter()
        .filter(|entry| keeps(filter, entry))
        .map(|entry| entry.entry_id.as_str())
        .collect();

    // Bounded walk so a malformed (cyclic) tree cannot spin forever.
    let nearest_kept = |start: Option<&str>| -> Option<String> {
        let mut cursor = start;
        for _ in 0..=parents.len() {
            let id = cursor?;
            if kept.contains(id) {
                return Some(id.to_string());
            }
            cursor = parents.get(id).copied().flatten();
        }
        None
    };

    let current_leaf_id = nearest_kept(snapshot.current_leaf_id.as_deref());
    let entries: Vec<TreeEntry> = snapshot
        .entries
        .iter()
        .filter(|entry| kept.contains(entry.entry_id.as_str()))
        .map(|entry| TreeEntry {
            parent_id: nearest_kept(entry.parent_id.as_deref()),
            ..entry.clone()
        })
        .collect();
    let root_ids = entries
        .iter()
        .filter(|entry| entry.parent_id.is_none())
        .map(|entry| entry.entry_id.clone())
        .collect();

    SessionTreeSnapshot {
        root_ids,
        current_leaf_id,
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, parent: Option<&str>, entry_type: &str, role: Option<&str>) -> TreeEntry {
        TreeEntry {
            entry_id: id.to_string(),
            parent_id: parent.map(str::to_string),
            entry_type: entry_type.to_string(),
            role: role.map(str::to_string),
            timestamp: None,
            preview: format!("{id} preview"),
            label: None,
            is_bookmarked: false,
        }
    }

    // model_change -> user -> assistant -> toolResult -> assistant(labeled)
    fn snapshot() -> SessionTreeSnapshot {
        let mut labeled = entry("e5", Some("e4"), "message", Some("assistant"));
        labeled.label = Some("fixed".into());
        SessionTreeSnapshot {
            root_ids: vec!["e1".into()],
            current_leaf_id: Some("e5".into()),
            entries: vec![
                entry("e1", None, "model_change", None),
                entry("e2", Some("e1"), "message", Some("user")),
                entry("e3", Some("e2"), "message", Some("assistant")),
                entry("e4", Some("e3"), "message", Some("toolResult")),
                labeled,
            ],
        }
    }

    fn ids(snapshot: &SessionTreeSnapshot) -> Vec<&str> {
        snapshot
            .entries
            .iter()
            .map(|entry| entry.entry_id.as_str())
            .collect()
    }

    #[test]
    fn all_is_untouched() {
        assert_eq!(apply_filter(snapshot(), TreeFilter::All), snapshot());
    }

    #[test]
    fn default_hides_bookkeeping_and_repoints_roots() {
        let filtered = apply_filter(snapshot(), TreeFilter::Default);
        assert_eq!(ids(&filtered), vec!["e2", "e3", "e4", "e5"]);
        assert_eq!(filtered.root_ids, vec!["e2".to_string()]);
        assert_eq!(filtered.entries[0].parent_id, None);
    }

    #[test]
    fn no_tools_splices_tool_results_out() {
        let filtered = apply_filter(snapshot(), TreeFilter::NoTools);
        assert_eq!(ids(&filtered), vec!["e2", "e3", "e5"]);
        assert_eq!(filtered.entries[2].parent_id.as_deref(), Some("e3"));
        assert_eq!(filtered.current_leaf_id.as_deref(), Some("e5"));
    }

    #[test]
    fn user_only_moves_current_leaf_to_nearest_kept_ancestor() {
        let filtered = apply_filter(snapshot(), TreeFilter::UserOnly);
        assert_eq!(ids(&filtered), vec!["e2"]);
        assert_eq!(filtered.current_leaf_id.as_deref(), Some("e2"));
        assert_eq!(filtered.root_ids, vec!["e2".to_string()]);
    }

    #[test]
    fn labeled_only_keeps_labels_and_bookmarks() {
        let mut tree = snapshot();
        tree.entries[1].is_bookmarked = true;
        let filtered = apply_filter(tree, TreeFilter::LabeledOnly);
        assert_eq!(ids(&filtered), vec!["e2", "e5"]);
        assert_eq!(filtered.entries[1].parent_id.as_deref(), Some("e2"));
    }

    #[test]
    fn cyclic_parents_do_not_hang() {
        let tree = SessionTreeSnapshot {
            root_ids: vec![],
            current_leaf_id: Some("b".into()),
            entries: vec![
                entry("a", Some("b"), "label", None),
                entry("b", Some("a"), "label", None),
            ],
        };
        let filtered = apply_filter(tree, TreeFilter::Default);
        assert!(filtered.entries.is_empty());
        assert_eq!(filtered.current_leaf_id, None);
    }

    #[test]
    fn empty_catalog_reports_missing_sessions() {
        let catalog = EmptySessionCatalog;
        assert!(catalog.list_sessions().unwrap().is_empty());
        let err = catalog.load_tree(Path::new("/s/missing.jsonl")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSessionPath);
    }
}
