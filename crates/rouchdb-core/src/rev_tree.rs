/// The revision tree: a forest of revision paths rooted at each surviving
/// ancestor after stemming.
///
/// Mirrors PouchDB/CouchDB's internal `rev_tree` representation: rather than
/// storing every revision as a flat row keyed by its own id, each document
/// keeps a small tree of `RevNode`s so that conflicts (siblings) and
/// placeholder ancestors (from replication) are represented directly in the
/// structure instead of as separate out-of-band bookkeeping.
use serde::{Deserialize, Serialize};

use crate::document::Revision;

/// A document's revision tree is a list of disjoint root paths. Most
/// documents have exactly one; conflicting edits or disjoint replicated
/// histories produce more.
pub type RevTree = Vec<RevPath>;

/// One root-to-descendants path. `pos` is the generation of `tree`'s root
/// node; descendants increment by one per level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevPath {
    pub pos: u64,
    pub tree: RevNode,
}

/// Whether a revision's body is actually stored, or is a placeholder
/// created while force-inserting a replicated history whose earlier
/// ancestors haven't arrived yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevStatus {
    Available,
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOpts {
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevNode {
    pub hash: String,
    pub status: RevStatus,
    pub opts: NodeOpts,
    pub children: Vec<RevNode>,
}

/// A resolved leaf: its generation, hash, and deletion flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
    pub pos: u64,
    pub hash: String,
    pub deleted: bool,
}

/// Collect every leaf (childless node) across every root path, sorted so
/// that the winning revision is first: non-deleted beats deleted, then
/// higher generation, then lexicographically greater hash.
pub fn collect_leaves(tree: &RevTree) -> Vec<LeafInfo> {
    let mut leaves = Vec::new();
    for path in tree {
        walk_leaves(&path.tree, path.pos, &mut leaves);
    }
    leaves.sort_by(|a, b| {
        (!a.deleted)
            .cmp(&!b.deleted)
            .then_with(|| a.pos.cmp(&b.pos))
            .then_with(|| a.hash.cmp(&b.hash))
            .reverse()
    });
    leaves
}

fn walk_leaves(node: &RevNode, pos: u64, out: &mut Vec<LeafInfo>) {
    if node.children.is_empty() {
        out.push(LeafInfo {
            pos,
            hash: node.hash.clone(),
            deleted: node.opts.deleted,
        });
        return;
    }
    for child in &node.children {
        walk_leaves(child, pos + 1, out);
    }
}

/// Look up a specific (pos, hash) node anywhere in the tree.
pub fn find_node<'a>(tree: &'a RevTree, pos: u64, hash: &str) -> Option<&'a RevNode> {
    for path in tree {
        if let Some(found) = find_in_node(&path.tree, path.pos, pos, hash) {
            return Some(found);
        }
    }
    None
}

fn find_in_node<'a>(
    node: &'a RevNode,
    current_pos: u64,
    target_pos: u64,
    target_hash: &str,
) -> Option<&'a RevNode> {
    if current_pos == target_pos && node.hash == target_hash {
        return Some(node);
    }
    for child in &node.children {
        if let Some(found) = find_in_node(child, current_pos + 1, target_pos, target_hash) {
            return Some(found);
        }
    }
    None
}

/// Walk from `pos`/`hash` toward the root, returning the full ancestor
/// chain (including the starting revision) in leaf-to-root order, as
/// CouchDB's `_revisions.ids` represents it.
pub fn revision_history(tree: &RevTree, pos: u64, hash: &str) -> Option<Vec<Revision>> {
    for path in tree {
        if let Some(chain) = history_in_node(&path.tree, path.pos, pos, hash, Vec::new()) {
            return Some(chain);
        }
    }
    None
}

fn history_in_node(
    node: &RevNode,
    current_pos: u64,
    target_pos: u64,
    target_hash: &str,
    mut ancestry: Vec<Revision>,
) -> Option<Vec<Revision>> {
    ancestry.push(Revision::new(current_pos, node.hash.clone()));
    if current_pos == target_pos && node.hash == target_hash {
        ancestry.reverse();
        return Some(ancestry);
    }
    if current_pos > target_pos {
        return None;
    }
    for child in &node.children {
        if let Some(found) = history_in_node(child, current_pos + 1, target_pos, target_hash, ancestry.clone())
        {
            return Some(found);
        }
    }
    None
}

/// Build a single linear `RevPath` from a leaf-to-root hash chain (the
/// format CouchDB's `_revisions.ids` uses), with the given options and
/// status applied to the leaf. Ancestor nodes are `Available` with default
/// options unless overridden by the caller via [`build_path_with_statuses`].
pub fn build_path_from_revs(
    leaf_pos: u64,
    hashes_leaf_to_root: &[String],
    leaf_opts: NodeOpts,
    leaf_status: RevStatus,
) -> RevPath {
    let statuses = vec![RevStatus::Available; hashes_leaf_to_root.len().saturating_sub(1)];
    build_path_with_statuses(leaf_pos, hashes_leaf_to_root, leaf_opts, leaf_status, &statuses)
}

/// Like [`build_path_from_revs`], but lets the caller specify the status of
/// each ancestor node (leaf-to-root order, excluding the leaf itself, which
/// uses `leaf_status`). Used by force-insert to mark not-yet-seen ancestors
/// as `Missing` placeholders.
pub fn build_path_with_statuses(
    leaf_pos: u64,
    hashes_leaf_to_root: &[String],
    leaf_opts: NodeOpts,
    leaf_status: RevStatus,
    ancestor_statuses: &[RevStatus],
) -> RevPath {
    assert!(!hashes_leaf_to_root.is_empty(), "empty revision chain");
    let root_pos = leaf_pos + 1 - hashes_leaf_to_root.len() as u64;

    let mut node: Option<RevNode> = None;
    for (i, hash) in hashes_leaf_to_root.iter().rev().enumerate() {
        let depth_from_root = i;
        let is_leaf = depth_from_root == hashes_leaf_to_root.len() - 1;
        let status = if is_leaf {
            leaf_status
        } else {
            // ancestor_statuses is indexed root-to-leaf-minus-one
            ancestor_statuses
                .get(depth_from_root)
                .copied()
                .unwrap_or(RevStatus::Available)
        };
        let opts = if is_leaf {
            leaf_opts.clone()
        } else {
            NodeOpts::default()
        };
        node = Some(RevNode {
            hash: hash.clone(),
            status,
            opts,
            children: match node {
                Some(child) => vec![child],
                None => vec![],
            },
        });
    }

    RevPath {
        pos: root_pos,
        tree: node.expect("chain is non-empty"),
    }
}
