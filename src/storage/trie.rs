use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::key::hash;

/// Hierarchical index over query-identifier parts, used for correct prefix
/// invalidation (spec.md §4.3).
///
/// Each path segment is indexed by *its own* structural hash, not by a raw
/// string slice of the parent identifier — that's what keeps `["user"]` from
/// matching `["users"]`: the hash of the string `"user"` is never a prefix of
/// the hash of `"users"` the way the raw strings would be.
#[derive(Default)]
pub struct PrefixTrie {
    root: TrieNode,
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    /// Full hashed keys of every entry whose identifier passes through this node.
    keys: HashSet<String>,
}

impl PrefixTrie {
    pub fn new() -> Self {
        PrefixTrie::default()
    }

    /// Indexes `full_hash` under every prefix of `parts` (including the empty prefix).
    pub fn insert(&mut self, parts: &[Value], full_hash: &str) {
        let part_hashes = Self::part_hashes(parts);
        Self::insert_node(&mut self.root, &part_hashes, full_hash);
    }

    /// Removes `full_hash` from every prefix of `parts`, pruning dead nodes.
    pub fn remove(&mut self, parts: &[Value], full_hash: &str) {
        let part_hashes = Self::part_hashes(parts);
        Self::remove_node(&mut self.root, &part_hashes, full_hash);
    }

    /// Every hashed key whose identifier starts with `prefix`.
    pub fn matching_keys(&self, prefix: &[Value]) -> HashSet<String> {
        let part_hashes = Self::part_hashes(prefix);
        let mut node = &self.root;
        for hash in &part_hashes {
            match node.children.get(hash) {
                Some(child) => node = child,
                None => return HashSet::new(),
            }
        }
        node.keys.clone()
    }

    fn part_hashes(parts: &[Value]) -> Vec<String> {
        parts
            .iter()
            .map(|part| hash::hash(part).unwrap_or_else(|_| "<unhashable>".to_string()))
            .collect()
    }

    fn insert_node(node: &mut TrieNode, parts: &[String], full_hash: &str) {
        node.keys.insert(full_hash.to_string());
        if let Some((first, rest)) = parts.split_first() {
            let child = node.children.entry(first.clone()).or_default();
            Self::insert_node(child, rest, full_hash);
        }
    }

    fn remove_node(node: &mut TrieNode, parts: &[String], full_hash: &str) {
        node.keys.remove(full_hash);
        if let Some((first, rest)) = parts.split_first() {
            let mut prune = false;
            if let Some(child) = node.children.get_mut(first) {
                Self::remove_node(child, rest, full_hash);
                prune = child.keys.is_empty() && child.children.is_empty();
            }
            if prune {
                node.children.remove(first);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefix_does_not_match_unrelated_sibling() {
        let mut trie = PrefixTrie::new();
        trie.insert(&[json!("user")], "hash_user");
        trie.insert(&[json!("users")], "hash_users");

        let matches = trie.matching_keys(&[json!("user")]);
        assert_eq!(matches, HashSet::from(["hash_user".to_string()]));
    }

    #[test]
    fn matches_every_descendant_of_a_prefix() {
        let mut trie = PrefixTrie::new();
        trie.insert(&[json!("user"), json!(1)], "hash_user_1");
        trie.insert(&[json!("user"), json!(2)], "hash_user_2");
        trie.insert(&[json!("post"), json!(1)], "hash_post_1");

        let matches = trie.matching_keys(&[json!("user")]);
        assert_eq!(
            matches,
            HashSet::from(["hash_user_1".to_string(), "hash_user_2".to_string()])
        );
    }

    #[test]
    fn remove_prunes_dead_nodes_without_disturbing_siblings() {
        let mut trie = PrefixTrie::new();
        trie.insert(&[json!("user"), json!(1)], "hash_user_1");
        trie.insert(&[json!("user"), json!(2)], "hash_user_2");

        trie.remove(&[json!("user"), json!(1)], "hash_user_1");

        let matches = trie.matching_keys(&[json!("user")]);
        assert_eq!(matches, HashSet::from(["hash_user_2".to_string()]));

        trie.remove(&[json!("user"), json!(2)], "hash_user_2");
        assert!(trie.matching_keys(&[json!("user")]).is_empty());
    }
}
