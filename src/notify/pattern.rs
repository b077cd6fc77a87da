use super::SubscriptionId;
use std::collections::HashMap;

/// What a subscription matches: one name, or every name under a prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pattern {
    Exact(String),
    Prefix(String),
}

impl Pattern {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Exact(exact) => exact == name,
            Pattern::Prefix(prefix) => name.starts_with(prefix.as_str()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Pattern::Exact(s) | Pattern::Prefix(s) => s,
        }
    }

    /// Everything in the store
    pub fn all() -> Self {
        Pattern::Prefix(String::new())
    }
}

/// Byte trie indexing subscriptions by exact name and by prefix
pub struct PatternTrie {
    root: TrieNode,
    len: usize,
}

impl Default for PatternTrie {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<u8, Box<TrieNode>>,
    exact: Vec<SubscriptionId>,
    prefix: Vec<SubscriptionId>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.exact.is_empty() && self.prefix.is_empty()
    }
}

impl PatternTrie {
    pub fn new() -> Self {
        Self {
            root: TrieNode::default(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, pattern: &Pattern, id: SubscriptionId) {
        let mut node = &mut self.root;
        for &b in pattern.as_str().as_bytes() {
            node = node.children.entry(b).or_default();
        }

        match pattern {
            Pattern::Exact(_) => node.exact.push(id),
            Pattern::Prefix(_) => node.prefix.push(id),
        }
        self.len += 1;
    }

    pub fn remove(&mut self, pattern: &Pattern, id: SubscriptionId) -> bool {
        let removed = Self::remove_from_node(&mut self.root, pattern, 0, id);
        if removed {
            self.len -= 1;
        }
        removed
    }

    fn remove_from_node(
        node: &mut TrieNode,
        pattern: &Pattern,
        pos: usize,
        id: SubscriptionId,
    ) -> bool {
        let key = pattern.as_str().as_bytes();

        if pos == key.len() {
            let list = match pattern {
                Pattern::Exact(_) => &mut node.exact,
                Pattern::Prefix(_) => &mut node.prefix,
            };
            let before_len = list.len();
            list.retain(|&sub| sub != id);
            return list.len() < before_len;
        }

        let b = key[pos];
        let (removed, prune) = match node.children.get_mut(&b) {
            Some(child) => {
                let removed = Self::remove_from_node(child, pattern, pos + 1, id);
                (removed, child.is_empty())
            }
            None => (false, false),
        };
        if prune {
            node.children.remove(&b);
        }
        removed
    }

    /// Collect every subscription whose pattern matches `name`
    pub fn find_matches(&self, name: &str) -> Vec<SubscriptionId> {
        let mut matches = Vec::new();
        let mut node = &self.root;
        matches.extend_from_slice(&node.prefix);

        for &b in name.as_bytes() {
            match node.children.get(&b) {
                Some(child) => {
                    node = child;
                    matches.extend_from_slice(&node.prefix);
                }
                None => return matches,
            }
        }

        matches.extend_from_slice(&node.exact);
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_prefix_matching() {
        let mut trie = PatternTrie::new();
        trie.insert(&Pattern::Exact("/datatable/x".into()), 1);
        trie.insert(&Pattern::Prefix("/datatable/".into()), 2);
        trie.insert(&Pattern::all(), 3);
        trie.insert(&Pattern::Prefix("/SmartDashboard/".into()), 4);

        let mut found = trie.find_matches("/datatable/x");
        found.sort();
        assert_eq!(found, vec![1, 2, 3]);

        let mut found = trie.find_matches("/datatable/xy");
        found.sort();
        assert_eq!(found, vec![2, 3]);

        assert_eq!(trie.find_matches("/other"), vec![3]);
    }

    #[test]
    fn remove_prunes_branches() {
        let mut trie = PatternTrie::new();
        let pattern = Pattern::Prefix("/a/b/".into());
        trie.insert(&pattern, 7);
        assert_eq!(trie.len(), 1);

        assert!(!trie.remove(&Pattern::Exact("/a/b/".into()), 7));
        assert!(trie.remove(&pattern, 7));
        assert!(!trie.remove(&pattern, 7));
        assert!(trie.is_empty());
        assert!(trie.root.is_empty());
        assert!(trie.find_matches("/a/b/c").is_empty());
    }

    #[test]
    fn pattern_match_agrees_with_trie() {
        let exact = Pattern::Exact("/x".into());
        assert!(exact.matches("/x"));
        assert!(!exact.matches("/xy"));
        assert!(Pattern::Prefix("/x".into()).matches("/xy"));
        assert!(Pattern::all().matches("anything"));
    }
}
