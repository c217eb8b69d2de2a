//! Topic trie
//!
//! Prefix tree keyed by topic level, used to index topic filters so that a
//! publish visits only the branches that can match. Results are identical
//! to running [`super::matches`] against every stored filter.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug)]
struct TrieNode<V> {
    /// Value for a filter ending exactly at this node
    value: Option<V>,
    children: AHashMap<CompactString, TrieNode<V>>,
    /// `+` child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Value for a filter ending in `#` at this node
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::new(),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic filter index
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
    len: usize,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
            len: 0,
        }
    }

    /// Number of stored filters
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert or replace the value stored for `filter`, returning the old one
    pub fn insert(&mut self, filter: &str, value: V) -> Option<V> {
        let mut node = &mut self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            if level == "#" {
                let old = node.multi_wildcard.replace(value);
                if old.is_none() {
                    self.len += 1;
                }
                return old;
            }

            node = if level == "+" {
                &mut **node
                    .single_wildcard
                    .get_or_insert_with(|| Box::new(TrieNode::new()))
            } else {
                node.children.entry(CompactString::new(level)).or_default()
            };

            if levels.peek().is_none() {
                break;
            }
        }

        let old = node.value.replace(value);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    pub fn get(&self, filter: &str) -> Option<&V> {
        let mut node = &self.root;
        let mut levels = filter.split('/').peekable();

        while let Some(level) = levels.next() {
            match level {
                "#" => return node.multi_wildcard.as_ref(),
                "+" => node = node.single_wildcard.as_deref()?,
                _ => node = node.children.get(level)?,
            }
            if levels.peek().is_none() {
                break;
            }
        }

        node.value.as_ref()
    }

    /// Remove `filter`, pruning branches left empty
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        let removed = Self::remove_at(&mut self.root, &levels);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_at(node: &mut TrieNode<V>, levels: &[&str]) -> Option<V> {
        let Some((&level, rest)) = levels.split_first() else {
            return node.value.take();
        };

        match level {
            "#" => node.multi_wildcard.take(),
            "+" => {
                let child = node.single_wildcard.as_deref_mut()?;
                let removed = Self::remove_at(child, rest);
                if child.is_empty() {
                    node.single_wildcard = None;
                }
                removed
            }
            _ => {
                let child = node.children.get_mut(level)?;
                let removed = Self::remove_at(child, rest);
                if child.is_empty() {
                    node.children.remove(level);
                }
                removed
            }
        }
    }

    /// Call `callback` with every value whose filter matches `topic`
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        let dollar = topic.starts_with('$');
        Self::matches_at(&self.root, &levels, dollar, &mut callback);
    }

    /// `skip_wildcards` is only set at the root of a `$` topic
    fn matches_at<F>(node: &TrieNode<V>, levels: &[&str], skip_wildcards: bool, callback: &mut F)
    where
        F: FnMut(&V),
    {
        if !skip_wildcards {
            if let Some(v) = &node.multi_wildcard {
                callback(v);
            }
        }

        let Some((&level, rest)) = levels.split_first() else {
            if let Some(v) = &node.value {
                callback(v);
            }
            return;
        };

        if !skip_wildcards {
            if let Some(child) = &node.single_wildcard {
                Self::matches_at(child, rest, false, callback);
            }
        }
        if let Some(child) = node.children.get(level) {
            Self::matches_at(child, rest, false, callback);
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(trie: &TopicTrie<u32>, topic: &str) -> Vec<u32> {
        let mut found = Vec::new();
        trie.matches(topic, |v| found.push(*v));
        found.sort_unstable();
        found
    }

    #[test]
    fn test_exact_and_wildcards() {
        let mut trie = TopicTrie::new();
        trie.insert("test/topic", 1);
        trie.insert("test/+", 2);
        trie.insert("+/topic", 3);
        trie.insert("test/#", 4);
        trie.insert("#", 5);

        assert_eq!(collect(&trie, "test/topic"), vec![1, 2, 3, 4, 5]);
        assert_eq!(collect(&trie, "test"), vec![4, 5]);
        assert_eq!(collect(&trie, "other/thing"), vec![5]);
    }

    #[test]
    fn test_dollar_topics() {
        let mut trie = TopicTrie::new();
        trie.insert("#", 1);
        trie.insert("+/test", 2);
        trie.insert("$SYS/#", 3);
        trie.insert("$SYS/+", 4);

        assert_eq!(collect(&trie, "$SYS/test"), vec![3, 4]);
    }

    #[test]
    fn test_replace_and_len() {
        let mut trie = TopicTrie::new();
        assert_eq!(trie.insert("a/b", 1), None);
        assert_eq!(trie.insert("a/b", 2), Some(1));
        assert_eq!(trie.insert("a/#", 3), None);
        assert_eq!(trie.len(), 2);
        assert_eq!(trie.get("a/b"), Some(&2));
        assert_eq!(trie.get("a/#"), Some(&3));
        assert_eq!(trie.get("a"), None);
    }

    #[test]
    fn test_remove_prunes() {
        let mut trie = TopicTrie::new();
        trie.insert("a/+/c", 1);
        trie.insert("a/b", 2);

        assert_eq!(trie.remove("a/+/c"), Some(1));
        assert_eq!(trie.remove("a/+/c"), None);
        assert!(collect(&trie, "a/b/c").is_empty());
        assert_eq!(collect(&trie, "a/b"), vec![2]);

        assert_eq!(trie.remove("a/b"), Some(2));
        assert!(trie.is_empty());
        assert!(trie.root.is_empty());
    }
}
