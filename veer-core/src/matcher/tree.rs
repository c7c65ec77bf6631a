//! Segment trie for `Path`/`PathSubtree` patterns.
//!
//! Unlike a best-match router, lookup returns *every* pattern the path could
//! satisfy, annotated with the number of literal bytes matched, so the
//! matcher can run free predicates over all candidates and rank survivors.
//!
//! Pattern syntax: literal segments, `:name` single-segment parameters and a
//! trailing `*name` catch-all (one or more segments).
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct PathTree<T> {
    root: Node<T>,
}

#[derive(Debug)]
struct Node<T> {
    literals: HashMap<String, Node<T>>,
    param: Option<Box<(String, Node<T>)>>,
    catch_all: Vec<(String, T)>,
    exact: Vec<T>,
    subtree: Vec<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            literals: HashMap::new(),
            param: None,
            catch_all: Vec::new(),
            exact: Vec::new(),
            subtree: Vec::new(),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum InsertError {
    #[error("conflicting parameter names at the same position: :{existing} vs :{new}")]
    ParamNameConflict { existing: String, new: String },
    #[error("catch-all segment *{0} must be the last segment")]
    CatchAllNotLast(String),
}

/// One pattern a lookup path satisfies.
#[derive(Debug)]
pub struct PathMatch<'a, T> {
    pub value: &'a T,
    pub params: Vec<(String, String)>,
    /// Number of literal bytes of the path covered by non-wildcard segments;
    /// the matcher's second-order tie break.
    pub literal_len: usize,
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl<T> PathTree<T> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
        }
    }

    /// Register a full-path pattern (`Path` predicate).
    pub fn insert_exact(&mut self, pattern: &str, value: T) -> Result<(), InsertError> {
        let segs = segments(pattern);
        let mut node = &mut self.root;
        for (i, seg) in segs.iter().enumerate() {
            if let Some(name) = seg.strip_prefix('*') {
                if i + 1 != segs.len() {
                    return Err(InsertError::CatchAllNotLast(name.to_string()));
                }
                node.catch_all.push((name.to_string(), value));
                return Ok(());
            }
            node = Self::descend(node, seg)?;
        }
        node.exact.push(value);
        Ok(())
    }

    /// Register a prefix pattern (`PathSubtree` predicate): matches the
    /// prefix itself and everything below it, capturing the remainder under
    /// the `*` parameter.
    pub fn insert_subtree(&mut self, pattern: &str, value: T) -> Result<(), InsertError> {
        let segs = segments(pattern);
        let mut node = &mut self.root;
        for seg in &segs {
            node = Self::descend(node, seg)?;
        }
        node.subtree.push(value);
        Ok(())
    }

    fn descend<'n>(node: &'n mut Node<T>, seg: &str) -> Result<&'n mut Node<T>, InsertError> {
        if let Some(name) = seg.strip_prefix(':') {
            let param = node
                .param
                .get_or_insert_with(|| Box::new((name.to_string(), Node::default())));
            if param.0 != name {
                return Err(InsertError::ParamNameConflict {
                    existing: param.0.clone(),
                    new: name.to_string(),
                });
            }
            Ok(&mut param.1)
        } else {
            Ok(node.literals.entry(seg.to_string()).or_default())
        }
    }

    /// All candidates for `path`, deepest literal chains first, wildcard and
    /// subtree matches after the branches below them.
    pub fn lookup(&self, path: &str) -> Vec<PathMatch<'_, T>> {
        let segs = segments(path);
        let mut out = Vec::new();
        let mut params = Vec::new();
        Self::walk(&self.root, &segs, 0, &mut params, &mut out);
        out
    }

    fn walk<'t>(
        node: &'t Node<T>,
        segs: &[&str],
        literal_len: usize,
        params: &mut Vec<(String, String)>,
        out: &mut Vec<PathMatch<'t, T>>,
    ) {
        match segs.split_first() {
            None => {
                for value in &node.exact {
                    out.push(PathMatch {
                        value,
                        params: params.clone(),
                        literal_len,
                    });
                }
                for value in &node.subtree {
                    let mut params = params.clone();
                    params.push(("*".to_string(), "/".to_string()));
                    out.push(PathMatch {
                        value,
                        params,
                        literal_len,
                    });
                }
            }
            Some((seg, rest)) => {
                if let Some(child) = node.literals.get(*seg) {
                    Self::walk(child, rest, literal_len + seg.len() + 1, params, out);
                }
                if let Some(param) = &node.param {
                    params.push((param.0.clone(), seg.to_string()));
                    Self::walk(&param.1, rest, literal_len, params, out);
                    params.pop();
                }
                let remainder = segs.join("/");
                for (name, value) in &node.catch_all {
                    let mut params = params.clone();
                    params.push((name.clone(), remainder.clone()));
                    out.push(PathMatch {
                        value,
                        params,
                        literal_len,
                    });
                }
                for value in &node.subtree {
                    let mut params = params.clone();
                    params.push(("*".to_string(), format!("/{remainder}")));
                    out.push(PathMatch {
                        value,
                        params,
                        literal_len,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values<T: Copy>(matches: &[PathMatch<'_, T>]) -> Vec<T> {
        matches.iter().map(|m| *m.value).collect()
    }

    #[test]
    fn exact_wins_ordering_over_param() {
        let mut tree = PathTree::new();
        tree.insert_exact("/a/b", 1).unwrap();
        tree.insert_exact("/a/:x", 2).unwrap();
        let matches = tree.lookup("/a/b");
        assert_eq!(values(&matches), vec![1, 2]);
        assert!(matches[0].literal_len > matches[1].literal_len);
        assert_eq!(matches[1].params, vec![("x".to_string(), "b".to_string())]);
    }

    #[test]
    fn subtree_matches_prefix_and_below() {
        let mut tree = PathTree::new();
        tree.insert_subtree("/p", 7).unwrap();
        let at_prefix = tree.lookup("/p");
        assert_eq!(values(&at_prefix), vec![7]);
        assert_eq!(at_prefix[0].params[0].1, "/");

        let below = tree.lookup("/p/x/y");
        assert_eq!(values(&below), vec![7]);
        assert_eq!(below[0].params[0].1, "/x/y");

        assert!(tree.lookup("/q").is_empty());
    }

    #[test]
    fn deeper_subtree_listed_before_shallower() {
        let mut tree = PathTree::new();
        tree.insert_subtree("/a", 1).unwrap();
        tree.insert_subtree("/a/b", 2).unwrap();
        let matches = tree.lookup("/a/b/c");
        assert_eq!(values(&matches), vec![2, 1]);
    }

    #[test]
    fn catch_all_requires_at_least_one_segment() {
        let mut tree = PathTree::new();
        tree.insert_exact("/files/*rest", 3).unwrap();
        assert!(tree.lookup("/files").is_empty());
        let matches = tree.lookup("/files/a/b");
        assert_eq!(values(&matches), vec![3]);
        assert_eq!(matches[0].params, vec![("rest".into(), "a/b".into())]);
    }

    #[test]
    fn catch_all_must_be_last() {
        let mut tree = PathTree::new();
        assert_eq!(
            tree.insert_exact("/a/*rest/b", 1),
            Err(InsertError::CatchAllNotLast("rest".into()))
        );
    }

    #[test]
    fn param_name_conflict_is_rejected() {
        let mut tree = PathTree::new();
        tree.insert_exact("/u/:id", 1).unwrap();
        assert!(matches!(
            tree.insert_exact("/u/:name", 2),
            Err(InsertError::ParamNameConflict { .. })
        ));
    }

    #[test]
    fn root_patterns() {
        let mut tree = PathTree::new();
        tree.insert_exact("/", 1).unwrap();
        tree.insert_subtree("/", 2).unwrap();
        assert_eq!(values(&tree.lookup("/")), vec![1, 2]);
        assert_eq!(values(&tree.lookup("/anything")), vec![2]);
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let mut tree = PathTree::new();
        tree.insert_exact("/a", 1).unwrap();
        assert_eq!(values(&tree.lookup("/a/")), vec![1]);
    }
}
