//! Request → route matching over an immutable table.
pub mod tree;

use std::{collections::HashMap, panic::AssertUnwindSafe, rc::Rc};

use http::Request;
use monoio_http::common::body::HttpBody;
use tracing::warn;
pub use tree::InsertError;
use tree::PathTree;

use crate::{predicate::Predicate, routing::Route};

/// The tree-predicate pattern a route was indexed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    pub kind: PatternKind,
    pub pattern: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Exact,
    Subtree,
}

#[derive(Debug)]
pub struct RouteMatch {
    pub index: usize,
    pub params: HashMap<String, String>,
}

/// Immutable matching structure: a path trie over tree-predicate routes plus
/// a linear list of routes without tree predicates.
#[derive(Default)]
pub struct Matcher {
    tree: PathTree<usize>,
    free: Vec<usize>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, index: usize, pattern: Option<&PathPattern>) -> Result<(), InsertError> {
        match pattern {
            Some(PathPattern {
                kind: PatternKind::Exact,
                pattern,
            }) => self.tree.insert_exact(pattern, index),
            Some(PathPattern {
                kind: PatternKind::Subtree,
                pattern,
            }) => self.tree.insert_subtree(pattern, index),
            None => {
                self.free.push(index);
                Ok(())
            }
        }
    }

    /// Match a request against the table. Deterministic: candidates are
    /// filtered by their free predicates, then ranked by weight (desc),
    /// literal path prefix length (desc) and id (asc).
    pub fn lookup(&self, routes: &[Rc<Route>], req: &Request<HttpBody>) -> Option<RouteMatch> {
        let path = req.uri().path();
        let mut best: Option<(i32, usize, usize, Vec<(String, String)>)> = None;

        let mut consider = |index: usize, literal_len: usize, params: Vec<(String, String)>| {
            let route = &routes[index];
            if !route.free_predicates.iter().all(|p| eval(p.as_ref(), req)) {
                return;
            }
            let better = match &best {
                None => true,
                Some((w, l, i, _)) => {
                    let prev = (*w, *l);
                    let cur = (route.weight, literal_len);
                    cur > prev || (cur == prev && routes[index].id() < routes[*i].id())
                }
            };
            if better {
                best = Some((route.weight, literal_len, index, params));
            }
        };

        for m in self.tree.lookup(path) {
            consider(*m.value, m.literal_len, m.params);
        }
        for &index in &self.free {
            consider(index, 0, Vec::new());
        }

        best.map(|(_, _, index, params)| RouteMatch {
            index,
            params: params.into_iter().collect(),
        })
    }
}

fn eval(p: &dyn Predicate, req: &Request<HttpBody>) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| p.matches(req))) {
        Ok(matched) => matched,
        Err(_) => {
            warn!("predicate panicked during matching, treated as non-match");
            false
        }
    }
}
