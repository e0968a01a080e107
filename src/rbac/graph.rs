use std::collections::{HashMap, HashSet, VecDeque};

use sha2::{Digest, Sha256};

use crate::data::StringSet;

/// Prefix-typed vertex namespace inside the authorization graph. Token
/// vertices store a digest of the bearer token so raw credentials never
/// sit in graph keys.
#[derive(Clone, Copy, Debug)]
pub struct VertexKind {
    decorator: &'static str,
    quit_value: Option<&'static str>,
    hashed: bool,
}

pub const TOKEN: VertexKind = VertexKind {
    decorator: "token:",
    quit_value: None,
    hashed: true,
};
pub const ROLE: VertexKind = VertexKind {
    decorator: "role:",
    quit_value: None,
    hashed: false,
};
pub const ROLE_BINDING: VertexKind = VertexKind {
    decorator: "roleBinding:",
    quit_value: None,
    hashed: false,
};
pub const CLUSTER_ROLE: VertexKind = VertexKind {
    decorator: "clusterRole:",
    quit_value: None,
    hashed: false,
};
pub const CLUSTER_ROLE_BINDING: VertexKind = VertexKind {
    decorator: "clusterRoleBinding:",
    quit_value: None,
    hashed: false,
};
/// The `*` namespace vertex is the owns-all sentinel; reaching it ends a
/// search early.
pub const NAMESPACE: VertexKind = VertexKind {
    decorator: "namespace:",
    quit_value: Some("*"),
    hashed: false,
};

impl VertexKind {
    pub fn wrap(&self, value: &str) -> String {
        if self.hashed {
            format!("{}{:x}", self.decorator, Sha256::digest(value.as_bytes()))
        } else {
            format!("{}{}", self.decorator, value)
        }
    }

    pub fn is(&self, key: &str) -> bool {
        key.starts_with(self.decorator)
    }

    pub fn unwrap<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.decorator).unwrap_or(key)
    }

    fn quits(&self, key: &str) -> bool {
        self.quit_value
            .map(|quit| self.unwrap(key) == quit)
            .unwrap_or(false)
    }
}

/// Outcome of a graph search: the namespaces reached, or the early-exit
/// flag when the owns-all sentinel was visited.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchResult {
    pub values: StringSet,
    pub quit_early: bool,
}

/// Directed graph over string-keyed vertices. Acyclic by construction:
/// edges only ever point from tokens towards namespaces, so searches
/// terminate with nothing more than a visited set.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    vertexes: HashMap<String, HashSet<String>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vertex(&mut self, key: String) {
        self.vertexes.entry(key).or_default();
    }

    /// Removes a vertex along with every edge pointing at it.
    pub fn del_vertex(&mut self, key: &str) {
        if self.vertexes.remove(key).is_none() {
            return;
        }
        for adjacency in self.vertexes.values_mut() {
            adjacency.remove(key);
        }
    }

    pub fn add_edge(&mut self, from: String, to: String) {
        self.add_vertex(to.clone());
        self.vertexes.entry(from).or_default().insert(to);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vertexes.contains_key(key)
    }

    /// Breadth-first search from `start`, collecting the unwrapped values
    /// of every `result_kind` vertex reached. Visiting that kind's quit
    /// sentinel short-circuits the traversal.
    pub fn search(&self, start: &str, result_kind: &VertexKind) -> SearchResult {
        let mut result = SearchResult::default();
        if !self.vertexes.contains_key(start) {
            return result;
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut visit_list: VecDeque<&str> = VecDeque::new();
        visit_list.push_back(start);

        while let Some(key) = visit_list.pop_front() {
            if !visited.insert(key) {
                continue;
            }

            if result_kind.is(key) {
                if result_kind.quits(key) {
                    result.quit_early = true;
                    break;
                }
                result.values.insert(result_kind.unwrap(key));
            }

            if let Some(adjacency) = self.vertexes.get(key) {
                for next in adjacency {
                    visit_list.push_back(next);
                }
            }
        }

        result
    }
}
