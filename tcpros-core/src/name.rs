//!
//! Graph resource name resolution.
//!
//! The transport treats name resolution as a pure function from the name a
//! user typed to a fully qualified graph resource name.  Anything that
//! implements [`NameResolver`] can be plugged into a node, including plain
//! closures.
//!

use std::collections::HashMap;

/// Resolve a user supplied name into a fully qualified graph resource name
pub trait NameResolver: Send + Sync {
    /// Resolve `name` into its fully qualified form
    fn resolve(&self, name: &str) -> String;
}

impl<F: Fn(&str) -> String + Send + Sync> NameResolver for F {
    fn resolve(&self, name: &str) -> String {
        self(name)
    }
}

/// A resolver for a node living in a namespace with optional remappings.
///
/// Relative names are joined onto the namespace, private (`~`) names onto
/// the node name, and remappings are applied to the resolved result.
#[derive(Clone, Debug)]
pub struct Namespace {
    namespace: String,
    node_name: String,
    remappings: HashMap<String, String>,
}

impl Namespace {
    /// Create a new resolver for the node `node_name` inside `namespace`
    pub fn new(namespace: &str, node_name: &str) -> Self {
        let namespace = canonicalize(&format!("/{namespace}"));
        let node_name = if node_name.starts_with('/') {
            canonicalize(node_name)
        } else {
            join(&namespace, node_name)
        };

        Self {
            namespace,
            node_name,
            remappings: HashMap::new(),
        }
    }

    /// Remap the resolved name `from` onto the resolved name `to`
    pub fn with_remapping(mut self, from: &str, to: &str) -> Self {
        let from = self.resolve_unmapped(from);
        let to = self.resolve_unmapped(to);
        self.remappings.insert(from, to);
        self
    }

    /// The fully qualified name of the node this resolver belongs to
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The namespace this resolver resolves relative names into
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn resolve_unmapped(&self, name: &str) -> String {
        if name.is_empty() {
            self.namespace.clone()
        } else if name.starts_with('/') {
            canonicalize(name)
        } else if let Some(private) = name.strip_prefix('~') {
            join(&self.node_name, private)
        } else {
            join(&self.namespace, name)
        }
    }
}

impl NameResolver for Namespace {
    fn resolve(&self, name: &str) -> String {
        let resolved = self.resolve_unmapped(name);
        self.remappings.get(&resolved).cloned().unwrap_or(resolved)
    }
}

fn join(base: &str, name: &str) -> String {
    canonicalize(&format!("{base}/{name}"))
}

/// Collapse repeated separators and strip the trailing one.
fn canonicalize(name: &str) -> String {
    let parts: Vec<&str> = name.split('/').filter(|part| !part.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_global_relative_and_private_names() {
        let resolver = Namespace::new("/robot", "talker");
        assert_eq!(resolver.node_name(), "/robot/talker");
        assert_eq!(resolver.resolve("/chatter"), "/chatter");
        assert_eq!(resolver.resolve("chatter"), "/robot/chatter");
        assert_eq!(resolver.resolve("~status"), "/robot/talker/status");
        assert_eq!(resolver.resolve("a//b/"), "/robot/a/b");
        assert_eq!(resolver.resolve(""), "/robot");
    }

    #[test]
    fn test_remapping_applies_to_resolved_name() {
        let resolver = Namespace::new("/", "listener").with_remapping("chatter", "/talk");
        assert_eq!(resolver.resolve("chatter"), "/talk");
        assert_eq!(resolver.resolve("/chatter"), "/talk");
        assert_eq!(resolver.resolve("other"), "/other");
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |name: &str| format!("/prefix/{name}");
        assert_eq!(NameResolver::resolve(&resolver, "x"), "/prefix/x");
    }
}
