use std::cell::RefCell;
use std::hash::Hash;
use std::rc::Rc;

use hashbrown::HashMap;
use log::trace;

use crate::ll_interface::{ForwardingNodeId, Name};

/// Routing contract used to stamp the local routing name into signaling.
pub trait RoutingNames {
    fn name_for(&self, forwarding_node: ForwardingNodeId) -> Option<Name>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingScope {
    /// only this service knows the registration
    Local,
    /// also forwarded to the parent service
    Global,
}

/// Name to address registry with an optional parent for delegated lookups.
#[derive(Debug)]
pub struct NameMappingService<A> {
    name: Name,
    entries: HashMap<Name, Vec<A>>,
    parent: Option<Rc<RefCell<NameMappingService<A>>>>,
}

impl<A: Clone + PartialEq + Eq + Hash> NameMappingService<A> {
    pub fn new(name: impl Into<Name>) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
            parent: None,
        }
    }

    pub fn with_parent(name: impl Into<Name>, parent: Rc<RefCell<NameMappingService<A>>>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register(&mut self, name: &str, address: A, scope: NamingScope) {
        let addresses = self.entries.entry(name.to_string()).or_default();
        if !addresses.contains(&address) {
            addresses.push(address.clone());
        }
        trace!("{}: registered '{}'", self.name, name);

        if scope == NamingScope::Global {
            if let Some(parent) = &self.parent {
                parent.borrow_mut().register(name, address, scope);
            }
        }
    }

    /// Removes every name pointing to `address`.
    pub fn unregister_all(&mut self, address: &A) {
        self.entries.retain(|_, addresses| {
            addresses.retain(|a| a != address);
            !addresses.is_empty()
        });
        if let Some(parent) = &self.parent {
            parent.borrow_mut().unregister_all(address);
        }
    }

    /// Local addresses first; the parent is asked if there are none.
    pub fn addresses(&self, name: &str) -> Vec<A> {
        match self.entries.get(name) {
            Some(addresses) => addresses.clone(),
            None => match &self.parent {
                Some(parent) => parent.borrow().addresses(name),
                None => Vec::new(),
            },
        }
    }

    pub fn names_for(&self, address: &A) -> Vec<Name> {
        let mut names: Vec<Name> = self
            .entries
            .iter()
            .filter(|(_, addresses)| addresses.contains(address))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl RoutingNames for NameMappingService<ForwardingNodeId> {
    fn name_for(&self, forwarding_node: ForwardingNodeId) -> Option<Name> {
        self.names_for(&forwarding_node).into_iter().next()
    }
}
