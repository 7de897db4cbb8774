//! Program links.
//!
//! A link represents one live attachment of a loaded program to a hook.
//! The [`LinkMap`] owned by each program enforces hook uniqueness: inserting
//! a second link with the same id fails with
//! [`ProgramError::AlreadyAttached`]. Removal is idempotent, so teardown
//! code can detach unconditionally even after a partial setup failure.

use std::{
    collections::{hash_map::Entry, HashMap},
    ops::Deref,
};

use crate::programs::ProgramError;

/// A Link.
pub trait Link: std::fmt::Debug + 'static {
    /// Unique Id
    type Id: std::fmt::Debug + std::hash::Hash + Eq + PartialEq;

    /// Returns the link id
    fn id(&self) -> Self::Id;

    /// Detaches the Link
    fn detach(self) -> Result<(), ProgramError>;
}

/// An owned link that automatically detaches the inner link when dropped.
pub struct OwnedLink<T: Link> {
    inner: Option<T>,
}

impl<T: Link> OwnedLink<T> {
    pub(crate) fn new(inner: T) -> Self {
        Self { inner: Some(inner) }
    }

    /// Detaches the link explicitly instead of on drop.
    pub fn detach(mut self) -> Result<(), ProgramError> {
        match self.inner.take() {
            Some(link) => link.detach(),
            None => Ok(()),
        }
    }
}

impl<T: Link> Deref for OwnedLink<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref().unwrap()
    }
}

impl<T: Link> Drop for OwnedLink<T> {
    fn drop(&mut self) {
        if let Some(link) = self.inner.take() {
            link.detach().unwrap();
        }
    }
}

#[derive(Debug)]
pub(crate) struct LinkMap<T: Link> {
    links: HashMap<T::Id, T>,
}

impl<T: Link> LinkMap<T> {
    pub(crate) fn new() -> LinkMap<T> {
        LinkMap {
            links: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, link: T) -> Result<T::Id, ProgramError> {
        let id = link.id();

        match self.links.entry(link.id()) {
            Entry::Occupied(_) => return Err(ProgramError::AlreadyAttached),
            Entry::Vacant(e) => e.insert(link),
        };

        Ok(id)
    }

    pub(crate) fn get(&self, link_id: &T::Id) -> Option<&T> {
        self.links.get(link_id)
    }

    /// Detaches and removes the link, if it is still attached. Removing an
    /// id that was already removed is a no-op.
    pub(crate) fn remove(&mut self, link_id: T::Id) -> Result<(), ProgramError> {
        match self.links.remove(&link_id) {
            Some(link) => link.detach(),
            None => Ok(()),
        }
    }

    pub(crate) fn remove_all(&mut self) -> Result<(), ProgramError> {
        for (_, link) in self.links.drain() {
            link.detach()?;
        }
        Ok(())
    }

    pub(crate) fn forget(&mut self, link_id: T::Id) -> Result<T, ProgramError> {
        self.links.remove(&link_id).ok_or(ProgramError::NotAttached)
    }
}

impl<T: Link> Drop for LinkMap<T> {
    fn drop(&mut self) {
        let _ = self.remove_all();
    }
}

macro_rules! define_link_wrapper {
    (#[$doc1:meta] $wrapper:ident, #[$doc2:meta] $wrapper_id:ident, $base:ident, $base_id:ident) => {
        #[$doc2]
        #[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
        pub struct $wrapper_id($base_id);

        #[$doc1]
        #[derive(Debug)]
        pub struct $wrapper($base);

        impl crate::programs::Link for $wrapper {
            type Id = $wrapper_id;

            fn id(&self) -> Self::Id {
                $wrapper_id(self.0.id())
            }

            fn detach(self) -> Result<(), ProgramError> {
                self.0.detach()
            }
        }

        impl From<$base> for $wrapper {
            fn from(b: $base) -> $wrapper {
                $wrapper(b)
            }
        }
    };
}

pub(crate) use define_link_wrapper;
