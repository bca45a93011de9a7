//! Virtual dispatch cache.
//!
//! Memoizes the method a `callvirt` resolved to, keyed by the call-site
//! token and the receiver's runtime type. The set of types is closed once a
//! program is loaded, so entries are never invalidated.

use std::collections::HashMap;

use crate::metadata::Token;

/// Polymorphism observed at one call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// No receiver type recorded yet
    Uninitialized,
    /// Single receiver type observed
    Monomorphic,
    /// 2-4 receiver types observed
    Polymorphic,
    /// More than 4 receiver types observed
    Megamorphic,
}

/// Upper bound on receiver types for a polymorphic site.
const POLYMORPHIC_LIMIT: usize = 4;

#[derive(Debug, Default)]
pub struct DispatchCache {
    entries: HashMap<(Token, Token), Token>,
    /// Distinct receiver types per call site.
    site_types: HashMap<Token, usize>,
    hits: u64,
    misses: u64,
}

impl DispatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the binding for a call site and receiver type.
    #[inline]
    pub fn lookup(&mut self, site: Token, runtime_type: Token) -> Option<Token> {
        let found = self.entries.get(&(site, runtime_type)).copied();
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    /// Record a resolved binding.
    pub fn insert(&mut self, site: Token, runtime_type: Token, method: Token) {
        if self.entries.insert((site, runtime_type), method).is_none() {
            *self.site_types.entry(site).or_insert(0) += 1;
        }
    }

    pub fn state(&self, site: Token) -> CacheState {
        match self.site_types.get(&site).copied().unwrap_or(0) {
            0 => CacheState::Uninitialized,
            1 => CacheState::Monomorphic,
            n if n <= POLYMORPHIC_LIMIT => CacheState::Polymorphic,
            _ => CacheState::Megamorphic,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}
