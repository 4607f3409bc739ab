//! # Blocking-Site Resolver
//!
//! Turns a captured stack into the label of the frame that actually blocked:
//! the innermost frame whose `owner::method` matches none of the deny
//! patterns. Runtime internals, lock implementations and this crate's own
//! delivery path sit above the interesting frame, so they are all denied.
//!
//! Deny matching dominates the cost, so identifiers that matched once are
//! memoized and skipped without symbolization afterwards.

use log::trace;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::capture::StackCapture;
use crate::domain::{BlockingSite, ConfigError, MethodId};

/// Ordered, full-match deny patterns; first match wins
#[derive(Debug, Clone)]
pub struct DenyList {
    patterns: Vec<Regex>,
}

impl DenyList {
    /// Compile each pattern anchored at both ends
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidPattern`] for the first pattern that is
    /// not a valid regex
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref();
                Regex::new(&format!("^(?:{p})$")).map_err(|source| ConfigError::InvalidPattern {
                    pattern: p.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Index of the first pattern matching `label`
    pub fn first_match(&self, label: &str) -> Option<usize> {
        self.patterns.iter().position(|re| re.is_match(label))
    }

    pub fn is_denied(&self, label: &str) -> bool {
        self.first_match(label).is_some()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Consumer-side resolver with an identifier-keyed ignore memo
///
/// Owned by the single consumer thread, hence `&mut self` and no locking.
pub struct BlockingSiteResolver {
    capture: Arc<StackCapture>,
    deny: DenyList,
    ignored: HashSet<MethodId>,
}

impl BlockingSiteResolver {
    #[must_use]
    pub fn new(capture: Arc<StackCapture>, deny: DenyList) -> Self {
        Self { capture, deny, ignored: HashSet::new() }
    }

    /// Resolve the blocking site of a stack, innermost frame first
    ///
    /// `None` means "suppress": no frame resolved to a label outside the
    /// deny list (or the stack was empty).
    pub fn resolve(&mut self, frames: &[MethodId]) -> Option<BlockingSite> {
        for &id in frames {
            if self.ignored.contains(&id) {
                continue;
            }
            // Stale ids and an unavailable facade both mean "no stable label"
            let Ok(Some(site)) = self.capture.resolve_site(id) else {
                continue;
            };
            let label = site.label();
            if let Some(idx) = self.deny.first_match(&label) {
                trace!("Ignoring {label} (deny pattern #{idx})");
                self.ignored.insert(id);
                continue;
            }
            return Some(site);
        }
        None
    }

    /// Number of identifiers memoized as ignored
    pub fn ignored_count(&self) -> usize {
        self.ignored.len()
    }
}
