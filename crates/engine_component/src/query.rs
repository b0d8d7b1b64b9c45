//! Component queries used by systems to select entities.
//!
//! A [`ComponentQuery`] declares which component types an entity must have,
//! may have, and must not have. The scheduler resolves a system's query
//! against storage before every execution.

use serde::{Deserialize, Serialize};

/// Describes the component requirements of a system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentQuery {
    /// Component types every matched entity must hold.
    pub required: Vec<String>,
    /// Component types a system can use when present.
    pub optional: Vec<String>,
    /// Component types that disqualify an entity.
    pub excluded: Vec<String>,
}

impl ComponentQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required component type.
    #[must_use]
    pub fn require(mut self, component: impl Into<String>) -> Self {
        self.required.push(component.into());
        self
    }

    /// Add an optional component type.
    #[must_use]
    pub fn optional(mut self, component: impl Into<String>) -> Self {
        self.optional.push(component.into());
        self
    }

    /// Add an excluded component type.
    #[must_use]
    pub fn exclude(mut self, component: impl Into<String>) -> Self {
        self.excluded.push(component.into());
        self
    }

    /// Returns `true` if the query selects nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.optional.is_empty()
    }

    /// Returns all component types the query reads (required + optional).
    #[must_use]
    pub fn accessed_types(&self) -> Vec<String> {
        let mut types = Vec::with_capacity(self.required.len() + self.optional.len());
        types.extend_from_slice(&self.required);
        types.extend_from_slice(&self.optional);
        types
    }

    /// Checks an entity's component set against the query.
    ///
    /// Optional components never affect matching.
    #[must_use]
    pub fn matches(&self, has: impl Fn(&str) -> bool) -> bool {
        self.required.iter().all(|c| has(c)) && !self.excluded.iter().any(|c| has(c))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_builder() {
        let q = ComponentQuery::new()
            .require("transform")
            .optional("velocity")
            .exclude("frozen");
        assert_eq!(q.required, vec!["transform"]);
        assert_eq!(q.accessed_types(), vec!["transform", "velocity"]);
        assert!(!q.is_empty());
    }

    #[test]
    fn test_matches_required_and_excluded() {
        let q = ComponentQuery::new().require("transform").exclude("frozen");

        let moving: HashSet<&str> = ["transform", "velocity"].into();
        let frozen: HashSet<&str> = ["transform", "frozen"].into();
        let bare: HashSet<&str> = ["velocity"].into();

        assert!(q.matches(|c| moving.contains(c)));
        assert!(!q.matches(|c| frozen.contains(c)));
        assert!(!q.matches(|c| bare.contains(c)));
    }
}
