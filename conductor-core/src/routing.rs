//! Static capability routing from intents to roles

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::work_item::Role;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub primary: Role,
    #[serde(default)]
    pub fallback: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDecision {
    pub intent: String,
    pub primary: Role,
    pub fallback: Option<Role>,
    pub confidence: f64,
}

/// Intent to `(primary, fallback)` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityTable {
    pub routes: BTreeMap<String, Route>,
    /// Used for intents not listed in `routes`
    pub default_route: Option<Route>,
    pub default_confidence: f64,
}

impl Default for CapabilityTable {
    fn default() -> Self {
        let route = |primary, fallback| Route {
            primary,
            fallback: Some(fallback),
        };
        let routes = BTreeMap::from([
            ("plan".to_string(), route(Role::Planner, Role::Coder)),
            ("implement".to_string(), route(Role::Coder, Role::Planner)),
            ("review".to_string(), route(Role::Reviewer, Role::Coder)),
            ("test".to_string(), route(Role::Tester, Role::Coder)),
            ("integrate".to_string(), route(Role::Integrator, Role::Coder)),
            ("document".to_string(), route(Role::Documenter, Role::Reviewer)),
            ("triage".to_string(), route(Role::Planner, Role::Integrator)),
        ]);
        Self {
            routes,
            default_route: None,
            default_confidence: 0.5,
        }
    }
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self {
            routes: BTreeMap::new(),
            default_route: None,
            default_confidence: 0.5,
        }
    }

    pub fn with_route<S: Into<String>>(
        mut self,
        intent: S,
        primary: Role,
        fallback: Option<Role>,
    ) -> Self {
        self.routes.insert(
            normalize_intent(&intent.into()),
            Route { primary, fallback },
        );
        self
    }

    pub fn with_default(mut self, primary: Role, fallback: Option<Role>, confidence: f64) -> Self {
        self.default_route = Some(Route { primary, fallback });
        self.default_confidence = confidence;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_confidence) {
            return Err(Error::configuration(
                "routing.default_confidence must be between 0 and 1",
            ));
        }
        for (intent, route) in &self.routes {
            if route.fallback == Some(route.primary) {
                return Err(Error::configuration(format!(
                    "Route '{}' uses {} as both primary and fallback",
                    intent, route.primary
                )));
            }
        }
        Ok(())
    }

    /// Look up an intent; exact matches have full confidence
    pub fn resolve(&self, intent: &str) -> Result<RouteDecision> {
        let key = normalize_intent(intent);
        if let Some(route) = self.routes.get(&key) {
            return Ok(RouteDecision {
                intent: key,
                primary: route.primary,
                fallback: route.fallback,
                confidence: 1.0,
            });
        }
        match &self.default_route {
            Some(route) => Ok(RouteDecision {
                intent: key,
                primary: route.primary,
                fallback: route.fallback,
                confidence: self.default_confidence,
            }),
            None => Err(Error::not_found("Route", key)),
        }
    }
}

fn normalize_intent(intent: &str) -> String {
    intent.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_exact_match() {
        let table = CapabilityTable::default();
        let decision = table.resolve(" Review ").unwrap();
        assert_eq!(decision.intent, "review");
        assert_eq!(decision.primary, Role::Reviewer);
        assert_eq!(decision.fallback, Some(Role::Coder));
        assert_eq!(decision.confidence, 1.0);
    }

    #[test]
    fn test_default_route() {
        let table = CapabilityTable::new()
            .with_route("deploy", Role::Integrator, None)
            .with_default(Role::Planner, Some(Role::Coder), 0.4);
        let decision = table.resolve("something-else").unwrap();
        assert_eq!(decision.primary, Role::Planner);
        assert_eq!(decision.confidence, 0.4);
    }

    #[test]
    fn test_unknown_intent_without_default() {
        let table = CapabilityTable::new();
        assert_matches!(table.resolve("dance"), Err(Error::NotFound { .. }));
    }

    #[test]
    fn test_validation() {
        assert!(CapabilityTable::default().validate().is_ok());
        let bad = CapabilityTable::new().with_route("x", Role::Coder, Some(Role::Coder));
        assert!(bad.validate().is_err());
        let bad_conf = CapabilityTable::new().with_default(Role::Coder, None, 1.5);
        assert!(bad_conf.validate().is_err());
    }
}
