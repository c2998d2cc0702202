//! Group-intersection access control.
//!
//! [`grant`] is the single rule behind every gate in the system: tool
//! gating and feature gating both call it, so they cannot diverge.

use std::collections::{BTreeMap, BTreeSet};

use crate::audit::{record_soft, AuditContext, AuditEvent, AuditEventKind, AuditSink};
use crate::domain::principal::Principal;

/// Access is granted when nothing is required or the sets share a group.
pub fn grant(principal_groups: &BTreeSet<String>, required_groups: &BTreeSet<String>) -> bool {
    required_groups.is_empty() || !principal_groups.is_disjoint(required_groups)
}

/// Named features and the groups allowed to see them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureGate {
    features: BTreeMap<String, BTreeSet<String>>,
}

impl FeatureGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feature<I, S>(mut self, feature: impl Into<String>, required_groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features
            .insert(feature.into(), required_groups.into_iter().map(Into::into).collect());
        self
    }

    /// Unknown features carry no requirement.
    pub fn required_groups(&self, feature: &str) -> BTreeSet<String> {
        self.features.get(feature).cloned().unwrap_or_default()
    }

    pub fn is_enabled(&self, feature: &str, principal: &Principal) -> bool {
        grant(&principal.groups, &self.required_groups(feature))
    }

    /// Same decision as [`FeatureGate::is_enabled`], recorded as a
    /// `FeatureCheck` audit event.
    pub async fn check(
        &self,
        feature: &str,
        principal: &Principal,
        audit: &dyn AuditSink,
        context: &AuditContext,
    ) -> bool {
        let required = self.required_groups(feature);
        let granted = grant(&principal.groups, &required);
        record_soft(
            audit,
            AuditEvent::new(
                context,
                AuditEventKind::FeatureCheck {
                    feature: feature.to_string(),
                    required_groups: required.into_iter().collect(),
                    access_granted: granted,
                },
            ),
        )
        .await;
        granted
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::{grant, FeatureGate};
    use crate::audit::{AuditContext, AuditEventKind, InMemoryAuditSink};
    use crate::domain::principal::Principal;

    fn set(groups: &[&str]) -> BTreeSet<String> {
        groups.iter().map(|group| group.to_string()).collect()
    }

    #[test]
    fn empty_requirement_grants_everyone() {
        assert!(grant(&set(&[]), &set(&[])));
        assert!(grant(&set(&["sales"]), &set(&[])));
    }

    #[test]
    fn disjoint_groups_are_denied() {
        assert!(!grant(&set(&["sales"]), &set(&["admin"])));
        assert!(!grant(&set(&[]), &set(&["admin"])));
    }

    #[test]
    fn any_shared_group_grants() {
        assert!(grant(&set(&["sales", "finance"]), &set(&["admin", "finance"])));
    }

    #[test]
    fn no_wildcards_or_hierarchy() {
        assert!(!grant(&set(&["*"]), &set(&["admin"])));
        assert!(!grant(&set(&["admin"]), &set(&["admin:read"])));
    }

    #[tokio::test]
    async fn feature_check_records_decision() {
        let gate = FeatureGate::new().with_feature("admin_menu", ["admin"]);
        let principal = Principal::new("u-1").with_groups(["sales"]);
        let sink = InMemoryAuditSink::default();
        let context = AuditContext::for_principal(&principal, "c-1", "r-1");

        let enabled = gate.check("admin_menu", &principal, &sink, &context).await;

        assert!(!enabled);
        let events = sink.events_of_type("feature_check");
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].kind,
            AuditEventKind::FeatureCheck { feature, access_granted: false, .. }
                if feature == "admin_menu"
        ));
    }

    #[test]
    fn unknown_features_are_enabled() {
        let gate = FeatureGate::new();
        assert!(gate.is_enabled("anything", &Principal::new("u-1")));
    }

    fn groups() -> impl Strategy<Value = BTreeSet<String>> {
        proptest::collection::btree_set("[a-e]", 0..5)
    }

    proptest! {
        #[test]
        fn grant_matches_intersection_rule(principal in groups(), required in groups()) {
            let expected =
                required.is_empty() || principal.intersection(&required).next().is_some();
            prop_assert_eq!(grant(&principal, &required), expected);
        }

        #[test]
        fn tool_and_feature_gating_agree(principal in groups(), required in groups()) {
            let gate = FeatureGate::new().with_feature("f", required.clone());
            let who = Principal { groups: principal.clone(), ..Principal::new("u") };
            prop_assert_eq!(gate.is_enabled("f", &who), grant(&principal, &required));
        }
    }
}
