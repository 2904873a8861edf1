//! Label selectors evaluated against cached objects

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

/// A `LabelSelector` that can be matched locally
///
/// An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector(LabelSelector);

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector requiring every given label
    pub fn from_labels(labels: BTreeMap<String, String>) -> Self {
        Self(LabelSelector {
            match_labels: Some(labels),
            match_expressions: None,
        })
    }

    /// Selector requiring one label
    pub fn label(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::from_labels(BTreeMap::from([(key.into(), value.into())]))
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let labels_match = self
            .0
            .match_labels
            .iter()
            .flatten()
            .all(|(k, v)| labels.get(k) == Some(v));

        labels_match
            && self
                .0
                .match_expressions
                .iter()
                .flatten()
                .all(|req| requirement_matches(req, labels))
    }
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&req.key);
    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" => value.is_some_and(|v| values.contains(v)),
        "NotIn" => value.is_none_or(|v| !values.contains(v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        _ => false,
    }
}

impl From<LabelSelector> for Selector {
    fn from(selector: LabelSelector) -> Self {
        Self(selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: Some(values.iter().map(|v| v.to_string()).collect()),
        }
    }

    #[test]
    fn test_everything_matches() {
        assert!(Selector::everything().matches(&BTreeMap::new()));
        assert!(Selector::everything().matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn test_match_labels() {
        let selector = Selector::label("app", "web");
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "front")])));
        assert!(!selector.matches(&labels(&[("app", "db")])));
        assert!(!selector.matches(&BTreeMap::new()));
    }

    #[test]
    fn test_match_expressions() {
        let selector = Selector::from(LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                requirement("env", "In", &["prod", "staging"]),
                requirement("canary", "DoesNotExist", &[]),
                requirement("tier", "NotIn", &["db"]),
            ]),
        });
        assert!(selector.matches(&labels(&[("env", "prod")])));
        assert!(selector.matches(&labels(&[("env", "staging"), ("tier", "web")])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&labels(&[("env", "prod"), ("canary", "1")])));
        assert!(!selector.matches(&labels(&[("env", "prod"), ("tier", "db")])));
    }

    #[test]
    fn test_unknown_operator_never_matches() {
        let selector = Selector::from(LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![requirement("env", "Gt", &["1"])]),
        });
        assert!(!selector.matches(&labels(&[("env", "2")])));
    }
}
