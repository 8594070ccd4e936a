//! Equality- and set-based label selectors (`app=web,tier!=db,env in (a,b),!canary`).

use std::collections::BTreeMap;

use crate::error::ResourceError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, vs) => labels.get(k).is_some_and(|l| vs.contains(l)),
            Requirement::NotIn(k, vs) => labels.get(k).map_or(true, |l| !vs.contains(l)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn parse(raw: &str) -> Result<Self, ResourceError> {
        let invalid = |message: &str| ResourceError::InvalidSelector {
            selector: raw.to_string(),
            message: message.to_string(),
        };

        let mut requirements = Vec::new();
        for term in split_terms(raw) {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let req = if let Some(key) = term.strip_prefix('!') {
                Requirement::DoesNotExist(valid_key(key.trim()).ok_or_else(|| invalid("empty key"))?)
            } else if let Some((key, rest)) = split_set_op(term, " notin ") {
                Requirement::NotIn(
                    valid_key(key).ok_or_else(|| invalid("empty key"))?,
                    parse_set(rest).ok_or_else(|| invalid("malformed value set"))?,
                )
            } else if let Some((key, rest)) = split_set_op(term, " in ") {
                Requirement::In(
                    valid_key(key).ok_or_else(|| invalid("empty key"))?,
                    parse_set(rest).ok_or_else(|| invalid("malformed value set"))?,
                )
            } else if let Some((key, value)) = term.split_once("!=") {
                Requirement::NotEquals(
                    valid_key(key).ok_or_else(|| invalid("empty key"))?,
                    value.trim().to_string(),
                )
            } else if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
                Requirement::Equals(
                    valid_key(key).ok_or_else(|| invalid("empty key"))?,
                    value.trim().to_string(),
                )
            } else {
                Requirement::Exists(valid_key(term).ok_or_else(|| invalid("empty key"))?)
            };
            requirements.push(req);
        }
        Ok(Self { requirements })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// Match against a resource object's `metadata.labels`.
    pub fn matches_object(&self, object: &serde_json::Value) -> bool {
        let labels: BTreeMap<String, String> = object
            .pointer("/metadata/labels")
            .and_then(|l| l.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        self.matches(&labels)
    }
}

/// Split on commas that are not inside a `( ... )` value set.
fn split_terms(raw: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, ch) in raw.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&raw[start..]);
    terms
}

fn split_set_op<'a>(term: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    term.split_once(op).filter(|(_, rest)| rest.trim_start().starts_with('('))
}

fn parse_set(raw: &str) -> Option<Vec<String>> {
    let inner = raw.trim().strip_prefix('(')?.strip_suffix(')')?;
    Some(
        inner
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect(),
    )
}

fn valid_key(key: &str) -> Option<String> {
    let key = key.trim();
    (!key.is_empty()).then(|| key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn equality_terms() {
        let sel = LabelSelector::parse("app=web, tier!=db").unwrap();
        assert!(sel.matches(&labels(&[("app", "web"), ("tier", "front")])));
        assert!(!sel.matches(&labels(&[("app", "web"), ("tier", "db")])));
        assert!(!sel.matches(&labels(&[("app", "api")])));
    }

    #[test]
    fn set_terms_and_existence() {
        let sel = LabelSelector::parse("env in (prod, staging),canary,!legacy").unwrap();
        assert!(sel.matches(&labels(&[("env", "prod"), ("canary", "true")])));
        assert!(!sel.matches(&labels(&[("env", "dev"), ("canary", "true")])));
        assert!(!sel.matches(&labels(&[("env", "prod"), ("canary", "1"), ("legacy", "y")])));

        let notin = LabelSelector::parse("env notin (dev)").unwrap();
        assert!(notin.matches(&labels(&[])));
        assert!(!notin.matches(&labels(&[("env", "dev")])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        assert!(LabelSelector::parse("").unwrap().matches(&labels(&[])));
    }

    #[test]
    fn malformed_set_is_rejected() {
        assert!(LabelSelector::parse("env in (a, b").is_err());
        assert!(LabelSelector::parse("=web").is_err());
    }

    #[test]
    fn matches_object_labels() {
        let pod = serde_json::json!({"metadata": {"name": "p", "labels": {"app": "web"}}});
        assert!(LabelSelector::parse("app=web").unwrap().matches_object(&pod));
        assert!(!LabelSelector::parse("app=api").unwrap().matches_object(&pod));
    }
}
