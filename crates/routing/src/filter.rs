//! Event filters in the subscriptions API dialect.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// One filter expression. Every dialect set on the same filter must match;
/// a filter with no dialect matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exact: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prefix: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub suffix: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<Filter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cesql: Option<String>,
}

impl Filter {
    pub fn exact(attribute: &str, value: &str) -> Self {
        Self { exact: BTreeMap::from([(attribute.to_string(), value.to_string())]), ..Default::default() }
    }

    pub fn prefix(attribute: &str, value: &str) -> Self {
        Self { prefix: BTreeMap::from([(attribute.to_string(), value.to_string())]), ..Default::default() }
    }

    pub fn suffix(attribute: &str, value: &str) -> Self {
        Self { suffix: BTreeMap::from([(attribute.to_string(), value.to_string())]), ..Default::default() }
    }

    pub fn all(filters: Vec<Filter>) -> Self { Self { all: filters, ..Default::default() } }

    pub fn any(filters: Vec<Filter>) -> Self { Self { any: filters, ..Default::default() } }

    pub fn negate(filter: Filter) -> Self { Self { not: Some(Box::new(filter)), ..Default::default() } }

    /// Evaluate against event context attributes.
    ///
    /// CESQL expressions are evaluated by the broker only and report an error here.
    pub fn matches(&self, attributes: &BTreeMap<String, String>) -> Result<bool> {
        if let Some(q) = self.cesql.as_deref() {
            return Err(anyhow!("cesql filter {:?} is evaluated by the broker only", q));
        }
        let attr = |k: &String| attributes.get(k).map(String::as_str);
        if !self.exact.iter().all(|(k, v)| attr(k) == Some(v.as_str())) { return Ok(false); }
        if !self.prefix.iter().all(|(k, v)| attr(k).map(|a| a.starts_with(v.as_str())).unwrap_or(false)) { return Ok(false); }
        if !self.suffix.iter().all(|(k, v)| attr(k).map(|a| a.ends_with(v.as_str())).unwrap_or(false)) { return Ok(false); }
        for f in self.all.iter() {
            if !f.matches(attributes)? { return Ok(false); }
        }
        if !self.any.is_empty() {
            let mut hit = false;
            for f in self.any.iter() {
                if f.matches(attributes)? { hit = true; break; }
            }
            if !hit { return Ok(false); }
        }
        if let Some(n) = self.not.as_deref() {
            if n.matches(attributes)? { return Ok(false); }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn dialects_evaluate() {
        let ev = attrs(&[("type", "io.lmesh.ping"), ("source", "demo/ping")]);
        assert!(Filter::exact("type", "io.lmesh.ping").matches(&ev).unwrap());
        assert!(!Filter::exact("type", "io.lmesh").matches(&ev).unwrap());
        assert!(!Filter::exact("subject", "x").matches(&ev).unwrap());
        assert!(Filter::prefix("type", "io.lmesh.").matches(&ev).unwrap());
        assert!(Filter::suffix("source", "/ping").matches(&ev).unwrap());
        assert!(Filter::all(vec![Filter::prefix("type", "io."), Filter::suffix("source", "ping")]).matches(&ev).unwrap());
        assert!(!Filter::all(vec![Filter::prefix("type", "io."), Filter::suffix("source", "pong")]).matches(&ev).unwrap());
        assert!(Filter::any(vec![Filter::exact("type", "a"), Filter::exact("type", "io.lmesh.ping")]).matches(&ev).unwrap());
        assert!(!Filter::any(vec![Filter::exact("type", "a")]).matches(&ev).unwrap());
        assert!(Filter::negate(Filter::exact("type", "a")).matches(&ev).unwrap());
        assert!(Filter::default().matches(&ev).unwrap());
    }

    #[test]
    fn cesql_is_unsupported_locally() {
        let f = Filter { cesql: Some("type = 'x'".into()), ..Default::default() };
        assert!(f.matches(&BTreeMap::new()).is_err());
        assert!(Filter::any(vec![f]).matches(&BTreeMap::new()).is_err());
    }

    #[test]
    fn yaml_layout_is_single_key_per_dialect() {
        let f = Filter::any(vec![Filter::exact("type", "a"), Filter::negate(Filter::prefix("source", "x"))]);
        let y = serde_yaml::to_string(&f).unwrap();
        assert!(y.starts_with("any:"), "{}", y);
        assert!(!y.contains("cesql"), "{}", y);
        let back: Filter = serde_yaml::from_str(&y).unwrap();
        assert_eq!(back, f);
    }
}
