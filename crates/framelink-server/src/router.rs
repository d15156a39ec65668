//! Resource registration and path-pattern matching.
//!
//! Patterns are path templates with named segments (`/user/:id`). A pattern
//! is compiled once at registration into a matcher plus the ordered list of
//! its parameter names; matching later returns positional captures that are
//! zipped with the cached names to produce the `params` mapping.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde_json::{Map, Value};

use framelink_common::{FramelinkError, Result};

/// Per-registration options.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    /// Human-readable description of the verb, surfaced by `describe`
    pub description: Option<String>,
}

/// A registered pattern: its compiled matcher, cached parameter names and
/// the verbs handled under it.
pub struct RouteEntry {
    matcher: Regex,
    params: Vec<String>,
    methods: BTreeMap<String, Option<String>>,
}

impl RouteEntry {
    /// Ordered parameter names extracted from the pattern at registration.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Verbs registered under this pattern, with their descriptions.
    pub fn methods(&self) -> &BTreeMap<String, Option<String>> {
        &self.methods
    }
}

/// Instance-owned table of resource registrations.
///
/// Registrations are never removed during the server's lifetime; repeated
/// verb registrations for one pattern add the verb without duplicating the
/// pattern entry.
#[derive(Default)]
pub struct ResourceRouter {
    routes: BTreeMap<String, RouteEntry>,
}

impl ResourceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `method` under `pattern`, compiling the pattern on first
    /// sight. Idempotent on repeated verbs; the latest description wins.
    pub fn add(&mut self, pattern: &str, method: &str, opts: RouteOptions) -> Result<()> {
        if !self.routes.contains_key(pattern) {
            let (matcher, params) = compile(pattern)?;
            self.routes.insert(
                pattern.to_string(),
                RouteEntry {
                    matcher,
                    params,
                    methods: BTreeMap::new(),
                },
            );
        }
        if let Some(entry) = self.routes.get_mut(pattern) {
            entry.methods.insert(method.to_string(), opts.description);
        }
        Ok(())
    }

    /// The registration under `pattern`, if any.
    pub fn get(&self, pattern: &str) -> Option<&RouteEntry> {
        self.routes.get(pattern)
    }

    /// Positional captures of `resource` against the registered `pattern`,
    /// or `None` when either the pattern is unknown or does not match.
    pub fn matches(&self, pattern: &str, resource: &str) -> Option<Vec<String>> {
        let entry = self.routes.get(pattern)?;
        captures(&entry.matcher, resource)
    }

    /// The `params` mapping for `resource` under `pattern`: captures zipped
    /// with the cached parameter names. Unresolved capture/name pairs are
    /// silently dropped; an unknown or unmatched pattern yields an empty
    /// mapping.
    pub fn params_for(&self, pattern: &str, resource: &str) -> HashMap<String, String> {
        let Some(entry) = self.routes.get(pattern) else {
            return HashMap::new();
        };
        match captures(&entry.matcher, resource) {
            Some(values) => bind_params(&entry.params, &values),
            None => HashMap::new(),
        }
    }

    /// Description of every registration:
    /// `{ pattern: { "params": [names...], verb: { "description"? } } }`.
    pub fn describe(&self) -> Value {
        let mut description = Map::new();
        for (pattern, entry) in &self.routes {
            let mut route = Map::new();
            route.insert(
                "params".to_string(),
                Value::Array(entry.params.iter().cloned().map(Value::String).collect()),
            );
            for (method, doc) in &entry.methods {
                let mut verb = Map::new();
                if let Some(doc) = doc {
                    verb.insert("description".to_string(), Value::String(doc.clone()));
                }
                route.insert(method.clone(), Value::Object(verb));
            }
            description.insert(pattern.clone(), Value::Object(route));
        }
        Value::Object(description)
    }
}

/// Compiles a path template into a matcher and its ordered parameter names.
/// `:name` segments become single-segment captures; everything else matches
/// literally.
pub fn compile(pattern: &str) -> Result<(Regex, Vec<String>)> {
    let mut params = Vec::new();
    let mut source = String::from("^");
    for (index, segment) in pattern.split('/').enumerate() {
        if index > 0 {
            source.push('/');
        }
        match segment.strip_prefix(':') {
            Some(name) if !name.is_empty() => {
                params.push(name.to_string());
                source.push_str("([^/]+)");
            }
            _ => source.push_str(&regex::escape(segment)),
        }
    }
    source.push('$');
    let matcher =
        Regex::new(&source).map_err(|_| FramelinkError::Pattern(pattern.to_string()))?;
    Ok((matcher, params))
}

/// Zips parameter names with positional captures, dropping unresolved pairs.
pub fn bind_params(names: &[String], values: &[String]) -> HashMap<String, String> {
    names
        .iter()
        .zip(values.iter())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn captures(matcher: &Regex, resource: &str) -> Option<Vec<String>> {
    let found = matcher.captures(resource)?;
    Some(
        found
            .iter()
            .skip(1)
            .flatten()
            .map(|capture| capture.as_str().to_string())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_extracted_at_registration() {
        let mut router = ResourceRouter::new();
        router
            .add("/user/:id/post/:post", "get", RouteOptions::default())
            .unwrap();
        let entry = router.get("/user/:id/post/:post").unwrap();
        assert_eq!(entry.params(), ["id".to_string(), "post".to_string()]);
    }

    #[test]
    fn test_match_produces_named_captures() {
        let mut router = ResourceRouter::new();
        router.add("/user/:id", "get", RouteOptions::default()).unwrap();
        let params = router.params_for("/user/:id", "/user/42");
        assert_eq!(params.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_no_match_is_empty_not_error() {
        let mut router = ResourceRouter::new();
        router.add("/user/:id", "get", RouteOptions::default()).unwrap();
        assert!(router.matches("/user/:id", "/other/42").is_none());
        assert!(router.params_for("/user/:id", "/other/42").is_empty());
        assert!(router.params_for("/unknown/:x", "/user/42").is_empty());
    }

    #[test]
    fn test_literal_segments_match_exactly() {
        let mut router = ResourceRouter::new();
        router.add("/user/:id", "get", RouteOptions::default()).unwrap();
        assert!(router.matches("/user/:id", "/user/42/extra").is_none());
        assert!(router.matches("/user/:id", "/user").is_none());
    }

    #[test]
    fn test_repeated_verb_registration_is_idempotent() {
        let mut router = ResourceRouter::new();
        router.add("/user/:id", "get", RouteOptions::default()).unwrap();
        router.add("/user/:id", "get", RouteOptions::default()).unwrap();
        router.add("/user/:id", "post", RouteOptions::default()).unwrap();
        let entry = router.get("/user/:id").unwrap();
        assert_eq!(entry.methods().len(), 2);
    }

    #[test]
    fn test_describe_lists_params_and_verbs() {
        let mut router = ResourceRouter::new();
        router
            .add(
                "/user/:id",
                "get",
                RouteOptions {
                    description: Some("fetch a user".to_string()),
                },
            )
            .unwrap();
        router.add("/user/:id", "post", RouteOptions::default()).unwrap();
        let description = router.describe();
        let route = &description["/user/:id"];
        assert_eq!(route["params"], serde_json::json!(["id"]));
        assert_eq!(route["get"]["description"], "fetch a user");
        assert!(route["post"].is_object());
    }

    #[test]
    fn test_arity_mismatch_drops_silently() {
        let names = vec!["id".to_string()];
        let values = vec!["42".to_string(), "orphan".to_string()];
        let params = bind_params(&names, &values);
        assert_eq!(params.len(), 1);
        assert_eq!(params.get("id").map(String::as_str), Some("42"));
    }
}
