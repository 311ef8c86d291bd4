//! Client-supplied metadata for new images.
//!
//! Server-owned fields always win: anything the client sends under one of
//! [`RESERVED_IMAGE_FIELDS`] is dropped, and only allow-listed attributes
//! survive into the stored record.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

/// Fields the server assigns on every image record.
pub const RESERVED_IMAGE_FIELDS: [&str; 4] = ["groupId", "imageId", "timestamp", "imageUrl"];

pub const DEFAULT_IMAGE_ATTRIBUTES: [&str; 4] = ["title", "caption", "description", "tags"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributePolicy {
    allowed: BTreeSet<String>,
}

impl Default for AttributePolicy {
    fn default() -> Self {
        Self::allowing(DEFAULT_IMAGE_ATTRIBUTES)
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FilteredAttributes {
    pub kept: Map<String, Value>,
    pub dropped: Vec<String>,
}

impl AttributePolicy {
    /// Reserved names are never allowed, even when listed.
    pub fn allowing<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = names
            .into_iter()
            .map(|name| name.as_ref().trim().to_string())
            .filter(|name| !name.is_empty() && !is_reserved(name))
            .collect();
        Self { allowed }
    }

    /// Parses a comma separated list such as `title,caption`.
    pub fn from_list(list: &str) -> Self {
        Self::allowing(list.split(','))
    }

    pub fn allows(&self, name: &str) -> bool {
        self.allowed.contains(name)
    }

    pub fn allowed(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    pub fn filter(&self, body: Map<String, Value>) -> FilteredAttributes {
        let mut filtered = FilteredAttributes::default();
        for (name, value) in body {
            if self.allows(&name) {
                filtered.kept.insert(name, value);
            } else {
                filtered.dropped.push(name);
            }
        }
        filtered
    }
}

pub fn is_reserved(name: &str) -> bool {
    RESERVED_IMAGE_FIELDS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn keeps_allowed_and_drops_the_rest() {
        let policy = AttributePolicy::default();
        let filtered = policy.filter(object(json!({
            "title": "Sunset",
            "tags": ["beach"],
            "imageId": "attacker",
            "imageUrl": "http://evil",
            "nonsense": 1
        })));

        assert_eq!(filtered.kept.len(), 2);
        assert_eq!(filtered.kept["title"], "Sunset");
        assert_eq!(filtered.kept["tags"], json!(["beach"]));
        let mut dropped = filtered.dropped.clone();
        dropped.sort();
        assert_eq!(dropped, vec!["imageId", "imageUrl", "nonsense"]);
    }

    #[test]
    fn reserved_names_cannot_be_allowed() {
        let policy = AttributePolicy::from_list("title, groupId ,timestamp,,rating");
        assert_eq!(policy.allowed().collect::<Vec<_>>(), vec!["rating", "title"]);
        assert!(!policy.allows("groupId"));
    }
}
