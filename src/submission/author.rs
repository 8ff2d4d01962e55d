//! Author extraction from RO-Crate metadata.
//!
//! The metadata document is viewed as a graph of tagged nodes. Selection is an
//! ordered list of [`SelectionRule`]s: the first rule that matches any node
//! wins, and each rule can be tested on its own.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::submission::manifest::AuthorInfo;

/// One node of the metadata graph
#[derive(Debug)]
pub struct GraphNode<'a> {
    pub id: Option<&'a str>,
    /// Lowercased `@type` values
    pub types: BTreeSet<String>,
    /// Lowercased types and role names
    pub tags: BTreeSet<String>,
    pub fields: &'a Map<String, Value>,
}

fn strings_of(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.to_lowercase()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_lowercase)
            .collect(),
        _ => Vec::new(),
    }
}

impl<'a> GraphNode<'a> {
    fn new(fields: &'a Map<String, Value>) -> Self {
        let types: BTreeSet<String> = strings_of(fields.get("@type")).into_iter().collect();
        let mut tags = types.clone();
        for key in ["roleName", "role", "tags"] {
            tags.extend(strings_of(fields.get(key)));
        }
        Self {
            id: fields.get("@id").and_then(Value::as_str),
            types,
            tags,
            fields,
        }
    }

    fn str_field(&self, key: &str) -> Option<&'a str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Tagged view over a JSON-LD document
#[derive(Debug)]
pub struct TaggedGraph<'a> {
    nodes: Vec<GraphNode<'a>>,
}

impl<'a> TaggedGraph<'a> {
    /// Accepts `{"@graph": [...]}`, a bare array of nodes, or a single node
    pub fn from_document(document: &'a Value) -> Self {
        let items: Vec<&'a Value> = match document {
            Value::Object(obj) => match obj.get("@graph").and_then(Value::as_array) {
                Some(graph) => graph.iter().collect(),
                None => vec![document],
            },
            Value::Array(items) => items.iter().collect(),
            _ => Vec::new(),
        };

        Self {
            nodes: items
                .into_iter()
                .filter_map(Value::as_object)
                .map(GraphNode::new)
                .collect(),
        }
    }

    pub fn nodes(&self) -> &[GraphNode<'a>] {
        &self.nodes
    }

    pub fn by_id(&self, id: &str) -> Option<&GraphNode<'a>> {
        self.nodes.iter().find(|n| n.id == Some(id))
    }

    /// Follow a `{"@id": ...}` reference to its graph node; inline objects resolve to themselves
    pub fn resolve(&self, value: &'a Value) -> Option<&'a Map<String, Value>> {
        let value = match value {
            Value::Array(items) => items.first()?,
            other => other,
        };
        let obj = value.as_object()?;
        let is_reference = obj.len() == 1 && obj.contains_key("@id");
        if is_reference {
            if let Some(node) = obj.get("@id").and_then(Value::as_str).and_then(|id| self.by_id(id)) {
                return Some(node.fields);
            }
        }
        Some(obj)
    }
}

/// A rule selecting a candidate node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionRule {
    /// Node carries every listed tag
    AllTags(&'static [&'static str]),
    /// Node carries the tag
    AnyTag(&'static str),
    /// Node has the `@type`
    OfType(&'static str),
}

impl SelectionRule {
    pub fn matches(&self, node: &GraphNode<'_>) -> bool {
        match self {
            SelectionRule::AllTags(tags) => tags.iter().all(|t| node.tags.contains(&t.to_lowercase())),
            SelectionRule::AnyTag(tag) => node.tags.contains(&tag.to_lowercase()),
            SelectionRule::OfType(ty) => node.types.contains(&ty.to_lowercase()),
        }
    }
}

/// Author selection, highest priority first
pub const AUTHOR_RULES: [SelectionRule; 3] = [
    SelectionRule::AllTags(&["author", "main_author"]),
    SelectionRule::AnyTag("author"),
    SelectionRule::OfType("Person"),
];

/// First node matched by the first rule that matches anything
pub fn select_node<'g, 'a>(graph: &'g TaggedGraph<'a>, rules: &[SelectionRule]) -> Option<&'g GraphNode<'a>> {
    rules
        .iter()
        .find_map(|rule| graph.nodes().iter().find(|node| rule.matches(node)))
}

fn identifiers<'a>(fields: &'a Map<String, Value>) -> Vec<&'a str> {
    let mut ids = Vec::new();
    for key in ["@id", "identifier", "url"] {
        match fields.get(key) {
            Some(Value::String(s)) => ids.push(s.as_str()),
            Some(Value::Object(obj)) => {
                ids.extend(["@id", "value"].iter().filter_map(|k| obj.get(*k).and_then(Value::as_str)))
            }
            Some(Value::Array(items)) => ids.extend(items.iter().filter_map(Value::as_str)),
            _ => {}
        }
    }
    ids
}

fn non_empty(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| fields.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn normalize_author<'a>(node: &GraphNode<'a>, graph: &TaggedGraph<'a>) -> AuthorInfo {
    let display_name = match node.str_field("name") {
        Some(name) => name.to_string(),
        None => [node.str_field("givenName"), node.str_field("familyName")]
            .iter()
            .flatten()
            .copied()
            .collect::<Vec<_>>()
            .join(" "),
    };

    let orcid = identifiers(node.fields)
        .into_iter()
        .find(|id| id.contains("orcid.org"))
        .map(str::to_string)
        .unwrap_or_default();

    let affiliation = node.fields.get("affiliation");
    let (affiliation_name, affiliation_fields) = match affiliation {
        Some(Value::String(name)) => (name.trim().to_string(), None),
        Some(value) => {
            let fields = graph.resolve(value);
            (fields.and_then(|f| non_empty(f, &["name"])).unwrap_or_default(), fields)
        }
        None => (String::new(), None),
    };

    let explicit_ror = non_empty(node.fields, &["affiliation_ror", "ror"])
        .or_else(|| affiliation_fields.and_then(|f| non_empty(f, &["ror"])));
    let affiliation_ror = explicit_ror
        .or_else(|| {
            affiliation_fields.and_then(|f| {
                identifiers(f)
                    .into_iter()
                    .find(|id| id.contains("ror.org"))
                    .map(str::to_string)
            })
        })
        .unwrap_or_default();

    AuthorInfo {
        display_name,
        orcid,
        affiliation_name,
        affiliation_ror,
        handle: non_empty(node.fields, &["alternateName", "handle"]).unwrap_or_default(),
    }
}

/// Extract the author record; unresolvable fields stay empty
pub fn extract_author(document: &Value) -> AuthorInfo {
    let graph = TaggedGraph::from_document(document);
    select_node(&graph, &AUTHOR_RULES)
        .map(|node| normalize_author(node, &graph))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn crate_with(nodes: Value) -> Value {
        json!({ "@context": "https://w3id.org/ro/crate/1.1/context", "@graph": nodes })
    }

    #[test]
    fn test_main_author_wins() {
        let doc = crate_with(json!([
            {"@id": "#bob", "@type": ["Person", "author"], "name": "Bob"},
            {"@id": "#carol", "@type": "Person", "name": "Carol"},
            {"@id": "#alice", "@type": ["Person", "author", "main_author"], "name": "Alice"}
        ]));
        assert_eq!(extract_author(&doc).display_name, "Alice");
    }

    #[test]
    fn test_author_tag_beats_plain_person() {
        let doc = crate_with(json!([
            {"@id": "#carol", "@type": "Person", "name": "Carol"},
            {"@id": "#bob", "@type": "Person", "roleName": "Author", "name": "Bob"}
        ]));
        assert_eq!(extract_author(&doc).display_name, "Bob");
    }

    #[test]
    fn test_first_person_fallback_and_name_concat() {
        let doc = crate_with(json!([
            {"@id": "./", "@type": "Dataset"},
            {"@id": "#p1", "@type": "Person", "givenName": "Ada", "familyName": "Lovelace"},
            {"@id": "#p2", "@type": "Person", "name": "Second"}
        ]));
        assert_eq!(extract_author(&doc).display_name, "Ada Lovelace");
    }

    #[test]
    fn test_empty_when_no_candidate() {
        let doc = crate_with(json!([{"@id": "./", "@type": "Dataset"}]));
        assert_eq!(extract_author(&doc), AuthorInfo::default());
        assert_eq!(extract_author(&json!("not a graph")), AuthorInfo::default());
    }

    #[test]
    fn test_orcid_only_from_orcid_identifiers() {
        let with_orcid = crate_with(json!([
            {"@id": "https://orcid.org/0000-0002-1825-0097", "@type": ["Person", "author"], "name": "Josiah"}
        ]));
        assert_eq!(
            extract_author(&with_orcid).orcid,
            "https://orcid.org/0000-0002-1825-0097"
        );

        let without = crate_with(json!([
            {"@id": "#someone", "@type": ["Person", "author"], "name": "Josiah"}
        ]));
        assert_eq!(extract_author(&without).orcid, "");
    }

    #[test]
    fn test_affiliation_reference_resolved() {
        let doc = crate_with(json!([
            {
                "@id": "#alice",
                "@type": ["Person", "author"],
                "name": "Alice",
                "alternateName": "alice",
                "affiliation": {"@id": "https://ror.org/02kkvpp62"}
            },
            {"@id": "https://ror.org/02kkvpp62", "@type": "Organization", "name": "Technical University of Munich"}
        ]));
        let author = extract_author(&doc);
        assert_eq!(author.affiliation_name, "Technical University of Munich");
        assert_eq!(author.affiliation_ror, "https://ror.org/02kkvpp62");
        assert_eq!(author.handle, "alice");
    }

    #[test]
    fn test_explicit_ror_takes_precedence() {
        let doc = crate_with(json!([
            {
                "@id": "#alice",
                "@type": ["Person", "author"],
                "name": "Alice",
                "affiliation_ror": "https://ror.org/explicit",
                "affiliation": {"@id": "https://ror.org/derived", "name": "Lab"}
            }
        ]));
        let author = extract_author(&doc);
        assert_eq!(author.affiliation_ror, "https://ror.org/explicit");
        assert_eq!(author.affiliation_name, "Lab");
    }

    #[test]
    fn test_rules_are_independent() {
        let doc = json!({"@type": ["Person", "author"], "name": "Solo"});
        let graph = TaggedGraph::from_document(&doc);
        let node = &graph.nodes()[0];
        assert!(!AUTHOR_RULES[0].matches(node));
        assert!(AUTHOR_RULES[1].matches(node));
        assert!(AUTHOR_RULES[2].matches(node));
    }
}
