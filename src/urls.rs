//! Entity-name pluralization and REST resource URL generation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Maps an entity name to its plural collection name.
///
/// Explicit overrides win; everything else gets an `s` appended.
#[derive(Debug, Clone, Default)]
pub struct Pluralizer {
    overrides: HashMap<String, String>,
}

impl Pluralizer {
    /// A pluralizer with no overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register plural-name overrides, e.g. `("Person", "People")`.
    ///
    /// Later registrations for the same name replace earlier ones.
    pub fn with_overrides<K, V>(mut self, overrides: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (name, plural) in overrides {
            self.overrides.insert(name.into(), plural.into());
        }
        self
    }

    /// The plural form of `name`.
    pub fn pluralize(&self, name: &str) -> String {
        match self.overrides.get(name) {
            Some(plural) => plural.clone(),
            None if name.is_empty() => String::new(),
            None => format!("{name}s"),
        }
    }
}

/// Resource URLs for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityHttpResourceUrls {
    /// Base URL for single-entity requests, ending in `/`.
    pub entity_resource_url: String,
    /// Base URL for collection requests, ending in `/`.
    pub collection_resource_url: String,
}

/// Builds the REST URLs a data service uses for an entity type.
///
/// URLs follow `{root}/{entity}/` and `{root}/{plural}/`, with both names
/// lower-cased. Generated URLs are cached per entity name; explicit URLs
/// registered with [`register_urls`](HttpUrlGenerator::register_urls) take
/// precedence.
#[derive(Debug, Clone, Default)]
pub struct HttpUrlGenerator {
    pluralizer: Pluralizer,
    known: Arc<RwLock<HashMap<String, EntityHttpResourceUrls>>>,
}

impl HttpUrlGenerator {
    /// A generator using `pluralizer` for collection names.
    pub fn new(pluralizer: Pluralizer) -> Self {
        Self {
            pluralizer,
            known: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register explicit URLs for an entity type.
    pub fn register_urls(&self, entity_name: impl Into<String>, urls: EntityHttpResourceUrls) {
        if let Ok(mut known) = self.known.write() {
            known.insert(entity_name.into(), urls);
        }
    }

    /// URL for single-entity requests, e.g. `api/hero/`.
    pub fn entity_resource(&self, entity_name: &str, root: &str) -> String {
        self.resource_urls(entity_name, root).entity_resource_url
    }

    /// URL for collection requests, e.g. `api/heros/`.
    pub fn collection_resource(&self, entity_name: &str, root: &str) -> String {
        self.resource_urls(entity_name, root).collection_resource_url
    }

    /// Both resource URLs for `entity_name` under `root`.
    pub fn resource_urls(&self, entity_name: &str, root: &str) -> EntityHttpResourceUrls {
        if let Ok(known) = self.known.read()
            && let Some(urls) = known.get(entity_name)
        {
            return urls.clone();
        }
        let root = normalize_root(root);
        let urls = EntityHttpResourceUrls {
            entity_resource_url: format!("{root}/{}/", entity_name.to_lowercase()),
            collection_resource_url: format!(
                "{root}/{}/",
                self.pluralizer.pluralize(entity_name).to_lowercase()
            ),
        };
        if let Ok(mut known) = self.known.write() {
            known.insert(entity_name.to_owned(), urls.clone());
        }
        urls
    }
}

fn normalize_root(root: &str) -> &str {
    root.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rule_appends_s() {
        let p = Pluralizer::new();
        assert_eq!(p.pluralize("Hero"), "Heros");
        assert_eq!(p.pluralize(""), "");
    }

    #[test]
    fn overrides_win() {
        let p = Pluralizer::new().with_overrides([("Hero", "Heroes"), ("Person", "People")]);
        assert_eq!(p.pluralize("Hero"), "Heroes");
        assert_eq!(p.pluralize("Villain"), "Villains");
    }

    #[test]
    fn urls_are_lowercased_under_root() {
        let g = HttpUrlGenerator::new(Pluralizer::new().with_overrides([("Hero", "Heroes")]));
        assert_eq!(g.entity_resource("Hero", "api/"), "api/hero/");
        assert_eq!(g.collection_resource("Hero", "api"), "api/heroes/");
    }

    #[test]
    fn registered_urls_take_precedence() {
        let g = HttpUrlGenerator::default();
        g.register_urls(
            "Hero",
            EntityHttpResourceUrls {
                entity_resource_url: "x/one/".into(),
                collection_resource_url: "x/all/".into(),
            },
        );
        assert_eq!(g.entity_resource("Hero", "api"), "x/one/");
        assert_eq!(g.collection_resource("Hero", "api"), "x/all/");
    }
}
