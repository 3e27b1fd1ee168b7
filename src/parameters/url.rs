//! URL query-string helpers: merged parameter serialization and the
//! `hide_filter` list.

use reqwest::Url;
use std::collections::{BTreeMap, HashMap};

use super::Parameter;

/// Query key that hides a parameter from rendering.
pub const HIDE_FILTER_KEY: &str = "hide_filter";

/// Merge the URL parameters of every parameter into one mapping.
///
/// Empty parameters map to `None` so the caller can drop the key.
pub fn merge_url_params<'a, I>(parameters: I) -> BTreeMap<String, Option<String>>
where
    I: IntoIterator<Item = &'a Parameter>,
{
    parameters
        .into_iter()
        .flat_map(|p| p.to_url_params())
        .collect()
}

/// Decode the pairs of a raw query string (with or without leading `?`).
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    let mut url = match Url::parse("http://localhost/") {
        Ok(url) => url,
        Err(_) => return Vec::new(),
    };
    url.set_query(Some(query.trim_start_matches('?')));
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Last value per key of a raw query string.
pub fn query_map(query: &str) -> HashMap<String, String> {
    parse_query(query).into_iter().collect()
}

/// Names listed in `hide_filter` query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HideList {
    keys: Vec<String>,
}

impl HideList {
    /// Build from explicit names
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keys: names.into_iter().map(|n| comparison_key(n.as_ref())).collect(),
        }
    }

    /// Collect every `hide_filter` value of a raw query string
    pub fn from_query(query: &str) -> Self {
        Self::new(
            parse_query(query)
                .into_iter()
                .filter(|(k, _)| k == HIDE_FILTER_KEY)
                .map(|(_, v)| v),
        )
    }

    /// Collect every `hide_filter` value of a URL
    pub fn from_url(url: &Url) -> Self {
        Self::new(
            url.query_pairs()
                .filter(|(k, _)| k == HIDE_FILTER_KEY)
                .map(|(_, v)| v.into_owned()),
        )
    }

    /// Whether a parameter called `name` is hidden
    pub fn hides(&self, name: &str) -> bool {
        let key = comparison_key(name);
        self.keys.iter().any(|k| *k == key)
    }

    /// Whether no names are listed
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Comparison form of a name: all whitespace removed, lower-cased.
pub fn comparison_key(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}
