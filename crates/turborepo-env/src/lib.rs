#![deny(clippy::all)]

//! Environment variable maps and the wildcard allowlist resolution used by
//! the fingerprint builder and task execution.

use std::{
    collections::HashMap,
    env,
    ops::{Deref, DerefMut},
};

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("Failed to parse regex: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct EnvironmentVariableMap(HashMap<String, String>);

// A list of "k=v" strings for env variables and their values
pub type EnvironmentVariablePairs = Vec<String>;

// WildcardMaps is a pair of EnvironmentVariableMaps.
#[derive(Debug)]
pub struct WildcardMaps {
    pub inclusions: EnvironmentVariableMap,
    pub exclusions: EnvironmentVariableMap,
}

impl WildcardMaps {
    // Resolve collapses a WildcardSet into a single EnvironmentVariableMap.
    fn resolve(self) -> EnvironmentVariableMap {
        let mut output = self.inclusions;
        output.difference(&self.exclusions);
        output
    }
}

// BySource contains a map of environment variables broken down by the source
#[derive(Debug, Serialize)]
pub struct BySource {
    pub explicit: EnvironmentVariableMap,
    pub matching: EnvironmentVariableMap,
}

// DetailedMap contains the composite and the detailed maps of environment
// variables. `all` is the fingerprint input; `by_source` feeds dry runs and
// run summaries.
#[derive(Debug, Serialize)]
pub struct DetailedMap {
    pub all: EnvironmentVariableMap,
    pub by_source: BySource,
}

impl From<HashMap<String, String>> for EnvironmentVariableMap {
    fn from(map: HashMap<String, String>) -> Self {
        EnvironmentVariableMap(map)
    }
}

impl Deref for EnvironmentVariableMap {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EnvironmentVariableMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl EnvironmentVariableMap {
    pub fn infer() -> Self {
        EnvironmentVariableMap(env::vars().collect())
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }

    /// A sorted list of "k=v" pairs, the form fed into hashing.
    pub fn to_hashable(&self) -> EnvironmentVariablePairs {
        let mut pairs: Vec<_> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        pairs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.keys().cloned().collect();
        names.sort();
        names
    }

    // Takes another EnvironmentVariableMap and adds it into `self`.
    // Overwrites values if they already exist.
    pub fn union(&mut self, another: &EnvironmentVariableMap) {
        for (key, value) in &another.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    // Takes another EnvironmentVariableMap and removes matching keys from
    // `self`.
    pub fn difference(&mut self, another: &EnvironmentVariableMap) {
        for key in another.0.keys() {
            self.0.remove(key);
        }
    }

    fn wildcard_map_from_wildcards(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<WildcardMaps, Error> {
        let mut output = WildcardMaps {
            inclusions: EnvironmentVariableMap::default(),
            exclusions: EnvironmentVariableMap::default(),
        };

        let mut include_patterns = Vec::new();
        let mut exclude_patterns = Vec::new();

        for wildcard_pattern in wildcard_patterns {
            let wildcard_pattern = wildcard_pattern.as_ref();
            if let Some(rest) = wildcard_pattern.strip_prefix('!') {
                exclude_patterns.push(wildcard_to_regex_pattern(rest));
            } else if wildcard_pattern.starts_with("\\!") {
                include_patterns.push(wildcard_to_regex_pattern(&wildcard_pattern[1..]));
            } else {
                include_patterns.push(wildcard_to_regex_pattern(wildcard_pattern));
            }
        }

        let include_regex = Regex::new(&format!("^({})$", include_patterns.join("|")))?;
        let exclude_regex = Regex::new(&format!("^({})$", exclude_patterns.join("|")))?;
        for (env_var, env_value) in &self.0 {
            if !include_patterns.is_empty() && include_regex.is_match(env_var) {
                output.inclusions.insert(env_var.clone(), env_value.clone());
            }
            if !exclude_patterns.is_empty() && exclude_regex.is_match(env_var) {
                output.exclusions.insert(env_var.clone(), env_value.clone());
            }
        }

        Ok(output)
    }

    // Returns an EnvironmentVariableMap containing the variables in the
    // environment which match an array of wildcard patterns.
    pub fn from_wildcards(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<EnvironmentVariableMap, Error> {
        if wildcard_patterns.is_empty() {
            return Ok(EnvironmentVariableMap::default());
        }

        let resolved_set = self.wildcard_map_from_wildcards(wildcard_patterns)?;
        Ok(resolved_set.resolve())
    }

    // Returns a wildcard set specifying the inclusions and exclusions
    // discovered from a set of wildcard patterns. This is used to ensure
    // that user exclusions have primacy over inferred inclusions.
    pub fn wildcard_map_from_wildcards_unresolved(
        &self,
        wildcard_patterns: &[String],
    ) -> Result<WildcardMaps, Error> {
        if wildcard_patterns.is_empty() {
            return Ok(WildcardMaps {
                inclusions: EnvironmentVariableMap::default(),
                exclusions: EnvironmentVariableMap::default(),
            });
        }

        self.wildcard_map_from_wildcards(wildcard_patterns)
    }
}

const WILDCARD: char = '*';
const WILDCARD_ESCAPE: char = '\\';
const REGEX_WILDCARD_SEGMENT: &str = ".*";

fn wildcard_to_regex_pattern(pattern: &str) -> String {
    let mut regex_string = Vec::new();
    let mut previous_index = 0;
    let mut previous_char: Option<char> = None;

    for (i, char) in pattern.chars().enumerate() {
        if char == WILDCARD {
            if previous_char == Some(WILDCARD_ESCAPE) {
                // Found a literal *
                // Replace the trailing "\*" with just "*" before adding the
                // segment.
                regex_string.push(regex::escape(&format!(
                    "{}*",
                    &pattern[previous_index..(i - 1)]
                )));
            } else {
                // Found a wildcard
                // Add in the static segment since the last wildcard. Can be
                // zero length.
                regex_string.push(regex::escape(&pattern[previous_index..i]));

                // Add a dynamic segment if it isn't adjacent to another
                // dynamic segment.
                if let Some(last_segment) = regex_string.last() {
                    if last_segment != REGEX_WILDCARD_SEGMENT {
                        regex_string.push(REGEX_WILDCARD_SEGMENT.to_string());
                    }
                }
            }

            previous_index = i + 1;
        }
        previous_char = Some(char);
    }

    // Add the last static segment. Can be zero length.
    regex_string.push(regex::escape(&pattern[previous_index..]));

    regex_string.join("")
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("LITERAL_\\*", "LITERAL_\\*" ; "literal star")]
    #[test_case("\\*LEADING", "\\*LEADING" ; "leading literal star")]
    #[test_case("!LEADING", "!LEADING" ; "leading bang")]
    #[test_case("*LEADING", ".*LEADING" ; "leading star")]
    fn test_wildcard_to_regex_pattern(pattern: &str, expected: &str) {
        let actual = super::wildcard_to_regex_pattern(pattern);
        assert_eq!(actual, expected);
    }

    fn map(pairs: &[(&str, &str)]) -> EnvironmentVariableMap {
        EnvironmentVariableMap(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_from_wildcards() {
        let env = map(&[
            ("TURBO_TOKEN", "secret"),
            ("TURBO_TEAM", "team"),
            ("HOME", "/home/user"),
        ]);

        let matched = env.from_wildcards(&["TURBO_*"]).unwrap();
        assert_eq!(matched.names(), vec!["TURBO_TEAM", "TURBO_TOKEN"]);

        let excluded = env.from_wildcards(&["TURBO_*", "!TURBO_TOKEN"]).unwrap();
        assert_eq!(excluded.names(), vec!["TURBO_TEAM"]);
    }

    #[test]
    fn test_to_hashable_is_sorted() {
        let env = map(&[("B", "2"), ("A", "1")]);
        assert_eq!(env.to_hashable(), vec!["A=1", "B=2"]);
    }

    #[test]
    fn test_union_and_difference() {
        let mut env = map(&[("A", "1")]);
        env.union(&map(&[("B", "2"), ("A", "override")]));
        assert_eq!(env.get("A").map(String::as_str), Some("override"));
        assert_eq!(env.len(), 2);

        env.difference(&map(&[("A", "whatever")]));
        assert_eq!(env.names(), vec!["B"]);
    }
}
