//! URI templates such as `file:///{path}`, matched by compiling each `{name}` into a
//! regex capture group.

use regex::Regex;
use std::collections::HashMap;

use crate::error::{Error, ErrorCode, Result};

/// A URI template such as `file:///{path}` compiled into an anchored regex.
///
/// Each `{name}` placeholder matches one non-empty path segment (`[^/]+`); everything
/// else must match literally.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    template: String,
    regex: Regex,
    names: Vec<String>,
}

impl UriTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let mut pattern = String::from("^");
        let mut names = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}').map(|i| open + i) else {
                break;
            };
            let name = &rest[open + 1..close];
            if name.is_empty() {
                return Err(Error::protocol(
                    ErrorCode::InvalidParams,
                    format!("empty placeholder in uri template {}", template),
                ));
            }
            pattern.push_str(&regex::escape(&rest[..open]));
            pattern.push_str("([^/]+)");
            names.push(name.to_string());
            rest = &rest[close + 1..];
        }
        pattern.push_str(&regex::escape(rest));
        pattern.push('$');

        let regex = Regex::new(&pattern).map_err(|e| {
            Error::protocol(
                ErrorCode::InvalidParams,
                format!("invalid uri template {}: {}", template, e),
            )
        })?;
        Ok(Self {
            template: template.to_string(),
            regex,
            names,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Placeholder names in order of appearance
    pub fn variables(&self) -> &[String] {
        &self.names
    }

    /// Placeholder values when `uri` matches the template
    pub fn matches(&self, uri: &str) -> Option<HashMap<String, String>> {
        let captures = self.regex.captures(uri)?;
        let values = self
            .names
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                captures
                    .get(i + 1)
                    .map(|m| (name.clone(), m.as_str().to_string()))
            })
            .collect();
        Some(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_each_placeholder() {
        let t = UriTemplate::parse("repo://{owner}/{name}/readme").unwrap();
        let values = t.matches("repo://acme/widgets/readme").unwrap();
        assert_eq!(values["owner"], "acme");
        assert_eq!(values["name"], "widgets");
        assert_eq!(t.variables(), ["owner", "name"]);
    }

    #[test]
    fn placeholders_do_not_cross_segments() {
        let t = UriTemplate::parse("file:///{path}").unwrap();
        assert!(t.matches("file:///notes.txt").is_some());
        assert!(t.matches("file:///dir/notes.txt").is_none());
        assert!(t.matches("file:///").is_none());
    }

    #[test]
    fn literal_parts_are_escaped() {
        let t = UriTemplate::parse("test://a.b/{id}").unwrap();
        assert!(t.matches("test://a.b/1").is_some());
        assert!(t.matches("test://axb/1").is_none());
        assert!(t.matches("prefix-test://a.b/1").is_none());
    }

    #[test]
    fn empty_placeholder_is_rejected() {
        assert!(UriTemplate::parse("test://{}").is_err());
    }
}
