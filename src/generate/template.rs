//! `{{name}}` placeholder rendering.
//!
//! Rendering is strict: a placeholder with no value is an error, never an
//! empty string.

use std::collections::BTreeMap;

use crate::classes::{missing_classes, ClassSet};
use crate::error::{BuildError, BuildResult};

/// Placeholder values for one template.
pub type Values = BTreeMap<&'static str, String>;

pub fn render(artifact: &str, template: &str, values: &Values) -> BuildResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut missing = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(BuildError::TemplateResolution {
                artifact: artifact.to_string(),
                message: "unterminated '{{' placeholder".to_string(),
            });
        };
        let name = after[..end].trim();
        match values.get(name) {
            Some(value) => out.push_str(value),
            None => {
                if !missing.contains(&name) {
                    missing.push(name);
                }
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    if !missing.is_empty() {
        return Err(BuildError::TemplateResolution {
            artifact: artifact.to_string(),
            message: format!("no value for placeholder(s): {}", missing.join(", ")),
        });
    }
    Ok(out)
}

/// Fail unless every tag the artifact depends on was emitted by the resolver.
pub fn require_classes(artifact: &str, classes: &ClassSet, tags: &[&str]) -> BuildResult<()> {
    let missing = missing_classes(classes, tags);
    if missing.is_empty() {
        return Ok(());
    }
    Err(BuildError::TemplateResolution {
        artifact: artifact.to_string(),
        message: format!("references unresolved class(es): {}", missing.join(", ")),
    })
}
