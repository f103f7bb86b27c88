//! Permit name templates.
//!
//! A permit name may carry `{placeholder}` segments filled from the work
//! item's parameters, e.g. `scope:{scope_id}` gives one permit per scope.
//! `{{` and `}}` are literal braces.

use super::errors::{RateLimitError, RateLimitResult};
use crate::models::JobMetadata;

/// Fill every placeholder in `template` from `params`.
///
/// A placeholder whose parameter is absent or `null` fails immediately with
/// [`RateLimitError::Configuration`]; it is never rendered as `"null"` and
/// never waited on.
pub fn resolve_permit_name(template: &str, params: &JobMetadata) -> RateLimitResult<String> {
    let mut resolved = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                resolved.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                resolved.push('}');
            }
            '{' => {
                let mut placeholder = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    placeholder.push(inner);
                }

                let placeholder = placeholder.trim().to_string();
                if !closed || placeholder.is_empty() {
                    return Err(RateLimitError::InvalidPermit {
                        name: template.to_string(),
                        reason: "unbalanced or empty placeholder".to_string(),
                    });
                }

                match params.param(&placeholder) {
                    Some(value) => resolved.push_str(&value),
                    None => {
                        return Err(RateLimitError::Configuration {
                            template: template.to_string(),
                            placeholder,
                        })
                    }
                }
            }
            '}' => {
                return Err(RateLimitError::InvalidPermit {
                    name: template.to_string(),
                    reason: "unbalanced '}'".to_string(),
                })
            }
            other => resolved.push(other),
        }
    }

    Ok(resolved)
}

/// Placeholder names referenced by a template, in order of appearance
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        if let Some(stripped) = after.strip_prefix('{') {
            rest = stripped;
            continue;
        }
        match after.find('}') {
            Some(end) => {
                names.push(after[..end].trim().to_string());
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    names
}
