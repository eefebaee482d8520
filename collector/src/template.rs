//! `{{name}}` placeholder substitution for request paths and commands.

use std::collections::BTreeMap;

/// Placeholders filled from the target and the bootstrap query.
pub const BUILTIN_PLACEHOLDERS: &[&str] = &["host", "port", "node", "component", "version"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    Unterminated,
    Unknown(String),
}

/// Returns the placeholder names in order of appearance.
pub fn placeholders(template: &str) -> Result<Vec<&str>, TemplateError> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(TemplateError::Unterminated)?;
        names.push(after[..end].trim());
        rest = &after[end + 2..];
    }
    Ok(names)
}

pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(TemplateError::Unterminated)?;
        let name = after[..end].trim();
        let value = vars.get(name).ok_or_else(|| TemplateError::Unknown(name.to_string()))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
