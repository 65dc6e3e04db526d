//! Manifest documents: parsing, rendering and image reference rewriting.

use serde::Deserialize;
use serde_json::Value;

/// Whether a source file holds manifests.
pub fn is_manifest_path(path: &str) -> bool {
    path.ends_with(".yaml") || path.ends_with(".yml")
}

/// Parse a multi-document YAML file into JSON values.
///
/// Empty documents (a bare `---`) are skipped.
///
/// # Errors
///
/// Returns the parser message for the first malformed document.
pub fn parse_documents(text: &str) -> Result<Vec<Value>, String> {
    serde_yaml::Deserializer::from_str(text)
        .map(|document| Value::deserialize(document).map_err(|e| e.to_string()))
        .filter(|parsed| !matches!(parsed, Ok(Value::Null)))
        .collect()
}

/// Split an image reference into its repository and the tag or digest suffix.
///
/// A `:` only counts as a tag separator after the last `/`, so registry
/// ports survive: `host:5000/web:v1` has repository `host:5000/web`.
pub fn image_repository(reference: &str) -> &str {
    if let Some((repository, _digest)) = reference.split_once('@') {
        return repository;
    }
    let name_start = reference.rfind('/').map_or(0, |i| i.saturating_add(1));
    reference
        .get(name_start..)
        .and_then(|name| name.rfind(':'))
        .and_then(|tag_at| reference.get(..name_start.saturating_add(tag_at)))
        .unwrap_or(reference)
}

/// Rewrite every `image` field referencing `repository` to `new_reference`.
///
/// Returns how many fields changed. Fields already at `new_reference` are
/// left untouched and not counted.
pub fn rewrite_images(document: &mut Value, repository: &str, new_reference: &str) -> usize {
    match document {
        Value::Object(map) => map
            .iter_mut()
            .map(|(field, value)| match value {
                Value::String(current)
                    if field == "image"
                        && image_repository(current) == repository
                        && current != new_reference =>
                {
                    *current = new_reference.to_string();
                    1
                }
                other => rewrite_images(other, repository, new_reference),
            })
            .sum(),
        Value::Array(items) => items
            .iter_mut()
            .map(|item| rewrite_images(item, repository, new_reference))
            .sum(),
        _ => 0,
    }
}

/// Rewrite `image` scalars referencing `repository` in manifest text.
///
/// Only the scalar itself is replaced; comments, key order, quoting and
/// every other line stay as written. Handles block mappings and sequence
/// items (`image: ref`, `- image: "ref"`); flow mappings are left alone.
///
/// Returns the new text and how many references changed.
pub fn rewrite_image_lines(text: &str, repository: &str, new_reference: &str) -> (String, usize) {
    let mut rewritten = 0usize;
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        match rewrite_image_line(line, repository, new_reference) {
            Some(replaced) => {
                out.push_str(&replaced);
                rewritten = rewritten.saturating_add(1);
            }
            None => out.push_str(line),
        }
    }
    (out, rewritten)
}

fn rewrite_image_line(line: &str, repository: &str, new_reference: &str) -> Option<String> {
    let mut body = line.trim_start();
    if let Some(item) = body.strip_prefix('-') {
        body = item.strip_prefix(' ')?.trim_start();
    }
    let after_key = ["image:", "\"image\":", "'image':"]
        .iter()
        .find_map(|key| body.strip_prefix(key))?;
    let value = after_key.trim_start();
    let (current, token_len, quote) = scalar_token(value)?;
    if image_repository(current) != repository || current == new_reference {
        return None;
    }

    let value_at = line.len().checked_sub(value.len())?;
    let (head, rest) = line.split_at(value_at);
    let tail = rest.get(token_len..)?;
    Some(format!("{head}{quote}{new_reference}{quote}{tail}"))
}

/// The scalar at the start of `value`: its content, its length in the text
/// and the quote character around it (empty when plain).
fn scalar_token(value: &str) -> Option<(&str, usize, &'static str)> {
    for quote in ["\"", "'"] {
        if let Some(quoted) = value.strip_prefix(quote) {
            let end = quoted.find(quote)?;
            let content = quoted.get(..end)?;
            return Some((content, end.saturating_add(2), quote));
        }
    }
    let end = value
        .find(" #")
        .or_else(|| value.find(['\r', '\n']))
        .unwrap_or(value.len());
    let content = value.get(..end)?.trim_end();
    if content.is_empty() || content.starts_with(['{', '[', '&', '*', '|', '>']) {
        return None;
    }
    Some((content, content.len(), ""))
}
