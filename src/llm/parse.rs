use super::client::truncate_str;
use serde::de::DeserializeOwned;

/// Strip markdown code fences from a response
pub(crate) fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = if clean.ends_with("```") {
        clean.strip_suffix("```").unwrap_or(clean)
    } else {
        clean
    };
    clean.trim()
}

/// Extract a JSON fragment between matching delimiters
pub(crate) fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Parse the first JSON object in a model response into `T`.
///
/// Tolerates code fences and prose around the object.
pub fn parse_json_object<T: DeserializeOwned>(response: &str) -> anyhow::Result<T> {
    let clean = strip_markdown_fences(response);
    if let Ok(parsed) = serde_json::from_str::<T>(clean) {
        return Ok(parsed);
    }
    let fragment = extract_json_fragment(clean, '{', '}').ok_or_else(|| {
        anyhow::anyhow!(
            "Response contained no JSON object. Response preview: {}",
            truncate_str(clean, 200)
        )
    })?;
    serde_json::from_str::<T>(fragment).map_err(|e| {
        anyhow::anyhow!(
            "Response could not be parsed ({}). Response preview: {}",
            e,
            truncate_str(fragment, 200)
        )
    })
}
