//! Parsing helpers for LLM responses (§6: "responses may contain code-fence
//! wrappers and strips them before parsing JSON").
//!
//! Providers routinely answer a request for structured data with a fenced
//! block: ` ```json\n{...}\n``` `, sometimes with leading prose the fence
//! itself delimits away. This module strips that wrapper before handing the
//! response to `serde_json`.

use serde::de::DeserializeOwned;

/// Strip a single leading/trailing triple-backtick fence, with an optional
/// language tag on the opening line, from `response`. Text with no fence is
/// returned trimmed and unchanged.
pub fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = body.strip_suffix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the fence's opening line (e.g. `json`).
    match body.split_once('\n') {
        Some((tag, rest)) if !tag.trim().is_empty() && !tag.contains(|c: char| c.is_whitespace() && c != '\n') => {
            rest.trim()
        }
        _ => body.trim(),
    }
}

/// Strip code fences from `response`, then parse it as JSON into `T`.
pub fn parse_json_response<T: DeserializeOwned>(response: &str) -> anyhow::Result<T> {
    let stripped = strip_code_fences(response);
    serde_json::from_str(stripped)
        .map_err(|err| anyhow::anyhow!("failed to parse llm response as json: {err}\nresponse: {stripped}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        name: String,
        count: u32,
    }

    #[test]
    fn strips_json_tagged_fence() {
        let response = "```json\n{\"name\": \"a\", \"count\": 1}\n```";
        assert_eq!(strip_code_fences(response), "{\"name\": \"a\", \"count\": 1}");
    }

    #[test]
    fn strips_untagged_fence() {
        let response = "```\n{\"name\": \"a\", \"count\": 1}\n```";
        assert_eq!(strip_code_fences(response), "{\"name\": \"a\", \"count\": 1}");
    }

    #[test]
    fn leaves_unfenced_text_untouched() {
        let response = "  {\"name\": \"a\", \"count\": 1}  ";
        assert_eq!(strip_code_fences(response), "{\"name\": \"a\", \"count\": 1}");
    }

    #[test]
    fn parses_fenced_json_into_struct() {
        let response = "```json\n{\"name\": \"widget\", \"count\": 3}\n```";
        let parsed: Payload = parse_json_response(response).unwrap();
        assert_eq!(parsed, Payload { name: "widget".to_string(), count: 3 });
    }

    #[test]
    fn reports_a_readable_error_on_malformed_json() {
        let response = "```json\nnot json\n```";
        let result: anyhow::Result<Payload> = parse_json_response(response);
        assert!(result.is_err());
    }
}
