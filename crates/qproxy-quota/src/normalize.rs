const THINKING_SUFFIX: &str = "-thinking";

/// Standardizes model identifiers for quota lookups.
///
/// Trims whitespace, drops one trailing thinking marker, strips any path
/// prefix through the last `/`, and lowercases. Total and idempotent;
/// `""` maps to `""` and the wildcard `*` passes through unchanged.
pub fn normalize_model_key(model: &str) -> String {
    let mut model = model.trim();
    if model.is_empty() {
        return String::new();
    }
    model = strip_thinking_suffix(model);
    if let Some(idx) = model.rfind('/') {
        model = &model[idx + 1..];
    }
    model.trim().to_ascii_lowercase()
}

fn strip_thinking_suffix(model: &str) -> &str {
    let Some(idx) = model.len().checked_sub(THINKING_SUFFIX.len()) else {
        return model;
    };
    if idx == 0 || !model.is_char_boundary(idx) {
        return model;
    }
    if model[idx..].eq_ignore_ascii_case(THINKING_SUFFIX) {
        &model[..idx]
    } else {
        model
    }
}

/// Removes a trailing 8-digit date segment (`claude-opus-4-5-20251101` ->
/// `claude-opus-4-5`). Returns the input unchanged when no such segment
/// exists.
pub fn strip_date_suffix(model: &str) -> &str {
    let Some((base, last)) = model.rsplit_once('-') else {
        return model;
    };
    if base.is_empty() || last.len() != 8 || !last.bytes().all(|b| b.is_ascii_digit()) {
        return model;
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        for model in [
            "claude-sonnet-4-5-thinking",
            "models/Gemini-3-Pro-High",
            "  gpt-oss-120b-medium ",
            "*",
            "",
        ] {
            let once = normalize_model_key(model);
            assert_eq!(normalize_model_key(&once), once, "model = {model:?}");
        }
    }

    #[test]
    fn normalize_strips_thinking_suffix() {
        assert_eq!(
            normalize_model_key("claude-sonnet-4-5-thinking"),
            normalize_model_key("claude-sonnet-4-5")
        );
        assert_eq!(normalize_model_key("X-THINKING"), "x");
        // A bare marker is a model name, not a suffix.
        assert_eq!(normalize_model_key("-thinking"), "-thinking");
    }

    #[test]
    fn normalize_strips_path_prefix_and_lowercases() {
        assert_eq!(normalize_model_key("ns/Foo"), "foo");
        assert_eq!(normalize_model_key("a/b/Gemini-3-Flash"), "gemini-3-flash");
    }

    #[test]
    fn strip_date_suffix_requires_eight_digits() {
        assert_eq!(strip_date_suffix("claude-opus-4-5-20251101"), "claude-opus-4-5");
        assert_eq!(strip_date_suffix("claude-opus-4-5"), "claude-opus-4-5");
        assert_eq!(strip_date_suffix("model-2025"), "model-2025");
        assert_eq!(strip_date_suffix("20251101"), "20251101");
    }
}
