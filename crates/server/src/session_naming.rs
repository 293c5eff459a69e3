const MAX_TITLE_CHARS: usize = 72;
const FALLBACK_TITLE: &str = "New session";

/// Title derived from a prompt: whitespace collapsed, truncated with `…`.
pub fn name_from_first_prompt(prompt: &str) -> Option<String> {
    let normalized = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return None;
    }

    let mut out: String = normalized.chars().take(MAX_TITLE_CHARS).collect();
    if normalized.chars().count() > MAX_TITLE_CHARS {
        out.push('…');
    }
    Some(out)
}

/// An explicit non-blank title wins; otherwise derive one from the prompt.
pub fn session_title(explicit: Option<&str>, prompt: &str) -> String {
    explicit
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .map(str::to_string)
        .or_else(|| name_from_first_prompt(prompt))
        .unwrap_or_else(|| FALLBACK_TITLE.to_string())
}
