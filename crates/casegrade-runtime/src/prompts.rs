//! Prompt rendering for case evaluation.
//!
//! The rubric document is itself the prompt template. It carries
//! `{summary}` and `{recommendation}` placeholders, and writes literal
//! braces (the JSON response template) as `{{` and `}}`.

/// System prompt sent ahead of every rendered rubric.
pub const SYSTEM_PROMPT: &str = r#"You are a clinical evaluation assistant scoring a medical case recommendation against a fixed rubric.

Score ONLY the criteria the rubric defines, using each criterion's id exactly as given.
Never exceed a criterion's maximum points and never assign negative scores.
Respond with a single JSON object in the format the rubric specifies and nothing else."#;

/// Phrases that mark a refusal or content-policy response.
pub const CONTENT_MODERATION_INDICATORS: &[&str] = &[
    "I'm sorry, but I can't assist",
    "I cannot assist",
    "I can't help",
    "content policy",
    "safety guidelines",
];

/// Substitute case fields into a rubric template.
///
/// Rendering is a single pass: substituted text is never re-scanned, so
/// braces inside a summary survive unchanged. Unknown placeholders are
/// left as written.
pub fn render_case_prompt(template: &str, summary: &str, recommendation: &str) -> String {
    let mut out = String::with_capacity(template.len() + summary.len() + recommendation.len());
    let mut rest = template;

    while let Some(idx) = rest.find(['{', '}']) {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];

        if let Some(after) = tail.strip_prefix("{{") {
            out.push('{');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("}}") {
            out.push('}');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{summary}") {
            out.push_str(summary);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{recommendation}") {
            out.push_str(recommendation);
            rest = after;
        } else {
            out.push_str(&tail[..1]);
            rest = &tail[1..];
        }
    }

    out.push_str(rest);
    out
}

/// Whether raw model text reads like a refusal. Case-insensitive.
pub fn detect_content_moderation(text: &str) -> bool {
    let lowered = text.to_lowercase();
    CONTENT_MODERATION_INDICATORS
        .iter()
        .any(|indicator| lowered.contains(&indicator.to_lowercase()))
}
