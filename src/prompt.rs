//! Prompt construction for one generation exchange.

use crate::sanitize::sanitize;

/// Build the prompt for a (possibly batched) subtitle text. Both the text
/// and the speaker are sanitized before they reach any template placeholder.
///
/// Template placeholders: `{text}`, `{speaker}`, `{speaker_part}`
/// (`（話者: NAME）` or empty), `{lines_num}` (line count of the batch).
/// Without a template the prompt is `SPEAKER「TEXT」` or `「TEXT」`.
pub fn build_prompt(template: Option<&str>, text: &str, speaker: Option<&str>) -> String {
    let text = sanitize(text);
    let speaker = speaker
        .filter(|s| !s.is_empty())
        .map(sanitize);

    match template {
        Some(template) => {
            let speaker_part = speaker
                .as_deref()
                .map(|s| format!("（話者: {s}）"))
                .unwrap_or_default();
            let lines_num = if text.is_empty() {
                0
            } else {
                text.matches('\n').count() + 1
            };
            template
                .replace("{text}", &text)
                .replace("{speaker}", speaker.as_deref().unwrap_or(""))
                .replace("{speaker_part}", &speaker_part)
                .replace("{lines_num}", &lines_num.to_string())
        }
        None => match speaker {
            Some(speaker) => format!("{speaker}「{text}」"),
            None => format!("「{text}」"),
        },
    }
}
