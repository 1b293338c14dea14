//! Reserved-character sanitization for text sent to the interactive session.
//!
//! The external CLI treats certain leading characters as session
//! meta-commands (`/` slash command, `!` shell escape, `@` file reference,
//! and so on). Every string handed to the session bridge is mapped through
//! this table first so untrusted text can never trigger one.

/// Half-width reserved character and its full-width stand-in.
const RESERVED_CHAR_MAP: &[(char, char)] = &[
    ('/', '／'),
    ('!', '！'),
    ('.', '．'),
    ('@', '＠'),
    ('#', '＃'),
    ('$', '＄'),
    ('(', '（'),
    (')', '）'),
    ('`', '｀'),
    ('|', '｜'),
    ('&', '＆'),
    (';', '；'),
    ('\\', '＼'),
    ('~', '～'),
];

/// Replace every reserved character with its full-width counterpart.
/// All other characters pass through unchanged.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .map(|ch| replacement(ch).unwrap_or(ch))
        .collect()
}

fn replacement(ch: char) -> Option<char> {
    RESERVED_CHAR_MAP
        .iter()
        .find(|(half, _)| *half == ch)
        .map(|(_, full)| *full)
}
