use std::borrow::Cow;

/// Strips control characters from remote-supplied text.
///
/// Feed titles, author names, and link text arrive from untrusted servers and
/// are persisted verbatim; embedded escape bytes would survive into every
/// downstream consumer (logs, UIs). Tab (0x09), newline (0x0A), and carriage
/// return (0x0D) are preserved.
///
/// Returns `Cow::Borrowed` when the input is already clean (the common case).
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_stripped) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.chars().filter(|&c| !is_stripped(c)).collect())
}

fn is_stripped(c: char) -> bool {
    c.is_control() && c != '\t' && c != '\n' && c != '\r'
}
