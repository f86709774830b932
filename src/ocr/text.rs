/// Drops whitespace in front of `.,!?` and joins words split by a trailing hyphen.
pub(super) fn tidy_block_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = String::new();
    for ch in text.chars() {
        if ch.is_whitespace() {
            pending_space.push(ch);
            continue;
        }
        if !pending_space.is_empty() {
            if !matches!(ch, '.' | ',' | '!' | '?') {
                out.push_str(&pending_space);
            }
            pending_space.clear();
        }
        out.push(ch);
    }
    out.push_str(&pending_space);
    remove_hyphen_breaks(&out)
}

fn remove_hyphen_breaks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '-' && chars.peek().is_some_and(|next| next.is_whitespace()) {
            chars.next();
            continue;
        }
        out.push(ch);
    }
    out
}
