//! URL rewrite templates.
//!
//! A template such as `/v2/{id}?kind={kind}` is expanded from path params.
//! Text outside braces is copied verbatim.

use super::Params;

/// Expand `template`. `None` when a placeholder is unknown, empty or
/// unterminated, or when the result is empty.
pub fn rewrite(template: &str, params: &Params) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}')?;
        let value = params.get(&after[..close]).filter(|v| !v.is_empty())?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}
