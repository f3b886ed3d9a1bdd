//! Static capability inference.
//!
//! A lexical scan over handler source that proposes the capability set the
//! handler appears to need. Best effort by contract: computed property access
//! widens to a wildcard, and the result may be a conservative superset.
//! Enforcement always happens at runtime on every host call; this is a
//! convenience for panel authors, never a security mechanism.

use std::collections::BTreeSet;

use crate::capability::{CapabilityToken, ScopeMatch};

/// Scan handler source and propose the capability tokens it appears to use.
#[must_use]
pub fn infer_capabilities(source: &str) -> BTreeSet<CapabilityToken> {
    let mut tokens = BTreeSet::new();
    let mut i = 0;

    while let Some(offset) = source[i..].find('$') {
        let at = i + offset;
        let rest = &source[at..];
        i = at + 1;

        if let Some(tail) = rest.strip_prefix("$state") {
            let preceded_by_delete = source[..at].trim_end().ends_with("delete");
            match property_access(tail) {
                Access::Named(name, written) => {
                    tokens.insert(CapabilityToken::state_read(name));
                    if written || preceded_by_delete {
                        tokens.insert(CapabilityToken::state_write(name));
                    }
                }
                Access::Computed => {
                    tokens.insert(CapabilityToken::StateRead(ScopeMatch::Any));
                    tokens.insert(CapabilityToken::StateWrite(ScopeMatch::Any));
                }
                Access::None => {}
            }
        } else if let Some(tail) = rest.strip_prefix("$emit") {
            let tail = tail.trim_start();
            if let Some(call) = tail.strip_prefix('(') {
                match string_literal(call.trim_start()) {
                    Some(name) => {
                        tokens.insert(CapabilityToken::emit_event(name));
                    }
                    None => {
                        tokens.insert(CapabilityToken::EmitEvent(ScopeMatch::Any));
                    }
                }
            }
        } else if let Some(tail) = rest.strip_prefix("$view") {
            match property_access(tail) {
                Access::Named(target, _) => {
                    tokens.insert(CapabilityToken::update_view(target));
                }
                Access::Computed => {
                    tokens.insert(CapabilityToken::UpdateView(ScopeMatch::Any));
                }
                Access::None => {}
            }
        } else if let Some(tail) = rest.strip_prefix("$ext") {
            match property_access(tail) {
                Access::Named(name, _) => {
                    tokens.insert(CapabilityToken::extension(name));
                }
                Access::Computed => {
                    tokens.insert(CapabilityToken::Extension(ScopeMatch::Any));
                }
                Access::None => {}
            }
        }

    }

    tokens
}

enum Access<'a> {
    /// `.name`, with `written` set when an assignment operator follows.
    Named(&'a str, bool),
    /// `[expr]` — scope cannot be determined statically.
    Computed,
    None,
}

fn property_access(tail: &str) -> Access<'_> {
    let mut chars = tail.chars();
    match chars.next() {
        Some('.') => {
            let rest = chars.as_str();
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '$'))
                .unwrap_or(rest.len());
            if end == 0 {
                return Access::None;
            }
            let name = &rest[..end];
            Access::Named(name, assignment_follows(&rest[end..]))
        }
        Some('[') => Access::Computed,
        _ => Access::None,
    }
}

/// Detect `= v`, `+= v`, `++` and friends after a property access, without
/// mistaking `==`, `===` or `=>` for an assignment.
fn assignment_follows(rest: &str) -> bool {
    let rest = rest.trim_start();
    if let Some(after) = rest.strip_prefix('=') {
        return !after.starts_with('=') && !after.starts_with('>');
    }
    if rest.starts_with("++") || rest.starts_with("--") {
        return true;
    }
    const COMPOUND_OPS: [&str; 14] = [
        "**=", "+=", "-=", "*=", "/=", "%=", "&&=", "||=", "??=", "&=", "|=", "^=", "<<=", ">>=",
    ];
    COMPOUND_OPS.iter().any(|op| rest.starts_with(op))
}

fn string_literal(s: &str) -> Option<&str> {
    let quote = s.chars().next().filter(|c| matches!(c, '"' | '\'' | '`'))?;
    let body = &s[1..];
    let end = body.find(quote)?;
    let literal = &body[..end];
    // Escapes or interpolation make the name ambiguous; widen to a wildcard.
    if literal.contains('\\') || (quote == '`' && literal.contains("${")) {
        return None;
    }
    Some(literal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infer(source: &str) -> Vec<String> {
        infer_capabilities(source)
            .into_iter()
            .map(|t| t.to_string())
            .collect()
    }

    #[test]
    fn reads_and_writes_are_distinguished() {
        let tokens = infer("$state.count = ($state.count ?? 0) + $args.by;");
        assert_eq!(tokens, vec!["state:read:count", "state:write:count"]);
    }

    #[test]
    fn plain_read_is_not_a_write() {
        assert_eq!(infer("const x = $state.total;"), vec!["state:read:total"]);
        assert_eq!(infer("if ($state.a === 1) {}"), vec!["state:read:a"]);
        assert_eq!(infer("const f = $state.a => 0;"), vec!["state:read:a"]);
    }

    #[test]
    fn compound_assignment_is_a_write() {
        assert_eq!(
            infer("$state.n += 1;"),
            vec!["state:read:n", "state:write:n"]
        );
        assert_eq!(
            infer("$state.n++;"),
            vec!["state:read:n", "state:write:n"]
        );
    }

    #[test]
    fn delete_is_a_write() {
        assert_eq!(
            infer("delete $state.tmp;"),
            vec!["state:read:tmp", "state:write:tmp"]
        );
    }

    #[test]
    fn computed_access_widens_to_wildcard() {
        let tokens = infer("$state[key] = 1;");
        assert_eq!(tokens, vec!["state:read:*", "state:write:*"]);
    }

    #[test]
    fn emit_literal_and_dynamic() {
        assert_eq!(infer(r#"$emit("ping", {});"#), vec!["events:emit:ping"]);
        assert_eq!(infer("$emit(name, {});"), vec!["events:emit:*"]);
        assert_eq!(infer(r#"$emit("a\"b", {});"#), vec!["events:emit:*"]);
    }

    #[test]
    fn view_and_ext_targets() {
        assert_eq!(
            infer(r#"$view.chart.update({}); $ext.http.get("https://x");"#),
            vec!["view:update:chart", "ext:http"]
        );
        assert_eq!(infer("$view[t].hide();"), vec!["view:update:*"]);
    }

    #[test]
    fn unrelated_dollars_are_ignored() {
        assert!(infer("const price$ = 3; $log('info', 'hi');").is_empty());
    }
}
