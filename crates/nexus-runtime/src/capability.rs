//! Capability token grammar and enforcement.
//!
//! Tokens have the string form `domain:action` or `domain:action:scope`, with
//! `domain:*` granting every action in a domain. The extension domain has no
//! action segment: `ext:<name>` (alias `extension:<name>`) or `ext:*`.
//!
//! Checks run on every host call, so matching is pure and allocation-free.

use thiserror::Error;

/// Capability domains. `Ext` accepts the `extension` alias in string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Domain {
    State,
    Events,
    View,
    Ext,
}

impl Domain {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Events => "events",
            Self::View => "view",
            Self::Ext => "ext",
        }
    }
}

/// Scope component of a token: a concrete name or the `*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScopeMatch {
    Any,
    Exact(String),
}

impl ScopeMatch {
    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == name,
        }
    }

    fn parse(segment: &str) -> Self {
        if segment == "*" {
            Self::Any
        } else {
            Self::Exact(segment.to_owned())
        }
    }
}

/// A single parsed capability token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CapabilityToken {
    StateRead(ScopeMatch),
    StateWrite(ScopeMatch),
    EmitEvent(ScopeMatch),
    UpdateView(ScopeMatch),
    Extension(ScopeMatch),
    /// `domain:*` — every action and scope within the domain.
    All(Domain),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid capability token {token:?}: {reason}")]
pub struct ParseError {
    pub token: String,
    pub reason: &'static str,
}

impl ParseError {
    fn new(token: &str, reason: &'static str) -> Self {
        Self {
            token: token.to_owned(),
            reason,
        }
    }
}

impl CapabilityToken {
    /// Canonical token for reading a concrete state key.
    #[must_use]
    pub fn state_read(key: impl Into<String>) -> Self {
        Self::StateRead(ScopeMatch::Exact(key.into()))
    }

    /// Canonical token for writing a concrete state key.
    #[must_use]
    pub fn state_write(key: impl Into<String>) -> Self {
        Self::StateWrite(ScopeMatch::Exact(key.into()))
    }

    #[must_use]
    pub fn emit_event(name: impl Into<String>) -> Self {
        Self::EmitEvent(ScopeMatch::Exact(name.into()))
    }

    #[must_use]
    pub fn update_view(target: impl Into<String>) -> Self {
        Self::UpdateView(ScopeMatch::Exact(target.into()))
    }

    #[must_use]
    pub fn extension(name: impl Into<String>) -> Self {
        Self::Extension(ScopeMatch::Exact(name.into()))
    }
}

impl core::str::FromStr for CapabilityToken {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = s.split(':');
        let domain = segments.next().unwrap_or_default();
        let action = segments
            .next()
            .ok_or_else(|| ParseError::new(s, "missing action segment"))?;
        let scope = segments.next();
        if segments.next().is_some() {
            return Err(ParseError::new(s, "too many segments"));
        }
        if action.is_empty() || scope.is_some_and(str::is_empty) {
            return Err(ParseError::new(s, "empty segment"));
        }

        match domain {
            "state" | "events" | "view" => {
                let domain = match domain {
                    "state" => Domain::State,
                    "events" => Domain::Events,
                    _ => Domain::View,
                };
                if action == "*" {
                    if scope.is_some() {
                        return Err(ParseError::new(s, "wildcard action takes no scope"));
                    }
                    return Ok(Self::All(domain));
                }
                // A bare `domain:action` means every scope.
                let scope = scope.map_or(ScopeMatch::Any, ScopeMatch::parse);
                match (domain, action) {
                    (Domain::State, "read") => Ok(Self::StateRead(scope)),
                    (Domain::State, "write") => Ok(Self::StateWrite(scope)),
                    (Domain::Events, "emit") => Ok(Self::EmitEvent(scope)),
                    (Domain::View, "update") => Ok(Self::UpdateView(scope)),
                    _ => Err(ParseError::new(s, "unknown action for domain")),
                }
            }
            "ext" | "extension" => {
                if scope.is_some() {
                    return Err(ParseError::new(s, "extension tokens have no action segment"));
                }
                Ok(Self::Extension(ScopeMatch::parse(action)))
            }
            _ => Err(ParseError::new(s, "unknown domain")),
        }
    }
}

impl core::fmt::Display for CapabilityToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let scope = |f: &mut core::fmt::Formatter<'_>, prefix: &str, s: &ScopeMatch| match s {
            ScopeMatch::Any => write!(f, "{prefix}:*"),
            ScopeMatch::Exact(name) => write!(f, "{prefix}:{name}"),
        };
        match self {
            Self::StateRead(s) => scope(f, "state:read", s),
            Self::StateWrite(s) => scope(f, "state:write", s),
            Self::EmitEvent(s) => scope(f, "events:emit", s),
            Self::UpdateView(s) => scope(f, "view:update", s),
            Self::Extension(s) => scope(f, "ext", s),
            Self::All(domain) => write!(f, "{}:*", domain.as_str()),
        }
    }
}

/// The set of tokens granted to one execution; doubles as the checker bound
/// to a sandbox instance.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    tokens: Vec<CapabilityToken>,
}

impl CapabilitySet {
    #[must_use]
    pub const fn new() -> Self {
        Self { tokens: Vec::new() }
    }

    /// Parse a list of token strings into a set.
    ///
    /// # Errors
    /// Returns the first parse failure.
    pub fn parse<I, S>(tokens: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens = tokens
            .into_iter()
            .map(|t| t.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { tokens })
    }

    pub fn insert(&mut self, token: CapabilityToken) {
        if !self.tokens.contains(&token) {
            self.tokens.push(token);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    #[must_use]
    pub fn tokens(&self) -> &[CapabilityToken] {
        &self.tokens
    }

    #[must_use]
    pub fn can_read_state(&self, key: &str) -> bool {
        self.tokens.iter().any(|t| match t {
            CapabilityToken::StateRead(scope) => scope.matches(key),
            CapabilityToken::All(Domain::State) => true,
            _ => false,
        })
    }

    #[must_use]
    pub fn can_write_state(&self, key: &str) -> bool {
        self.tokens.iter().any(|t| match t {
            CapabilityToken::StateWrite(scope) => scope.matches(key),
            CapabilityToken::All(Domain::State) => true,
            _ => false,
        })
    }

    #[must_use]
    pub fn can_emit_event(&self, name: &str) -> bool {
        self.tokens.iter().any(|t| match t {
            CapabilityToken::EmitEvent(scope) => scope.matches(name),
            CapabilityToken::All(Domain::Events) => true,
            _ => false,
        })
    }

    #[must_use]
    pub fn can_update_view(&self, target: &str) -> bool {
        self.tokens.iter().any(|t| match t {
            CapabilityToken::UpdateView(scope) => scope.matches(target),
            CapabilityToken::All(Domain::View) => true,
            _ => false,
        })
    }

    #[must_use]
    pub fn can_access_extension(&self, name: &str) -> bool {
        self.tokens.iter().any(|t| match t {
            CapabilityToken::Extension(scope) => scope.matches(name),
            CapabilityToken::All(Domain::Ext) => true,
            _ => false,
        })
    }

    /// Generic form of the per-operation checks.
    ///
    /// A required token with a wildcard scope (for example `state:read:*`,
    /// required by `state_keys`) is only satisfied by a grant covering the
    /// whole domain+action, never by a concrete-scope grant.
    #[must_use]
    pub fn check(&self, required: &CapabilityToken) -> bool {
        match required {
            CapabilityToken::StateRead(ScopeMatch::Exact(k)) => self.can_read_state(k),
            CapabilityToken::StateWrite(ScopeMatch::Exact(k)) => self.can_write_state(k),
            CapabilityToken::EmitEvent(ScopeMatch::Exact(n)) => self.can_emit_event(n),
            CapabilityToken::UpdateView(ScopeMatch::Exact(t)) => self.can_update_view(t),
            CapabilityToken::Extension(ScopeMatch::Exact(n)) => self.can_access_extension(n),
            CapabilityToken::StateRead(ScopeMatch::Any) => self.tokens.iter().any(|t| {
                matches!(
                    t,
                    CapabilityToken::StateRead(ScopeMatch::Any)
                        | CapabilityToken::All(Domain::State)
                )
            }),
            CapabilityToken::StateWrite(ScopeMatch::Any) => self.tokens.iter().any(|t| {
                matches!(
                    t,
                    CapabilityToken::StateWrite(ScopeMatch::Any)
                        | CapabilityToken::All(Domain::State)
                )
            }),
            CapabilityToken::EmitEvent(ScopeMatch::Any) => self.tokens.iter().any(|t| {
                matches!(
                    t,
                    CapabilityToken::EmitEvent(ScopeMatch::Any)
                        | CapabilityToken::All(Domain::Events)
                )
            }),
            CapabilityToken::UpdateView(ScopeMatch::Any) => self.tokens.iter().any(|t| {
                matches!(
                    t,
                    CapabilityToken::UpdateView(ScopeMatch::Any)
                        | CapabilityToken::All(Domain::View)
                )
            }),
            CapabilityToken::Extension(ScopeMatch::Any) => self.tokens.iter().any(|t| {
                matches!(
                    t,
                    CapabilityToken::Extension(ScopeMatch::Any) | CapabilityToken::All(Domain::Ext)
                )
            }),
            CapabilityToken::All(domain) => self
                .tokens
                .iter()
                .any(|t| matches!(t, CapabilityToken::All(d) if d == domain)),
        }
    }
}

impl FromIterator<CapabilityToken> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = CapabilityToken>>(iter: I) -> Self {
        let mut set = Self::new();
        for token in iter {
            set.insert(token);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tokens: &[&str]) -> CapabilitySet {
        CapabilitySet::parse(tokens).expect("parse set")
    }

    #[test]
    fn parse_and_display_roundtrip() {
        for (input, canonical) in [
            ("state:read:count", "state:read:count"),
            ("state:read:*", "state:read:*"),
            ("state:read", "state:read:*"),
            ("state:*", "state:*"),
            ("events:emit:ping", "events:emit:ping"),
            ("view:update:chart", "view:update:chart"),
            ("ext:http", "ext:http"),
            ("extension:http", "ext:http"),
            ("ext:*", "ext:*"),
        ] {
            let token: CapabilityToken = input.parse().expect(input);
            assert_eq!(token.to_string(), canonical, "{input}");
        }
    }

    #[test]
    fn parse_rejects_malformed() {
        for input in [
            "",
            "state",
            "state:",
            "state:read:",
            "state:delete:x",
            "state:read:a:b",
            "net:read:x",
            "ext:http:get",
            "state:*:x",
        ] {
            assert!(input.parse::<CapabilityToken>().is_err(), "{input:?}");
        }
    }

    #[test]
    fn exact_scope_matching() {
        let caps = set(&["state:read:count", "state:write:count"]);
        assert!(caps.can_read_state("count"));
        assert!(caps.can_write_state("count"));
        assert!(!caps.can_read_state("secret"));
        assert!(!caps.can_write_state("secret"));
        assert!(!caps.can_emit_event("count"));
    }

    #[test]
    fn wildcard_scope_matching() {
        let caps = set(&["state:read:*"]);
        assert!(caps.can_read_state("anything"));
        assert!(!caps.can_write_state("anything"));
    }

    #[test]
    fn domain_wildcard_grants_all_actions() {
        let caps = set(&["state:*"]);
        assert!(caps.can_read_state("a"));
        assert!(caps.can_write_state("b"));
        assert!(!caps.can_emit_event("a"));
        assert!(!caps.can_access_extension("a"));
    }

    #[test]
    fn extension_matching() {
        let caps = set(&["ext:http"]);
        assert!(caps.can_access_extension("http"));
        assert!(!caps.can_access_extension("db"));
        assert!(set(&["ext:*"]).can_access_extension("db"));
    }

    #[test]
    fn wildcard_requirement_needs_wildcard_grant() {
        let exact = set(&["state:read:count"]);
        assert!(!exact.check(&CapabilityToken::StateRead(ScopeMatch::Any)));
        assert!(set(&["state:read:*"]).check(&CapabilityToken::StateRead(ScopeMatch::Any)));
        assert!(set(&["state:*"]).check(&CapabilityToken::StateRead(ScopeMatch::Any)));
    }

    #[test]
    fn domains_do_not_confer_each_other() {
        let caps = set(&["events:*", "view:*"]);
        assert!(!caps.can_read_state("x"));
        assert!(!caps.can_access_extension("x"));
        assert!(caps.can_emit_event("x"));
        assert!(caps.can_update_view("x"));
    }

    #[test]
    fn insert_deduplicates() {
        let mut caps = CapabilitySet::new();
        caps.insert(CapabilityToken::state_read("a"));
        caps.insert(CapabilityToken::state_read("a"));
        assert_eq!(caps.tokens().len(), 1);
    }
}
