//! URL pattern grammar.
//!
//! ```text
//! pattern := '/' | ('/' segment)+ ['/']
//! segment := const | '(' type ')' (':' name)? | '*'
//! type    := 'string' | 'number' | 'enum' ':' value ('|' value)*
//! ```
//!
//! `render` is the inverse of `parse` up to a trailing `/`.

use std::fmt;

use super::RouteError;

/// One `/`-separated piece of a compiled pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Const(String),
    Str { name: Option<String> },
    Number { name: Option<String> },
    Enum { values: Vec<String>, name: Option<String> },
    /// Matches the rest of the path and binds it to `*`.
    MatchAll,
}

impl Segment {
    /// Lower ranks are tried first when several children fit.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Segment::Const(_) => 0,
            Segment::Enum { .. } => 1,
            Segment::Number { .. } => 2,
            Segment::Str { .. } => 3,
            Segment::MatchAll => 4,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Segment::Str { name } | Segment::Number { name } | Segment::Enum { name, .. } => {
                name.as_deref()
            }
            Segment::MatchAll => Some("*"),
            Segment::Const(_) => None,
        }
    }

    /// Whether a single path token satisfies this segment.
    pub fn accepts(&self, token: &str) -> bool {
        match self {
            Segment::Const(value) => value == token,
            Segment::Enum { values, .. } => values.iter().any(|v| v == token),
            Segment::Number { .. } => !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()),
            Segment::Str { .. } => !token.is_empty(),
            Segment::MatchAll => true,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Segment::Const(value) => return f.write_str(value),
            Segment::MatchAll => return f.write_str("*"),
            Segment::Str { name } => {
                f.write_str("(string)")?;
                name
            }
            Segment::Number { name } => {
                f.write_str("(number)")?;
                name
            }
            Segment::Enum { values, name } => {
                write!(f, "(enum:{})", values.join("|"))?;
                name
            }
        };
        if let Some(name) = name {
            write!(f, ":{name}")?;
        }
        Ok(())
    }
}

/// Compile a pattern into its segments. `/` yields no segments.
pub fn parse(pattern: &str) -> Result<Vec<Segment>, RouteError> {
    let Some(rest) = pattern.strip_prefix('/') else {
        return Err(RouteError::Syntax("must start with /".into()));
    };
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    if rest.is_empty() {
        if pattern.len() > 1 {
            return Err(RouteError::Syntax("// not allowed".into()));
        }
        return Ok(Vec::new());
    }

    let raw: Vec<&str> = rest.split('/').collect();
    let mut segments = Vec::with_capacity(raw.len());
    for (i, token) in raw.iter().enumerate() {
        let segment = parse_segment(token)?;
        if segment == Segment::MatchAll && i != raw.len() - 1 {
            return Err(RouteError::Syntax("* must be the last segment".into()));
        }
        segments.push(segment);
    }
    Ok(segments)
}

/// Inverse of [`parse`].
pub fn render(segments: &[Segment]) -> String {
    if segments.is_empty() {
        return "/".to_string();
    }
    segments.iter().map(|s| format!("/{s}")).collect()
}

fn parse_segment(token: &str) -> Result<Segment, RouteError> {
    if token.is_empty() {
        return Err(RouteError::Syntax("// not allowed".into()));
    }
    if token == "*" {
        return Ok(Segment::MatchAll);
    }

    let Some(body) = token.strip_prefix('(') else {
        if token.contains('(') {
            return Err(RouteError::Syntax("( must after /".into()));
        }
        if token.contains(')') {
            return Err(RouteError::Syntax("missing (".into()));
        }
        if token.contains(':') {
            return Err(RouteError::Syntax("named arg not support const pattern".into()));
        }
        return Ok(Segment::Const(token.to_string()));
    };

    let Some(close) = body.find(')') else {
        return Err(RouteError::Syntax("missing )".into()));
    };
    let (kind, tail) = (&body[..close], &body[close + 1..]);

    let name = match tail {
        "" => None,
        _ => {
            let Some(name) = tail.strip_prefix(':') else {
                return Err(RouteError::Syntax(format!("unexpected token: {tail}")));
            };
            if !is_word(name) {
                return Err(RouteError::Syntax(format!("invalid arg name: {name:?}")));
            }
            Some(name.to_string())
        }
    };

    match kind {
        "string" => Ok(Segment::Str { name }),
        "number" => Ok(Segment::Number { name }),
        "enum" => Err(RouteError::Syntax("missing : with enum type".into())),
        _ => {
            let Some(values) = kind.strip_prefix("enum:") else {
                return Err(RouteError::Syntax(format!("unknown type: {kind}")));
            };
            let values: Vec<String> = values.split('|').map(str::to_string).collect();
            if values.iter().any(|v| !is_word(v)) {
                return Err(RouteError::Syntax(format!("invalid enum values: {kind}")));
            }
            Ok(Segment::Enum { values, name })
        }
    }
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_root() {
        assert!(parse("/").unwrap().is_empty());
    }

    #[test]
    fn test_parse_typed_segments() {
        let segments = parse("/users/(number):id/(enum:a|b):kind/(string)").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Const("users".into()),
                Segment::Number { name: Some("id".into()) },
                Segment::Enum {
                    values: vec!["a".into(), "b".into()],
                    name: Some("kind".into())
                },
                Segment::Str { name: None },
            ]
        );
    }

    #[test]
    fn test_trailing_slash_tolerated() {
        assert_eq!(parse("/a/b/").unwrap(), parse("/a/b").unwrap());
    }

    #[test]
    fn test_syntax_errors() {
        let cases = [
            "a/b",
            "/a//b",
            "//",
            "/(unknown)",
            "/(enum)",
            "/(string",
            "/string)",
            "/a(string)",
            "/users:id",
            "/(string):",
            "/(number)x",
            "/*/a",
        ];
        for case in cases {
            assert!(
                matches!(parse(case), Err(RouteError::Syntax(_))),
                "{case} should not parse"
            );
        }
    }

    #[test]
    fn test_render_round_trip() {
        for pattern in ["/", "/a", "/users/(number):id", "/x/(enum:me|admin):who/*"] {
            assert_eq!(render(&parse(pattern).unwrap()), pattern);
        }
    }

    fn segment_strategy() -> impl Strategy<Value = String> {
        let word = "[a-z0-9_]{1,6}";
        prop_oneof![
            word.prop_map(|w| w),
            Just("(string)".to_string()),
            word.prop_map(|n| format!("(number):{n}")),
            (prop::collection::vec(word, 1..4), word)
                .prop_map(|(vs, n)| format!("(enum:{}):{n}", vs.join("|"))),
        ]
    }

    proptest! {
        #[test]
        fn prop_render_inverts_parse(
            segs in prop::collection::vec(segment_strategy(), 0..6),
            trailing in any::<bool>(),
        ) {
            let mut pattern: String = segs.iter().map(|s| format!("/{s}")).collect();
            if pattern.is_empty() {
                pattern.push('/');
            }
            let canonical = pattern.clone();
            if trailing && pattern.len() > 1 {
                pattern.push('/');
            }
            let parsed = parse(&pattern).unwrap();
            prop_assert_eq!(render(&parsed), canonical);
        }
    }
}
