//! Per-route TTL rules: an ordered list of matchers paired with lifetime
//! directives. The first matching rule wins; a request no rule matches
//! bypasses the cache entirely.

use std::{fmt, sync::Arc};

use regex::Regex;
use thiserror::Error;

/// A closure matcher over the request path. It may rewrite the path in
/// place; the rewrite is only adopted when the closure returns `true`.
pub type PathPredicate = Arc<dyn Fn(&mut String) -> bool + Send + Sync>;

/// Errors raised while building a [`RuleSet`]. Misconfigured rules are
/// fatal at construction rather than silent at match time.
#[derive(Error, Debug)]
pub enum RuleError {
    /// The matcher pattern failed to compile
    #[error(transparent)]
    Pattern(#[from] regex::Error),
    /// A clamping range had no bounds at all
    #[error("ttl range needs at least one bound")]
    EmptyRange,
    /// A clamping range had min above max
    #[error("ttl range has min {min} above max {max}")]
    InvertedRange {
        /// The offending lower bound
        min: u64,
        /// The offending upper bound
        max: u64,
    },
}

/// How a matched route decides the lifetime of its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlSpec {
    /// Cache for exactly this many seconds, overriding the origin
    Seconds(u64),
    /// Force the entry out of storage and pass the request through
    Invalidate,
    /// Clamp the origin-declared lifetime into `[min, max]`
    Range {
        /// Lower bound, also used when the origin declares no lifetime
        min: Option<u64>,
        /// Upper bound
        max: Option<u64>,
    },
}

impl TtlSpec {
    fn validate(&self) -> Result<(), RuleError> {
        if let TtlSpec::Range { min, max } = *self {
            match (min, max) {
                (None, None) => return Err(RuleError::EmptyRange),
                (Some(min), Some(max)) if min > max => {
                    return Err(RuleError::InvertedRange { min, max })
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Applies this directive to an origin-declared lifetime.
    pub(crate) fn arbitrate(&self, origin: Option<i64>) -> Option<u64> {
        match *self {
            TtlSpec::Seconds(n) => Some(n),
            TtlSpec::Invalidate => None,
            TtlSpec::Range { min, max } => {
                let mut ttl = match origin {
                    Some(ttl) if ttl > 0 => ttl as u64,
                    Some(_) => 0,
                    None => return min,
                };
                if let Some(min) = min {
                    ttl = ttl.max(min);
                }
                if let Some(max) = max {
                    ttl = ttl.min(max);
                }
                Some(ttl)
            }
        }
    }
}

/// A path matcher: a compiled pattern or a user-supplied predicate.
#[derive(Clone)]
pub enum Matcher {
    /// Tested against the request path
    Pattern(Regex),
    /// Invoked with the request path; may rewrite it
    Predicate(PathPredicate),
}

impl Matcher {
    /// Compiles a pattern matcher.
    pub fn pattern(pattern: &str) -> Result<Self, RuleError> {
        Ok(Self::Pattern(Regex::new(pattern)?))
    }

    /// Wraps a predicate matcher.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&mut String) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern(re) => {
                f.debug_tuple("Pattern").field(&re.as_str()).finish()
            }
            Self::Predicate(_) => f
                .debug_tuple("Predicate")
                .field(&"Fn(&mut String) -> bool")
                .finish(),
        }
    }
}

/// One `(matcher, ttl)` pair.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Which paths this rule claims
    pub matcher: Matcher,
    /// How long matched entries live
    pub ttl: TtlSpec,
}

impl Rule {
    /// Builds a rule.
    pub fn new(matcher: Matcher, ttl: TtlSpec) -> Self {
        Self { matcher, ttl }
    }
}

/// The outcome of a successful rule match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    /// The matched rule's lifetime directive
    pub ttl: TtlSpec,
    /// The request path, as rewritten by the matcher if it chose to
    pub path: String,
}

/// An ordered rule list. Order is user-visible: more specific rules must
/// come first. An empty set caches nothing.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Builds a rule set, rejecting misconfigured TTL ranges.
    pub fn new(rules: Vec<Rule>) -> Result<Self, RuleError> {
        for rule in &rules {
            rule.ttl.validate()?;
        }
        Ok(Self { rules })
    }

    /// True when no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Scans the rules in order and returns the first match, along with the
    /// path as it stands after that matcher ran. Predicates that rewrite
    /// the path only take effect when they match.
    pub fn matched(&self, path: &str) -> Option<RuleMatch> {
        for rule in &self.rules {
            match &rule.matcher {
                Matcher::Pattern(re) => {
                    if re.is_match(path) {
                        return Some(RuleMatch {
                            ttl: rule.ttl,
                            path: path.to_string(),
                        });
                    }
                }
                Matcher::Predicate(predicate) => {
                    let mut scratch = path.to_string();
                    if predicate(&mut scratch) {
                        return Some(RuleMatch { ttl: rule.ttl, path: scratch });
                    }
                }
            }
        }
        None
    }
}
