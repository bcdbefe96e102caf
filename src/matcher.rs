//! Match expressions: predicates over descriptor metadata used to register
//! broad listeners (e.g. "all outbound events").

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::descriptor::{EventDescriptor, FlowDirection, InvokeRole};

/// A snapshot of a descriptor's metadata, passed to predicate matchers.
/// Kept separate from `EventDescriptor<T>` so a single `Match` value is not
/// generic over a payload type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorMeta {
    /// The descriptor's stable id.
    pub id: String,
    /// The descriptor's flow-direction marker, if any.
    pub flow_direction: Option<FlowDirection>,
    /// The descriptor's invoke-role marker, if any.
    pub invoke_role: Option<InvokeRole>,
}

impl<T> From<&EventDescriptor<T>> for DescriptorMeta {
    fn from(d: &EventDescriptor<T>) -> Self {
        DescriptorMeta {
            id: d.id().to_string(),
            flow_direction: d.flow_direction(),
            invoke_role: d.invoke_role(),
        }
    }
}

type Predicate = Arc<dyn Fn(&DescriptorMeta) -> bool + Send + Sync>;

/// A process-wide counter handing out a fresh id to every constructed
/// `Predicate`/`And`/`Or` match, so distinct matchers of the same shape
/// never alias under `TargetKey::Other` (see `crate::bus`'s dedup/removal
/// bookkeeping, which keys off this id rather than the closure itself).
static NEXT_MATCH_ID: AtomicU64 = AtomicU64::new(0);

fn next_match_id() -> u64 {
    NEXT_MATCH_ID.fetch_add(1, Ordering::Relaxed)
}

/// A predicate over descriptors used to register broad listeners.
#[derive(Clone)]
pub enum Match {
    /// Matches exactly one descriptor id.
    Literal(String),
    /// Matches every descriptor.
    Wildcard,
    /// Matches whatever the user-supplied function accepts. The `u64` is
    /// this match value's own identity, distinct from every other call to
    /// [`Match::predicate`] even if the closures behave identically.
    Predicate(u64, Predicate),
    /// Matches if both sub-expressions match. Carries its own identity for
    /// the same reason as `Predicate`.
    And(u64, Box<Match>, Box<Match>),
    /// Matches if either sub-expression matches. Carries its own identity
    /// for the same reason as `Predicate`.
    Or(u64, Box<Match>, Box<Match>),
}

impl Match {
    /// Match a single descriptor id exactly.
    pub fn literal(id: impl Into<String>) -> Self {
        Match::Literal(id.into())
    }

    /// Match every descriptor.
    pub fn wildcard() -> Self {
        Match::Wildcard
    }

    /// Match descriptors satisfying an arbitrary predicate.
    pub fn predicate(f: impl Fn(&DescriptorMeta) -> bool + Send + Sync + 'static) -> Self {
        Match::Predicate(next_match_id(), Arc::new(f))
    }

    /// Match only descriptors carrying the given invoke role.
    pub fn invoke_role(role: InvokeRole) -> Self {
        Match::predicate(move |meta| meta.invoke_role == Some(role))
    }

    /// Match only descriptors carrying the given flow direction.
    pub fn flow_direction(direction: FlowDirection) -> Self {
        Match::predicate(move |meta| meta.flow_direction == Some(direction))
    }

    /// Combine with `other` via logical AND.
    pub fn and(self, other: Match) -> Self {
        Match::And(next_match_id(), Box::new(self), Box::new(other))
    }

    /// Combine with `other` via logical OR.
    pub fn or(self, other: Match) -> Self {
        Match::Or(next_match_id(), Box::new(self), Box::new(other))
    }

    /// Evaluate the match expression against a descriptor's metadata.
    pub fn matches(&self, meta: &DescriptorMeta) -> bool {
        match self {
            Match::Literal(id) => &meta.id == id,
            Match::Wildcard => true,
            Match::Predicate(_, f) => f(meta),
            Match::And(_, a, b) => a.matches(meta) && b.matches(meta),
            Match::Or(_, a, b) => a.matches(meta) || b.matches(meta),
        }
    }

    /// The literal id this match targets, if it is a bare `Literal`.
    ///
    /// Used by [`crate::bus::Context`] to route literal registrations into
    /// the fast per-id bucket instead of the linear wildcard/predicate list.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Match::Literal(id) => Some(id.as_str()),
            _ => None,
        }
    }

    /// This match value's own identity, distinguishing it from every other
    /// non-literal, non-wildcard match — even one built from an identical
    /// predicate or the same pair of sub-expressions. `None` for `Literal`
    /// and `Wildcard`, which are already uniquely keyed by shape.
    pub(crate) fn identity(&self) -> Option<u64> {
        match self {
            Match::Literal(_) | Match::Wildcard => None,
            Match::Predicate(id, _) | Match::And(id, _, _) | Match::Or(id, _, _) => Some(*id),
        }
    }
}

impl fmt::Debug for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Match::Literal(id) => f.debug_tuple("Literal").field(id).finish(),
            Match::Wildcard => write!(f, "Wildcard"),
            Match::Predicate(id, _) => f.debug_tuple("Predicate").field(id).finish(),
            Match::And(id, a, b) => f.debug_tuple("And").field(id).field(a).field(b).finish(),
            Match::Or(id, a, b) => f.debug_tuple("Or").field(id).field(a).field(b).finish(),
        }
    }
}

impl<T> From<&EventDescriptor<T>> for Match {
    fn from(d: &EventDescriptor<T>) -> Self {
        Match::Literal(d.id().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str) -> DescriptorMeta {
        DescriptorMeta {
            id: id.to_string(),
            flow_direction: None,
            invoke_role: None,
        }
    }

    #[test]
    fn wildcard_matches_anything() {
        assert!(Match::wildcard().matches(&meta("whatever")));
    }

    #[test]
    fn literal_matches_only_its_id() {
        let m = Match::literal("foo");
        assert!(m.matches(&meta("foo")));
        assert!(!m.matches(&meta("bar")));
    }

    #[test]
    fn and_or_compose() {
        let m = Match::literal("foo").or(Match::literal("bar"));
        assert!(m.matches(&meta("foo")));
        assert!(m.matches(&meta("bar")));
        assert!(!m.matches(&meta("baz")));

        let m2 = Match::literal("foo").and(Match::predicate(|_| false));
        assert!(!m2.matches(&meta("foo")));
    }
}
