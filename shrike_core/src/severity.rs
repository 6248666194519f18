use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How interesting (bad) a single run was.
///
/// Variants are declared in ascending order so the derived `Ord` is the
/// verdict ordering. Combining two verdicts keeps the more serious one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    #[default]
    Fine,
    DidNotFinish,
    DecidedToExit,
    OverallMismatch,
    ValgrindAmiss,
    NewAssertOrCrash,
}

impl Severity {
    /// Every severity, least serious first.
    pub const ALL: [Severity; 6] = [
        Severity::Fine,
        Severity::DidNotFinish,
        Severity::DecidedToExit,
        Severity::OverallMismatch,
        Severity::ValgrindAmiss,
        Severity::NewAssertOrCrash,
    ];

    /// Max-combine. Commutative, associative, with `Fine` as identity.
    pub fn combine(self, other: Severity) -> Severity {
        self.max(other)
    }

    pub fn name(self) -> &'static str {
        match self {
            Severity::Fine => "fine",
            Severity::DidNotFinish => "did-not-finish",
            Severity::DecidedToExit => "decided-to-exit",
            Severity::OverallMismatch => "overall-mismatch",
            Severity::ValgrindAmiss => "valgrind-amiss",
            Severity::NewAssertOrCrash => "new-assert-or-crash",
        }
    }

    pub fn is_interesting(self) -> bool {
        self != Severity::Fine
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .iter()
            .copied()
            .find(|sev| sev.name() == s)
            .ok_or_else(|| format!("unknown severity '{s}'"))
    }
}

impl std::iter::Sum for Severity {
    fn sum<I: Iterator<Item = Severity>>(iter: I) -> Severity {
        iter.fold(Severity::Fine, Severity::combine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_is_commutative_with_fine_identity() {
        for a in Severity::ALL {
            assert_eq!(a.combine(Severity::Fine), a);
            assert_eq!(Severity::Fine.combine(a), a);
            for b in Severity::ALL {
                assert_eq!(a.combine(b), b.combine(a), "{a} vs {b}");
                for c in Severity::ALL {
                    assert_eq!(a.combine(b).combine(c), a.combine(b.combine(c)));
                }
            }
        }
    }

    #[test]
    fn ordering_follows_declaration() {
        assert!(Severity::Fine < Severity::DidNotFinish);
        assert!(Severity::DecidedToExit < Severity::OverallMismatch);
        assert!(Severity::ValgrindAmiss < Severity::NewAssertOrCrash);
        assert_eq!(
            Severity::ALL.iter().copied().sum::<Severity>(),
            Severity::NewAssertOrCrash
        );
    }

    #[test]
    fn names_round_trip_through_from_str() {
        for sev in Severity::ALL {
            assert_eq!(sev.name().parse::<Severity>(), Ok(sev));
        }
        assert!("catastrophic".parse::<Severity>().is_err());
    }
}
