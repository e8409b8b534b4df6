//! Failure taxonomy shared by the transport, retry engine and health manager.

use std::fmt;

/// Where a failed operation went wrong.
///
/// Categories are attached at the point of failure (transport errors carry
/// one). [`FailureCategory::classify`] exists for collaborators that only
/// report a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureCategory {
    /// Network unreachable, connection refused or reset
    Connectivity,
    /// Deadline exceeded
    Timeout,
    /// Peer is throttling or out of resources
    RateLimit,
    /// Credentials rejected
    Authentication,
    /// Peer reported an internal failure
    ServerError,
    /// Malformed or unexpected message
    Protocol,
    /// Ratchet state diverged from the peer
    CryptographicDesync,
    /// Nothing more specific is known
    Unknown,
}

/// Number of failure categories.
pub const CATEGORY_COUNT: usize = 8;

impl FailureCategory {
    /// All categories, in declaration order.
    pub const ALL: [Self; CATEGORY_COUNT] = [
        Self::Connectivity,
        Self::Timeout,
        Self::RateLimit,
        Self::Authentication,
        Self::ServerError,
        Self::Protocol,
        Self::CryptographicDesync,
        Self::Unknown,
    ];

    /// Best-effort category from a free-form failure description.
    ///
    /// Matching is case-insensitive and ordered, so "connection timed out"
    /// is a timeout rather than a connectivity failure.
    pub fn classify(description: &str) -> Self {
        const RULES: &[(FailureCategory, &[&str])] = &[
            (FailureCategory::Timeout, &["timeout", "timed out", "deadline"]),
            (FailureCategory::RateLimit, &[
                "rate limit",
                "throttl",
                "too many",
                "resource exhausted",
                "resourceexhausted",
            ]),
            (FailureCategory::Authentication, &[
                "unauthenticated",
                "unauthorized",
                "authentication",
                "forbidden",
                "permission denied",
            ]),
            (FailureCategory::CryptographicDesync, &[
                "decrypt",
                "ratchet",
                "replay",
                "desync",
                "mac mismatch",
            ]),
            (FailureCategory::Connectivity, &[
                "unavailable",
                "connection",
                "connect",
                "network",
                "unreachable",
                "refused",
                "reset",
                "dns",
            ]),
            (FailureCategory::ServerError, &["internal", "server error", "500", "502"]),
            (FailureCategory::Protocol, &["protocol", "malformed", "unexpected", "invalid"]),
        ];

        let lowered = description.to_ascii_lowercase();
        RULES
            .iter()
            .find(|(_, needles)| needles.iter().any(|needle| lowered.contains(needle)))
            .map_or(Self::Unknown, |(category, _)| *category)
    }

    /// Returns true if the failure may succeed on retry.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Connectivity | Self::Timeout | Self::RateLimit | Self::ServerError)
    }

    /// Returns true if one failure of this kind marks the connection failed.
    pub fn escalates(self) -> bool {
        matches!(self, Self::Authentication | Self::CryptographicDesync)
    }

    /// Dense index for per-category counters.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connectivity => "connectivity",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate-limit",
            Self::Authentication => "authentication",
            Self::ServerError => "server-error",
            Self::Protocol => "protocol",
            Self::CryptographicDesync => "cryptographic-desync",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_keywords() {
        let cases = [
            ("Connection timed out", FailureCategory::Timeout),
            ("DEADLINE_EXCEEDED", FailureCategory::Timeout),
            ("status: Unavailable", FailureCategory::Connectivity),
            ("connection refused", FailureCategory::Connectivity),
            ("429 Too Many Requests", FailureCategory::RateLimit),
            ("RESOURCE_EXHAUSTED", FailureCategory::RateLimit),
            ("Unauthenticated: token expired", FailureCategory::Authentication),
            ("failed to decrypt payload", FailureCategory::CryptographicDesync),
            ("internal error", FailureCategory::ServerError),
            ("malformed frame", FailureCategory::Protocol),
            ("something odd", FailureCategory::Unknown),
        ];

        for (description, expected) in cases {
            assert_eq!(FailureCategory::classify(description), expected, "{description}");
        }
    }

    #[test]
    fn transient_and_escalating_are_disjoint() {
        for category in FailureCategory::ALL {
            assert!(!(category.is_transient() && category.escalates()), "{category}");
        }
    }

    #[test]
    fn index_is_dense() {
        for (position, category) in FailureCategory::ALL.into_iter().enumerate() {
            assert_eq!(category.index(), position);
        }
    }
}
