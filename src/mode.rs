//! Process mode and URL path classification.
//!
//! The proxy serves exactly one entity scope per process: creditors,
//! debtors, or accounts. The mode is fixed at startup from the environment
//! and determines which paths are sharded, which are global, and which are
//! handled by the proxy itself (enumerate stitching and id reservation).
//!
//! Accepted path shapes per mode:
//!
//! | Mode | sharded | global | reserve |
//! |------|---------|--------|---------|
//! | Creditors | `/creditors/<id>/...` | `/creditors/.wallet`, `/creditors/.list` | `/creditors/.creditor-reserve` |
//! | Debtors | `/debtors/<id>/...` | `/debtors/.debtor`, `/debtors/.list` | `/debtors/.debtor-reserve` |
//! | Accounts | `/accounts/<id>/<id>/...` | (none) | (none) |
//!
//! Id segments are 1 to 20 decimal digits.

/// Entity scope served by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Creditors { min_id: i64, max_id: i64 },
    Debtors { min_id: i64, max_id: i64 },
    Accounts,
}

/// Raw id segments captured from a sharded path.
#[derive(Debug, PartialEq, Eq)]
pub enum ShardedMatch<'a> {
    One(&'a str),
    Two(&'a str, &'a str),
}

/// Splits a leading run of 1 to 20 decimal digits off `s`, requiring the run
/// to be followed by a `/`.
fn id_segment(s: &str) -> Option<(&str, &str)> {
    let digits = s.len() - s.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if !(1..=20).contains(&digits) {
        return None;
    }
    let rest = &s[digits..];
    rest.starts_with('/').then(|| (&s[..digits], rest))
}

impl Mode {
    fn scope(&self) -> &'static str {
        match self {
            Mode::Creditors { .. } => "creditors",
            Mode::Debtors { .. } => "debtors",
            Mode::Accounts => "accounts",
        }
    }

    fn scope_prefix<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix('/')?;
        let rest = rest.strip_prefix(self.scope())?;
        rest.strip_prefix('/')
    }

    /// Captures the id segments of a sharded path, without parsing them.
    pub fn match_sharded<'a>(&self, path: &'a str) -> Option<ShardedMatch<'a>> {
        let rest = self.scope_prefix(path)?;
        match self {
            Mode::Creditors { .. } | Mode::Debtors { .. } => {
                let (id, _) = id_segment(rest)?;
                Some(ShardedMatch::One(id))
            }
            Mode::Accounts => {
                let (first, rest) = id_segment(rest)?;
                let (second, _) = id_segment(&rest[1..])?;
                Some(ShardedMatch::Two(first, second))
            }
        }
    }

    /// Whether the path is one of the mode's unsharded endpoints, served by
    /// an arbitrary backend.
    pub fn matches_global(&self, path: &str) -> bool {
        match self {
            Mode::Creditors { .. } => path == "/creditors/.wallet" || path == "/creditors/.list",
            Mode::Debtors { .. } => path == "/debtors/.debtor" || path == "/debtors/.list",
            Mode::Accounts => false,
        }
    }

    /// Whether the path is the per-entity enumeration endpoint.
    pub fn is_enumerate(&self, path: &str) -> bool {
        match self {
            Mode::Creditors { .. } | Mode::Debtors { .. } => self
                .scope_prefix(path)
                .and_then(id_segment)
                .is_some_and(|(_, rest)| rest == "/enumerate"),
            Mode::Accounts => false,
        }
    }

    /// Builds the enumeration path for an entity id (unsigned form) and a
    /// config version token.
    pub fn enumerate_path(&self, id: u64, version: &str) -> String {
        format!("/{}/{id}/enumerate?v={version}", self.scope())
    }

    /// A path guaranteed to match no route, used to break stale
    /// enumeration chains.
    pub fn invalid_path(&self) -> &'static str {
        match self {
            Mode::Creditors { .. } => "/creditors/.invalid-path",
            Mode::Debtors { .. } => "/debtors/.invalid-path",
            Mode::Accounts => "/accounts/.invalid-path",
        }
    }

    /// The incoming path handled by the reservation endpoint, if the mode
    /// has one.
    pub fn reserve_path(&self) -> Option<&'static str> {
        match self {
            Mode::Creditors { .. } => Some("/creditors/.creditor-reserve"),
            Mode::Debtors { .. } => Some("/debtors/.debtor-reserve"),
            Mode::Accounts => None,
        }
    }

    /// The upstream path a reservation attempt is POSTed to.
    pub fn reserve_forward_path(&self, id: u64) -> String {
        format!("/{}/{id}/reserve", self.scope())
    }

    /// JSON `type` of the reservation request body.
    pub fn reservation_type(&self) -> Option<&'static str> {
        match self {
            Mode::Creditors { .. } => Some("CreditorReservationRequest"),
            Mode::Debtors { .. } => Some("DebtorReservationRequest"),
            Mode::Accounts => None,
        }
    }

    /// Inclusive id interval for random reservations.
    pub fn id_interval(&self) -> Option<(i64, i64)> {
        match self {
            Mode::Creditors { min_id, max_id } | Mode::Debtors { min_id, max_id } => {
                Some((*min_id, *max_id))
            }
            Mode::Accounts => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREDITORS: Mode = Mode::Creditors { min_id: 1, max_id: 100 };
    const DEBTORS: Mode = Mode::Debtors { min_id: 1, max_id: 100 };

    #[test]
    fn sharded_creditor_paths() {
        assert_eq!(
            CREDITORS.match_sharded("/creditors/5/info"),
            Some(ShardedMatch::One("5"))
        );
        assert_eq!(
            CREDITORS.match_sharded("/creditors/18446744073709551615/"),
            Some(ShardedMatch::One("18446744073709551615"))
        );
        // The id must be followed by a slash.
        assert_eq!(CREDITORS.match_sharded("/creditors/5"), None);
        assert_eq!(CREDITORS.match_sharded("/creditors/5x/info"), None);
        assert_eq!(CREDITORS.match_sharded("/creditors//info"), None);
        assert_eq!(CREDITORS.match_sharded("/debtors/5/info"), None);
        // 21 digits do not match.
        assert_eq!(
            CREDITORS.match_sharded("/creditors/123456789012345678901/info"),
            None
        );
    }

    #[test]
    fn sharded_account_paths() {
        assert_eq!(
            Mode::Accounts.match_sharded("/accounts/1/2/info"),
            Some(ShardedMatch::Two("1", "2"))
        );
        assert_eq!(Mode::Accounts.match_sharded("/accounts/1/2"), None);
        assert_eq!(Mode::Accounts.match_sharded("/accounts/1/info"), None);
        assert_eq!(Mode::Accounts.match_sharded("/creditors/1/2/info"), None);
    }

    #[test]
    fn global_paths() {
        assert!(CREDITORS.matches_global("/creditors/.wallet"));
        assert!(CREDITORS.matches_global("/creditors/.list"));
        assert!(!CREDITORS.matches_global("/creditors/.wallet/"));
        assert!(!CREDITORS.matches_global("/debtors/.debtor"));
        assert!(DEBTORS.matches_global("/debtors/.debtor"));
        assert!(DEBTORS.matches_global("/debtors/.list"));
        assert!(!Mode::Accounts.matches_global("/accounts/.list"));
    }

    #[test]
    fn enumerate_paths() {
        assert!(CREDITORS.is_enumerate("/creditors/5/enumerate"));
        assert!(!CREDITORS.is_enumerate("/creditors/5/enumerate/"));
        assert!(!CREDITORS.is_enumerate("/creditors/5/info"));
        assert!(!CREDITORS.is_enumerate("/creditors/.wallet"));
        assert!(DEBTORS.is_enumerate("/debtors/0/enumerate"));
        assert!(!Mode::Accounts.is_enumerate("/accounts/1/2/enumerate"));
    }

    #[test]
    fn builders() {
        assert_eq!(
            CREDITORS.enumerate_path(9223372036854775810, "abc"),
            "/creditors/9223372036854775810/enumerate?v=abc"
        );
        assert_eq!(DEBTORS.reserve_forward_path(7), "/debtors/7/reserve");
        assert_eq!(CREDITORS.invalid_path(), "/creditors/.invalid-path");
        assert_eq!(CREDITORS.reserve_path(), Some("/creditors/.creditor-reserve"));
        assert_eq!(DEBTORS.reserve_path(), Some("/debtors/.debtor-reserve"));
        assert_eq!(Mode::Accounts.reserve_path(), None);
    }

    #[test]
    fn reservation_metadata() {
        assert_eq!(
            CREDITORS.reservation_type(),
            Some("CreditorReservationRequest")
        );
        assert_eq!(DEBTORS.reservation_type(), Some("DebtorReservationRequest"));
        assert_eq!(CREDITORS.id_interval(), Some((1, 100)));
        assert_eq!(Mode::Accounts.id_interval(), None);
    }
}
