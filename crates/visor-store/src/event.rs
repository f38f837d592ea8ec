//! Change events and the glob language used to subscribe to them.

/// A single change observed in the store.
///
/// Every write produces one event per touched path, all stamped with the
/// revision the write committed at. Deletions carry no body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// Absolute path of the entry that changed.
    pub path: String,
    /// New value, or `None` if the entry was deleted.
    pub body: Option<Vec<u8>>,
    /// Revision the change committed at.
    pub rev: i64,
}

impl StoreEvent {
    /// True if this event set a value (as opposed to deleting one).
    pub fn is_set(&self) -> bool {
        self.body.is_some()
    }
}

/// Match a slash-delimited path against a glob pattern.
///
/// `*` matches exactly one path segment; there is no multi-segment
/// wildcard. Both operands must be absolute.
pub fn glob_matches(glob: &str, path: &str) -> bool {
    let pattern: Vec<&str> = glob.split('/').collect();
    let segments: Vec<&str> = path.split('/').collect();
    if pattern.len() != segments.len() {
        return false;
    }
    pattern
        .iter()
        .zip(segments.iter())
        .all(|(p, s)| *p == "*" || p == s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_literal_match() {
        assert!(glob_matches("/apps/dog/attrs", "/apps/dog/attrs"));
        assert!(!glob_matches("/apps/dog/attrs", "/apps/cat/attrs"));
    }

    #[test]
    fn glob_star_is_single_segment() {
        assert!(glob_matches("/apps/*/attrs", "/apps/dog/attrs"));
        assert!(!glob_matches("/apps/*", "/apps/dog/attrs"));
        assert!(!glob_matches("/apps/*/attrs", "/apps/attrs"));
    }

    #[test]
    fn glob_instance_registration_pattern() {
        let glob = "/apps/*/revs/*/procs/*/instances/*/registered";
        assert!(glob_matches(
            glob,
            "/apps/cat/revs/7abcde6/procs/web/instances/localhost-9000/registered"
        ));
        assert!(!glob_matches(
            glob,
            "/apps/cat/revs/7abcde6/procs/web/instances/localhost-9000/state"
        ));
    }

    #[test]
    fn event_set_and_delete() {
        let set = StoreEvent {
            path: "/k".into(),
            body: Some(b"v".to_vec()),
            rev: 3,
        };
        let del = StoreEvent {
            path: "/k".into(),
            body: None,
            rev: 4,
        };
        assert!(set.is_set());
        assert!(!del.is_set());
    }
}
