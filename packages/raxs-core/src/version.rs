/// Version number of a committed tree. Negative values are sentinels.
pub type Version = i64;

/// The store is empty and has never been committed to.
pub const NO_VERSION: Version = -1;
/// Shorthand for whatever version is current when the call is made.
pub const CURRENT_VERSION: Version = -2;
/// Version of the first committed (or imported) tree.
pub const FIRST_VERSION: Version = 1;
/// Upper bound for the history probe.
pub const MAX_VERSION: Version = 1 << 20;

/// Read-only view of the versions a store can recall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionHistory {
    current: Version,
    oldest: Version,
}

impl VersionHistory {
    pub fn new(current: Version, oldest: Version) -> Self {
        Self { current, oldest }
    }

    pub fn empty() -> Self {
        Self {
            current: NO_VERSION,
            oldest: NO_VERSION,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current == NO_VERSION
    }

    pub fn current_version(&self) -> Version {
        self.current
    }

    pub fn oldest_version(&self) -> Version {
        self.oldest
    }

    pub fn contains(&self, version: Version) -> bool {
        !self.is_empty() && version >= self.oldest && version <= self.current
    }

    /// Every recallable version, oldest first.
    pub fn list_versions(&self) -> Vec<Version> {
        if self.is_empty() {
            return Vec::new();
        }
        (self.oldest..=self.current).collect()
    }

    /// Closest older version that differs from `version`, or `NO_VERSION`.
    pub fn previous_version(&self, version: Version) -> Version {
        let version = if version == CURRENT_VERSION {
            self.current
        } else {
            version
        };
        let mut candidate = version - 1;
        while candidate >= self.oldest && self.versions_equal(candidate, version) {
            candidate -= 1;
        }
        if candidate < self.oldest || self.is_empty() {
            NO_VERSION
        } else {
            candidate
        }
    }

    /// Two version numbers denote the same tree. Each commit produces a new
    /// tree, so only identical real versions compare equal.
    pub fn versions_equal(&self, a: Version, b: Version) -> bool {
        let resolve = |v: Version| if v == CURRENT_VERSION { self.current } else { v };
        let (a, b) = (resolve(a), resolve(b));
        a != NO_VERSION && a == b
    }
}
