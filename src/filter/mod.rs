use std::collections::HashSet;

/// Allow-list of internal hosts, built once at startup and read-only after.
///
/// An empty allow-list disables filtering entirely: the `INTERNAL_HOSTS`
/// setting is optional and its absence must not reject traffic.
#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    allow: HashSet<String>,
}

impl HostFilter {
    /// Builds a filter from the configured host list.
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow: hosts.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether events from `host_id` are eligible for aggregation.
    pub fn is_internal(&self, host_id: &str) -> bool {
        self.allow.is_empty() || self.allow.contains(host_id)
    }

    /// Number of configured hosts (0 means pass-through).
    pub fn len(&self) -> usize {
        self.allow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_allow_list_passes_everything() {
        let filter = HostFilter::default();
        assert!(filter.is_internal("anything.example"));
        assert!(filter.is_internal(""));
    }

    #[test]
    fn test_membership() {
        let filter = HostFilter::new(["dennikn.sk", "blog.dennikn.sk"]);
        assert!(filter.is_internal("dennikn.sk"));
        assert!(filter.is_internal("blog.dennikn.sk"));
        assert!(!filter.is_internal("evil.example"));
        assert!(!filter.is_internal(""));
    }

    #[test]
    fn test_exact_match_only() {
        let filter = HostFilter::new(["dennikn.sk"]);
        assert!(!filter.is_internal("sub.dennikn.sk"));
        assert!(!filter.is_internal("DENNIKN.SK"));
    }
}
