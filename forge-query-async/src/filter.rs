use std::fmt;
use std::sync::Arc;

use forge_query_core::QueryKey;

use crate::record::QueryRecord;

type RecordPredicate<T> = Arc<dyn Fn(&QueryRecord<T>) -> bool + Send + Sync>;

/// Selects records for bulk operations.
///
/// Without a key every record matches. With a key, `exact` picks between exact
/// equality and structural prefix matching; when `exact` is unset each operation
/// applies its own default. A predicate narrows the selection further.
///
/// ```
/// use forge_query_async::QueryFilter;
/// use forge_query_core::query_key;
///
/// let users = QueryFilter::<u32>::key(query_key!["users"]);
/// let one_user = QueryFilter::<u32>::exact(query_key!["users", 1]);
/// # let _ = (users, one_user);
/// ```
pub struct QueryFilter<T> {
    pub key: Option<QueryKey>,
    pub exact: Option<bool>,
    pub predicate: Option<RecordPredicate<T>>,
}

impl<T> QueryFilter<T> {
    /// Matches every record.
    pub fn all() -> Self {
        Self {
            key: None,
            exact: None,
            predicate: None,
        }
    }

    pub fn key(key: impl Into<QueryKey>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::all()
        }
    }

    pub fn exact(key: impl Into<QueryKey>) -> Self {
        Self {
            key: Some(key.into()),
            exact: Some(true),
            predicate: None,
        }
    }

    pub fn with_exact(mut self, exact: bool) -> Self {
        self.exact = Some(exact);
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&QueryRecord<T>) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Key part of the match, with `default_exact` used when `exact` is unset.
    pub(crate) fn matches_key(&self, candidate: &QueryKey, default_exact: bool) -> bool {
        match &self.key {
            None => true,
            Some(key) if self.exact.unwrap_or(default_exact) => candidate.matches(key),
            Some(key) => candidate.starts_with(key),
        }
    }
}

impl<T: forge_query_core::QueryData> QueryFilter<T> {
    pub(crate) fn matches(&self, record: &QueryRecord<T>, default_exact: bool) -> bool {
        self.matches_key(record.key(), default_exact)
            && self.predicate.as_ref().map_or(true, |p| p(record))
    }
}

impl<T> Default for QueryFilter<T> {
    fn default() -> Self {
        Self::all()
    }
}

impl<T> Clone for QueryFilter<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            exact: self.exact,
            predicate: self.predicate.clone(),
        }
    }
}

impl<T> fmt::Debug for QueryFilter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilter")
            .field("key", &self.key)
            .field("exact", &self.exact)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl<T> From<QueryKey> for QueryFilter<T> {
    fn from(key: QueryKey) -> Self {
        Self::key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_query_core::query_key;

    #[test]
    fn test_no_key_matches_everything() {
        let filter = QueryFilter::<u8>::all();
        assert!(filter.matches_key(&query_key!["a"], true));
        assert!(filter.matches_key(&QueryKey::from("b"), false));
    }

    #[test]
    fn test_default_exactness_applies_when_unset() {
        let filter = QueryFilter::<u8>::key(query_key!["users"]);
        assert!(filter.matches_key(&query_key!["users", 1], false));
        assert!(!filter.matches_key(&query_key!["users", 1], true));
        assert!(filter.matches_key(&query_key!["users"], true));
    }

    #[test]
    fn test_explicit_exactness_wins() {
        let prefix = QueryFilter::<u8>::key(query_key!["users"]).with_exact(false);
        assert!(prefix.matches_key(&query_key!["users", 2], true));

        let exact = QueryFilter::<u8>::exact(query_key!["users"]);
        assert!(!exact.matches_key(&query_key!["users", 2], false));
    }

    #[test]
    fn test_prefix_is_structural() {
        let filter = QueryFilter::<u8>::key(query_key!["users"]);
        assert!(!filter.matches_key(&query_key!["usersX"], false));
        assert!(!filter.matches_key(&query_key!["posts"], false));
    }
}
