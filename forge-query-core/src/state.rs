use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// Bounds every cached value satisfies: shareable across tasks and serializable
/// for size accounting and persistence.
pub trait QueryData: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> QueryData for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Data lifecycle of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

/// Whether a fetch is currently in flight, orthogonal to [`QueryStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Idle,
    Fetching,
    Paused,
}

/// Snapshot of one query's state.
///
/// `data` and `error` are retained independently: a success clears the error, a
/// failed refetch keeps the previous data next to the new error.
///
/// Errors are not persisted; a restored state always has `error: None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub data_updated_at: u64,
    #[serde(skip)]
    pub error: Option<QueryError>,
    pub error_updated_at: u64,
    pub failure_count: u32,
    #[serde(skip)]
    pub failure_reason: Option<QueryError>,
    pub fetch_status: FetchStatus,
    pub is_invalidated: bool,
    pub status: QueryStatus,
}

impl<T> QueryState<T> {
    /// Initial state of a record without seed data.
    pub fn idle() -> Self {
        Self {
            data: None,
            data_updated_at: 0,
            error: None,
            error_updated_at: 0,
            failure_count: 0,
            failure_reason: None,
            fetch_status: FetchStatus::Idle,
            is_invalidated: false,
            status: QueryStatus::Idle,
        }
    }

    /// Initial state of a record seeded with data.
    pub fn seeded(data: T, updated_at: u64) -> Self {
        Self {
            data: Some(data),
            data_updated_at: updated_at,
            status: QueryStatus::Success,
            ..Self::idle()
        }
    }

    /// First load in progress: no data yet and a fetch running.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading && self.fetch_status == FetchStatus::Fetching
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_state_is_success() {
        let state = QueryState::seeded(5, 1_000);
        assert!(state.is_success());
        assert!(!state.is_fetching());
        assert_eq!(state.data, Some(5));
        assert_eq!(state.data_updated_at, 1_000);
    }

    #[test]
    fn test_loading_needs_fetch_in_flight() {
        let mut state: QueryState<u8> = QueryState::idle();
        state.status = QueryStatus::Loading;
        assert!(!state.is_loading());
        state.fetch_status = FetchStatus::Fetching;
        assert!(state.is_loading());
    }

    #[test]
    fn test_errors_are_not_serialized() {
        let mut state = QueryState::seeded("x".to_string(), 7);
        state.error = Some(QueryError::Cancelled);
        let json = serde_json::to_string(&state).unwrap();
        assert!(!json.contains("error\":"));
        let back: QueryState<String> = serde_json::from_str(&json).unwrap();
        assert!(back.error.is_none());
        assert_eq!(back.status, QueryStatus::Success);
    }
}
