//! Persisted request list checkpoint

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Resumption checkpoint of a request list.
///
/// The `in_progress` map uses `true` values rather than a bare set so
/// the JSON layout stays `{ "uniqueKey": true }`, which is what older
/// checkpoints contain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestListState {
    /// Position of the next fresh request.
    pub next_index: usize,
    /// Unique key expected at `next_index`, used to detect source
    /// drift on restore. `None` once the list was fully consumed.
    pub next_unique_key: Option<String>,
    /// Unique keys that were delivered but not yet resolved when the
    /// checkpoint was taken.
    pub in_progress: HashMap<String, bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_layout_is_stable() {
        let mut state = RequestListState {
            next_index: 2,
            next_unique_key: Some("http://example.com/c".to_string()),
            in_progress: HashMap::new(),
        };
        state
            .in_progress
            .insert("http://example.com/a".to_string(), true);

        let json = serde_json::to_value(&state).expect("serializes");
        assert_eq!(json["nextIndex"], 2);
        assert_eq!(json["nextUniqueKey"], "http://example.com/c");
        assert_eq!(json["inProgress"]["http://example.com/a"], true);

        let back: RequestListState = serde_json::from_value(json).expect("deserializes");
        assert_eq!(back, state);
    }
}
