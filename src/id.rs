//! Run identity: time-ordered ids, short display prefixes, prefix lookup.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ExprecError, Result};

/// Short ids are never shorter than this.
pub const MIN_PREFIX_LEN: usize = 7;

static LAST_ID: Mutex<Option<Uuid>> = parking_lot::const_mutex(None);

/// A UUIDv7: 48 bits of unix milliseconds followed by random bits, so the
/// hyphenated string sorts in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a fresh id, strictly greater than every id generated
    /// earlier in this process.
    pub fn generate() -> Self {
        let mut last = LAST_ID.lock();
        let mut id = Uuid::now_v7();
        if let Some(prev) = *last {
            if id <= prev {
                // Same millisecond and the random tail came out lower: step
                // past the previous id. Only the low random bits change.
                id = Uuid::from_u128(prev.as_u128() + 1);
            }
        }
        *last = Some(id);
        RunId(id)
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(RunId)
    }

    /// Creation time embedded in the id.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let (secs, nanos) = self.0.get_timestamp()?.to_unix();
        DateTime::from_timestamp(secs as i64, nanos)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Smallest length >= [`MIN_PREFIX_LEN`] at which every id truncates to a
/// distinct prefix.
///
/// # Panics
/// If `ids` contains the same id twice.
pub fn shortest_unique_prefix_len<S: AsRef<str>>(ids: &[S]) -> usize {
    match try_shortest_unique_prefix_len(ids) {
        Ok(len) => len,
        Err(e) => panic!("duplicate run id in id set: {e}"),
    }
}

/// Like [`shortest_unique_prefix_len`], reporting a duplicate as `Conflict`.
pub fn try_shortest_unique_prefix_len<S: AsRef<str>>(ids: &[S]) -> Result<usize> {
    let mut sorted: Vec<&str> = ids.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    let mut len = MIN_PREFIX_LEN;
    for pair in sorted.windows(2) {
        if pair[0] == pair[1] {
            return Err(ExprecError::Conflict(pair[0].to_string()));
        }
        len = len.max(common_prefix_len(pair[0], pair[1]) + 1);
    }
    Ok(len)
}

/// Maps every id to its short form under the current id set.
pub fn short_ids<S: AsRef<str>>(ids: &[S]) -> BTreeMap<String, String> {
    let len = shortest_unique_prefix_len(ids);
    ids.iter()
        .map(|id| (id.as_ref().to_string(), truncate(id.as_ref(), len)))
        .collect()
}

pub fn truncate(id: &str, len: usize) -> String {
    id.chars().take(len).collect()
}

/// Resolves `prefix` to a full id. If several ids share it, the earliest
/// created wins.
pub fn resolve_prefix<S: AsRef<str>>(ids: &[S], prefix: &str) -> Result<String> {
    if prefix.is_empty() {
        return Err(ExprecError::InvalidArgument("empty id prefix".into()));
    }
    let mut matches: Vec<&str> = ids.iter().map(AsRef::as_ref).filter(|id| id.starts_with(prefix)).collect();
    if let Some(exact) = matches.iter().find(|id| **id == prefix) {
        return Ok(exact.to_string());
    }
    matches.sort_by_key(|id| {
        let created = RunId::parse(id).and_then(|r| r.created_at());
        (created.is_none(), created, *id)
    });
    matches
        .first()
        .map(|id| id.to_string())
        .ok_or_else(|| ExprecError::not_found(format!("no run id starts with '{prefix}'")))
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_are_ordered_and_distinct() {
        let ids: Vec<RunId> = (0..2000).map(|_| RunId::generate()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].to_string() < pair[1].to_string());
        }
        let set: HashSet<_> = ids.iter().collect();
        assert_eq!(set.len(), ids.len());
    }

    #[test]
    fn created_at_is_recent() {
        let id = RunId::generate();
        let created = id.created_at().unwrap();
        let age = Utc::now() - created;
        assert!(age.num_seconds().abs() < 60);
    }

    #[test]
    fn prefix_floor_applies() {
        assert_eq!(shortest_unique_prefix_len::<&str>(&[]), MIN_PREFIX_LEN);
        assert_eq!(shortest_unique_prefix_len(&["abcdef0123"]), MIN_PREFIX_LEN);
        assert_eq!(shortest_unique_prefix_len(&["aaaaaaaaa1", "aaaaaaaaa2"]), 10);
        assert_eq!(shortest_unique_prefix_len(&["abc00000", "abd00000"]), MIN_PREFIX_LEN);
    }

    #[test]
    #[should_panic(expected = "duplicate run id")]
    fn duplicate_ids_panic() {
        shortest_unique_prefix_len(&["same-id-123", "same-id-123"]);
    }

    #[test]
    fn duplicate_ids_conflict() {
        let res = try_shortest_unique_prefix_len(&["same-id-123", "other", "same-id-123"]);
        assert!(matches!(res, Err(ExprecError::Conflict(id)) if id == "same-id-123"));
    }

    #[test]
    fn short_ids_are_distinct() {
        let ids: Vec<String> = (0..50).map(|_| RunId::generate().to_string()).collect();
        let shorts = short_ids(&ids);
        let distinct: HashSet<_> = shorts.values().collect();
        assert_eq!(distinct.len(), ids.len());
    }

    #[test]
    fn resolve_prefers_earliest() {
        let first = RunId::generate().to_string();
        let second = RunId::generate().to_string();
        let ids = vec![second.clone(), first.clone()];
        let common = common_prefix_len(&first, &second);
        let prefix = truncate(&first, common.max(1));
        assert_eq!(resolve_prefix(&ids, &prefix).unwrap(), first);
        assert_eq!(resolve_prefix(&ids, &second).unwrap(), second);
        assert!(matches!(resolve_prefix(&ids, "zzzz"), Err(ExprecError::NotFound(_))));
    }

    proptest! {
        #[test]
        fn prefix_len_is_minimal(ids in prop::collection::hash_set("[0-9a-f]{4,16}", 1..40)) {
            let ids: Vec<String> = ids.into_iter().collect();
            let len = shortest_unique_prefix_len(&ids);
            prop_assert!(len >= MIN_PREFIX_LEN);
            let at = |l: usize| ids.iter().map(|id| truncate(id, l)).collect::<HashSet<_>>().len();
            prop_assert_eq!(at(len), ids.len());
            if len > MIN_PREFIX_LEN {
                prop_assert!(at(len - 1) < ids.len());
            }
        }

        #[test]
        fn prefix_len_never_shrinks_as_ids_grow(ids in prop::collection::hash_set("[0-9a-f]{6,12}", 2..40)) {
            let ids: Vec<String> = ids.into_iter().collect();
            let mut prev = MIN_PREFIX_LEN;
            for n in 1..=ids.len() {
                let len = shortest_unique_prefix_len(&ids[..n]);
                prop_assert!(len >= prev);
                prev = len;
            }
        }
    }
}
