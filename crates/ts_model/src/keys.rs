//! Cache and lock identifiers. Every call site constructs an ID through one
//! of these functions rather than formatting the string inline, so the
//! format is changed in exactly one place if it ever needs to.

const SEP: &str = "__";
const LOCK_PREFIX: &str = "lock__";

/// `type__collection[__identifier][__start__end]`.
///
/// `identifier` and the `(start, end)` pair are independently optional: the
/// value-type reconciler's metadata key omits both (`type__metadata`), the
/// measurement upserter's key omits the time range
/// (`type__measurements__identifier`), and a bucket key supplies all three.
pub fn cache_id(
    data_type: &str,
    collection: &str,
    identifier: Option<&str>,
    range: Option<(i64, i64)>,
) -> String {
    let mut id = format!("{data_type}{SEP}{collection}");
    if let Some(identifier) = identifier {
        id.push_str(SEP);
        id.push_str(identifier);
    }
    if let Some((start, end)) = range {
        id.push_str(SEP);
        id.push_str(&start.to_string());
        id.push_str(SEP);
        id.push_str(&end.to_string());
    }
    id
}

/// The lock key guarding mutation of whatever `cache_id` names.
pub fn lock_id(cache_id: &str) -> String {
    format!("{LOCK_PREFIX}{cache_id}")
}

/// Cache/lock ID for a data bucket: `type__data__identifier__start__end`.
pub fn data_bucket_id(data_type: &str, identifier: &str, start: i64, end: i64) -> String {
    cache_id(data_type, "data", Some(identifier), Some((start, end)))
}

/// Cache/lock ID for an event bucket: `type__event__start__end`.
pub fn event_bucket_id(data_type: &str, start: i64, end: i64) -> String {
    cache_id(data_type, "event", None, Some((start, end)))
}

/// Cache/lock ID for the active-measurement record: `type__measurements__identifier`.
pub fn measurement_id(data_type: &str, identifier: &str) -> String {
    cache_id(data_type, "measurements", Some(identifier), None)
}

/// Cache/lock ID for a single value-type's metadata entry:
/// `type__metadata__value_type`.
pub fn value_type_id(data_type: &str, value_type: &str) -> String {
    cache_id(data_type, "metadata", Some(value_type), None)
}

/// Cache/lock ID for the singleton metadata document: `type__metadata`.
pub fn metadata_id(data_type: &str) -> String {
    cache_id(data_type, "metadata", None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_id_shape() {
        assert_eq!(
            data_bucket_id("cpu", "host-1", 0, 3600),
            "cpu__data__host-1__0__3600"
        );
    }

    #[test]
    fn event_bucket_id_shape() {
        assert_eq!(event_bucket_id("cpu", 0, 86_400), "cpu__event__0__86400");
    }

    #[test]
    fn measurement_id_shape() {
        assert_eq!(
            measurement_id("cpu", "host-1"),
            "cpu__measurements__host-1"
        );
    }

    #[test]
    fn value_type_id_shape() {
        assert_eq!(value_type_id("cpu", "usage_idle"), "cpu__metadata__usage_idle");
    }

    #[test]
    fn lock_id_prefixes_cache_id() {
        let id = data_bucket_id("cpu", "host-1", 0, 3600);
        assert_eq!(lock_id(&id), format!("lock__{id}"));
    }
}
