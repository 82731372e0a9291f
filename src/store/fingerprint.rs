//! Deterministic fingerprints for unique inserts.

use std::hash::{DefaultHasher, Hash, Hasher};

use crate::job::{NewJob, UniqueOpts};

/// Compute the 64-bit uniqueness fingerprint for a changeset.
///
/// Hashes the worker and queue, the full args document when
/// `include_args` is set, and the selected meta keys in sorted order.
/// `serde_json::Value` objects serialize with sorted keys, so equal
/// documents hash equally regardless of construction order.
pub fn fingerprint(new: &NewJob, opts: &UniqueOpts) -> i64 {
    let mut hasher = DefaultHasher::new();

    new.worker.hash(&mut hasher);
    new.queue.hash(&mut hasher);

    if opts.include_args {
        new.args.to_string().hash(&mut hasher);
    }

    let mut keys: Vec<&String> = opts.meta_keys.iter().collect();
    keys.sort();

    for key in keys {
        key.hash(&mut hasher);
        if let Some(value) = new.meta.get(key) {
            value.to_string().hash(&mut hasher);
        }
    }

    hasher.finish() as i64
}
