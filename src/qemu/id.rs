//! Allocation of unique QEMU option IDs.

use std::collections::HashMap;

/// Hands out unique IDs per textual prefix, used to name QEMU devices,
/// chardevs, drives and fsdevs without collisions.
///
/// Trailing digits are stripped from the requested prefix, so `pipe`,
/// `pipe0` and `pipe45` all draw from the same counter. Counters start at 0
/// and never skip. Only used during sequential pipeline evaluation; not
/// thread-safe by design.
#[derive(Debug, Default)]
pub struct IdAllocator {
    idx: HashMap<String, u32>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next available ID for the given prefix.
    pub fn id(&mut self, prefix: &str) -> String {
        let prefix = prefix.trim_end_matches(|c: char| c.is_ascii_digit());
        let idx = self.idx.entry(prefix.to_string()).or_insert(0);
        let id = format!("{prefix}{idx}");
        *idx += 1;
        id
    }
}
