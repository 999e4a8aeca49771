pub(crate) mod error;
pub(crate) mod time;

/// Returns the default number of shards for the cache's hash table, based on
/// the number of available CPU cores. The returned value is always a power of
/// two.
pub(crate) fn default_num_shards() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores * 4).clamp(4, 64).next_power_of_two()
}

#[cfg(test)]
mod tests {
    #[test]
    fn default_num_shards_is_power_of_two() {
        let n = super::default_num_shards();
        assert!(n.is_power_of_two());
        assert!((4..=64).contains(&n));
    }
}
