/// A partition of the meter-id space owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub index: u32,
    pub count: u32,
}

impl Shard {
    /// The single shard covering every meter.
    pub const ALL: Shard = Shard { index: 0, count: 1 };

    pub fn new(index: u32, count: u32) -> Option<Self> {
        (count > 0 && index < count).then_some(Self { index, count })
    }

    pub fn owns(&self, meter_id: &str) -> bool {
        shard_of(meter_id, self.count) == self.index
    }

    /// Cursor checkpoint key. Changes when the shard count does.
    pub fn worker_name(&self) -> String {
        format!("shard-{}-of-{}", self.index, self.count)
    }
}

/// Stable shard for `meter_id`: first 8 bytes of its blake3 hash, modulo `count`.
pub fn shard_of(meter_id: &str, count: u32) -> u32 {
    let hash = blake3::hash(meter_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(prefix) % u64::from(count.max(1))) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_meter_has_exactly_one_owner() {
        let shards: Vec<Shard> = (0..4).filter_map(|i| Shard::new(i, 4)).collect();
        for n in 0..200 {
            let meter_id = format!("MTR-{n:05}");
            let owners = shards.iter().filter(|s| s.owns(&meter_id)).count();
            assert_eq!(owners, 1, "{meter_id}");
        }
    }

    #[test]
    fn assignment_is_stable_and_spreads_meters() {
        assert_eq!(shard_of("NIGHT-001", 8), shard_of("NIGHT-001", 8));

        let mut used = [false; 4];
        for n in 0..200 {
            used[shard_of(&format!("MTR-{n:05}"), 4) as usize] = true;
        }
        assert!(used.iter().all(|u| *u));
    }

    #[test]
    fn invalid_shards_are_refused() {
        assert_eq!(Shard::new(2, 2), None);
        assert_eq!(Shard::new(0, 0), None);
        assert_eq!(Shard::new(0, 1), Some(Shard::ALL));
        assert!(Shard::ALL.owns("anything"));
        assert_eq!(Shard::ALL.worker_name(), "shard-0-of-1");
    }
}
