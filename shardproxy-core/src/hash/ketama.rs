//! The ketama-style continuum (§4.E): a sorted array of `(hash, backend
//! index)` points, 160 points per weight unit by default, rebuilt whenever
//! pool membership changes.

use super::functions::md5_digest;
use super::{Distribution, HashFn};

pub const POINTS_PER_WEIGHT: u32 = 160;
/// twemproxy/libketama generate points four-at-a-time from one MD5 digest.
const POINTS_PER_HASH: u32 = 4;

#[derive(Debug, Clone, Copy)]
pub struct ContinuumPoint {
    pub hash: u32,
    pub backend_index: usize,
}

/// One member of the continuum: an address-shaped label plus a weight, used
/// only to build points — the continuum itself only stores indices back into
/// the caller's own backend list so there's a single source of truth for
/// backend state (see `pool::ServerPool`).
#[derive(Debug, Clone)]
pub struct WeightedMember {
    pub label: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Continuum {
    points: Vec<ContinuumPoint>,
    total_weight: u32,
}

impl Continuum {
    pub fn build(members: &[WeightedMember], distribution: Distribution, hash_fn: HashFn) -> Continuum {
        match distribution {
            Distribution::Ketama => Self::build_ketama(members),
            Distribution::Modula | Distribution::Random => {
                let total_weight = members.iter().map(|m| m.weight.max(1)).sum();
                let _ = hash_fn; // modula/random hash the key directly at lookup time
                Continuum {
                    points: Vec::new(),
                    total_weight,
                }
            }
        }
    }

    fn build_ketama(members: &[WeightedMember]) -> Continuum {
        let total_weight: u32 = members.iter().map(|m| m.weight.max(1)).sum();
        let mut points = Vec::new();
        for (index, member) in members.iter().enumerate() {
            let weight = member.weight.max(1);
            // Number of 4-point groups for this member, proportional to its
            // share of total weight, matching libketama's
            // `pct * POINTS_PER_WEIGHT * count / 4` point budget.
            let groups = ((weight as u64) * (POINTS_PER_WEIGHT as u64) / (POINTS_PER_HASH as u64))
                .max(1) as u32;
            for k in 0..groups {
                let digest_input = format!("{}-{}", member.label, k);
                let digest = md5_digest(digest_input.as_bytes());
                for p in 0..POINTS_PER_HASH as usize {
                    let hash = u32::from_le_bytes([
                        digest[p * 4],
                        digest[p * 4 + 1],
                        digest[p * 4 + 2],
                        digest[p * 4 + 3],
                    ]);
                    points.push(ContinuumPoint {
                        hash,
                        backend_index: index,
                    });
                }
            }
        }
        points.sort_by(|a, b| a.hash.cmp(&b.hash).then(a.backend_index.cmp(&b.backend_index)));
        Continuum {
            points,
            total_weight,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.total_weight == 0
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Finds the backend index for `hash` by locating the first point whose
    /// hash is >= the key's hash, wrapping to the first point (ring
    /// semantics) when `hash` is past every point. Ties on equal hash are
    /// broken by the lowest backend index (§4.E) via the stable sort above.
    pub fn lookup(&self, hash: u32) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|p| p.hash < hash);
        let idx = if idx == self.points.len() { 0 } else { idx };
        Some(self.points[idx].backend_index)
    }

    pub fn lookup_modula(&self, hash: u32, backend_count: usize) -> Option<usize> {
        if backend_count == 0 {
            return None;
        }
        Some(hash as usize % backend_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members() -> Vec<WeightedMember> {
        vec![
            WeightedMember {
                label: "10.0.0.1:6379".into(),
                weight: 1,
            },
            WeightedMember {
                label: "10.0.0.2:6379".into(),
                weight: 1,
            },
        ]
    }

    #[test]
    fn ketama_lookup_is_deterministic() {
        let c = Continuum::build(&members(), Distribution::Ketama, HashFn::Md5);
        let h = HashFn::Md5.hash(b"key_1");
        assert_eq!(c.lookup(h), c.lookup(h));
    }

    #[test]
    fn ketama_has_expected_point_count_for_equal_weight() {
        let c = Continuum::build(&members(), Distribution::Ketama, HashFn::Md5);
        // 2 members * 160 points each
        assert_eq!(c.len(), 320);
    }

    #[test]
    fn ketama_distributes_across_both_backends() {
        let c = Continuum::build(&members(), Distribution::Ketama, HashFn::Md5);
        let mut seen = [false, false];
        for i in 0..2000u32 {
            let key = format!("key_{i}");
            let h = HashFn::Md5.hash(key.as_bytes());
            if let Some(idx) = c.lookup(h) {
                seen[idx] = true;
            }
        }
        assert!(seen[0] && seen[1], "expected keys routed to both backends");
    }

    #[test]
    fn ketama_lookup_wraps_past_last_point() {
        let c = Continuum::build(&members(), Distribution::Ketama, HashFn::Md5);
        let max_point = c.points.last().unwrap().hash;
        let first_point_backend = c.points[0].backend_index;
        assert_eq!(c.lookup(max_point.wrapping_add(1)), Some(first_point_backend));
    }

    #[test]
    fn modula_lookup_wraps_on_backend_count() {
        let c = Continuum::build(&members(), Distribution::Modula, HashFn::Crc32);
        assert_eq!(c.lookup_modula(5, 2), Some(1));
        assert_eq!(c.lookup_modula(4, 2), Some(0));
    }
}
