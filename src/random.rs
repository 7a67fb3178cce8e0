//! Park-Miller minimal standard generator. Every story-visible random draw builds a fresh
//! generator from `story_seed + previous_random` and takes one value, so replaying a saved state
//! reproduces the same draws.

const MODULUS: i64 = 2_147_483_647;
const MULTIPLIER: i64 = 16_807;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prng {
    seed: i64,
}

impl Prng {
    pub fn new(seed: i64) -> Self {
        let mut seed = seed % MODULUS;
        if seed <= 0 {
            seed += MODULUS - 1;
        }
        Self { seed }
    }

    /// Next value in `1..2147483647`.
    pub fn next_int(&mut self) -> i64 {
        self.seed = self.seed * MULTIPLIER % MODULUS;
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_sequence() {
        let mut rng = Prng::new(1);
        assert_eq!(rng.next_int(), 16_807);
        assert_eq!(rng.next_int(), 282_475_249);
        assert_eq!(rng.next_int(), 1_622_650_073);
    }

    #[test]
    fn same_seed_same_draws() {
        let a: Vec<i64> = {
            let mut rng = Prng::new(42);
            (0..5).map(|_| rng.next_int()).collect()
        };
        let b: Vec<i64> = {
            let mut rng = Prng::new(42);
            (0..5).map(|_| rng.next_int()).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn non_positive_seeds_are_shifted() {
        assert_eq!(Prng::new(0), Prng::new(MODULUS - 1));
        assert!(Prng::new(-5).next_int() > 0);
    }
}
