//! Seeded generator for injected yields.

/// xorshift64*. A zero seed is remapped so the generator never sticks.
#[derive(Debug, Clone)]
pub struct XorShift {
    state: u64,
}

impl XorShift {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform in `0..bound`; `bound` 0 yields 0.
    pub fn below(&mut self, bound: u64) -> u64 {
        if bound == 0 { 0 } else { self.next_u64() % bound }
    }

    /// Derive an independent stream, one per green thread.
    pub fn fork(&mut self) -> Self {
        Self::new(self.next_u64())
    }

    /// `N` yield counts, each in `0..=max`.
    pub fn yields<const N: usize>(&mut self, max: u32) -> [u32; N] {
        std::array::from_fn(|_| self.below(u64::from(max) + 1) as u32)
    }
}
