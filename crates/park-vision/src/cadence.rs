/// Runs ML inference on every `every_n`-th frame: 1st, (n+1)th, (2n+1)th...
#[derive(Debug, Clone)]
pub struct InferenceCadence {
    every_n: u32,
    frame_counter: u64,
    invocations: u64,
}

impl InferenceCadence {
    pub fn new(every_n: u32) -> Self {
        Self { every_n: every_n.max(1), frame_counter: 0, invocations: 0 }
    }

    pub fn every_n(&self) -> u32 {
        self.every_n
    }

    /// A changed interval restarts the cadence so the next frame infers.
    pub fn set_every_n(&mut self, every_n: u32) {
        let every_n = every_n.max(1);
        if every_n != self.every_n {
            self.every_n = every_n;
            self.frame_counter = 0;
        }
    }

    pub fn tick_should_infer(&mut self) -> bool {
        let due = self.frame_counter % u64::from(self.every_n) == 0;
        self.frame_counter += 1;
        if due {
            self.invocations += 1;
        }
        due
    }

    pub fn reset(&mut self) {
        self.frame_counter = 0;
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invokes_ceil_m_over_k_times() {
        for k in 1..=8u32 {
            for m in 0..=30u64 {
                let mut c = InferenceCadence::new(k);
                let calls = (0..m).filter(|_| c.tick_should_infer()).count() as u64;
                assert_eq!(calls, m.div_ceil(u64::from(k)), "k={k} m={m}");
            }
        }
    }

    #[test]
    fn first_frame_always_infers() {
        let mut c = InferenceCadence::new(5);
        assert!(c.tick_should_infer());
        assert!(!c.tick_should_infer());
    }

    #[test]
    fn changing_interval_restarts() {
        let mut c = InferenceCadence::new(3);
        c.tick_should_infer();
        c.tick_should_infer();
        c.set_every_n(2);
        assert!(c.tick_should_infer());
        assert!(!c.tick_should_infer());
        assert!(c.tick_should_infer());

        // same value keeps the phase
        c.set_every_n(2);
        assert!(!c.tick_should_infer());
    }

    #[test]
    fn zero_is_treated_as_every_frame() {
        let mut c = InferenceCadence::new(0);
        assert!((0..4).all(|_| c.tick_should_infer()));
        assert_eq!(c.invocations(), 4);
    }
}
