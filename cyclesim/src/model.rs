/// A clocked design the driver steps through, one cycle at a time.
pub trait ClockedModel {
    /// Drives the clock input.
    fn set_clock(&mut self, high: bool);

    /// Settles the design for its current inputs.
    fn eval(&mut self);

    /// True once the design asked to end the simulation.
    fn finished(&self) -> bool {
        false
    }

    /// Runs once after the last cycle.
    fn finalize(&mut self) {}
}

/// Free-running counter that increments on every rising clock edge.
#[derive(Debug, Default)]
pub struct CounterModel {
    clk: bool,
    last_clk: bool,
    count: u64,
    finish_at: Option<u64>,
    finalized: bool,
}

impl CounterModel {
    /// `finish_at == 0` never finishes.
    pub fn new(finish_at: u64) -> Self {
        Self {
            finish_at: (finish_at > 0).then_some(finish_at),
            ..Default::default()
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl ClockedModel for CounterModel {
    fn set_clock(&mut self, high: bool) {
        self.clk = high;
    }

    fn eval(&mut self) {
        if self.clk && !self.last_clk {
            self.count += 1;
        }
        self.last_clk = self.clk;
    }

    fn finished(&self) -> bool {
        self.finish_at.is_some_and(|n| self.count >= n)
    }

    fn finalize(&mut self) {
        self.finalized = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_rising_edges_once() {
        let mut m = CounterModel::new(2);
        m.eval();
        m.set_clock(true);
        m.eval();
        m.eval();
        assert_eq!(m.count(), 1);
        assert!(!m.finished());
        m.set_clock(false);
        m.eval();
        m.set_clock(true);
        m.eval();
        assert_eq!(m.count(), 2);
        assert!(m.finished());
    }

    #[test]
    fn test_zero_never_finishes() {
        let mut m = CounterModel::new(0);
        for _ in 0..10 {
            m.set_clock(true);
            m.eval();
            m.set_clock(false);
            m.eval();
        }
        assert_eq!(m.count(), 10);
        assert!(!m.finished());
    }
}
