use std::time::Duration;

/// Repeats the same delay forever. Bound it with `take` when needed.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    interval: Duration,
}

impl Interval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_interval() {
        let mut interval = Interval::new(Duration::from_millis(50));
        assert_eq!(interval.next(), Some(Duration::from_millis(50)));
        assert_eq!(interval.next(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn bounded_by_take() {
        let delays: Vec<_> = Interval::from_millis(5).take(2).collect();
        assert_eq!(delays, vec![Duration::from_millis(5); 2]);
    }
}
