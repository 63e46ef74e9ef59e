use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic seconds elapsed since an arbitrary process-local epoch.
pub fn wall_clock() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = wall_clock();
        let b = wall_clock();
        assert!(b >= a);
    }
}
