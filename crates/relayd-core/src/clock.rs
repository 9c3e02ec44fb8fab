//! Millisecond monotonic clock
//!
//! All runtime timekeeping (load periods, dispatch timing histograms) uses
//! `CLOCK_MONOTONIC` so wall-clock adjustments never move time backwards.
//! Successive calls on the same thread are non-decreasing.

/// Current monotonic time in milliseconds.
#[inline]
pub fn now_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nondecreasing() {
        let mut prev = now_ms();
        for _ in 0..1000 {
            let now = now_ms();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn test_advances() {
        let start = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let end = now_ms();
        // Coarse bound: sleep may overshoot but never undershoots.
        assert!(end - start >= 20, "clock advanced only {} ms", end - start);
    }
}
