use std::thread;
use std::time::{Duration, SystemTime};

/// Read the time since the Unix epoch in nanoseconds. Returns 0 if the system-reported time is
/// somehow before the Unix epoch.
#[must_use]
pub fn current_time_nanos() -> u128 {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_nanos()
}

/// Sleep until at least the specified time, then return the current time in nanoseconds.
///
/// Sleeps until 1ms before the target and busy-waits the remainder, because `thread::sleep()`
/// only guarantees a minimum sleep duration and commonly overshoots.
#[inline]
#[allow(clippy::must_use_candidate)]
pub fn sleep_until(time_nanos: u128) -> u128 {
    loop {
        let now = current_time_nanos();
        if now >= time_nanos {
            return now;
        }

        let duration = Duration::from_nanos((time_nanos - now) as u64);
        if duration > Duration::from_millis(1) {
            thread::sleep(duration - Duration::from_millis(1));
        }
    }
}
