use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix nanoseconds.
pub fn now_ns() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(_) => 0,
    }
}

/// Current wall-clock time as unix milliseconds.
pub fn now_ms() -> i64 {
    now_ns() / 1_000_000
}
