use chrono::{DateTime, Utc};

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
	Utc::now().timestamp_millis()
}

pub fn now() -> DateTime<Utc> {
	Utc::now()
}

/// Milliseconds elapsed since `ts`, floored at zero.
pub fn age_ms(ts: DateTime<Utc>) -> i64 {
	(Utc::now() - ts).num_milliseconds().max(0)
}

pub fn unix_seconds() -> i64 {
	Utc::now().timestamp()
}
