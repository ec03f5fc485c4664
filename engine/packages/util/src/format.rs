use std::time::Duration;

/// Formats a RAM quantity in MB the way operators read it (`4096 MB` -> `4.0 GB`).
pub fn ram(mb: u64) -> String {
	if mb >= 1024 {
		format!("{:.1} GB", mb as f64 / 1024.0)
	} else {
		format!("{mb} MB")
	}
}

pub fn duration(d: Duration) -> String {
	let secs = d.as_secs();
	if secs >= 3600 {
		format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
	} else if secs >= 60 {
		format!("{}m{}s", secs / 60, secs % 60)
	} else {
		format!("{secs}s")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ram_uses_gb_above_one_gig() {
		assert_eq!(ram(512), "512 MB");
		assert_eq!(ram(4096), "4.0 GB");
		assert_eq!(ram(1536), "1.5 GB");
	}

	#[test]
	fn duration_buckets() {
		assert_eq!(duration(Duration::from_secs(42)), "42s");
		assert_eq!(duration(Duration::from_secs(150)), "2m30s");
		assert_eq!(duration(Duration::from_secs(7260)), "2h1m");
	}
}
