use chrono::Utc;

/// Seconds since the Unix epoch, used to stamp inode times.
pub fn unixtime() -> i64 {
  Utc::now().timestamp()
}

// vim:ts=2 sw=2
