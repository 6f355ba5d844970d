use chrono::Utc;

/// Current wall-clock time as UTC milliseconds since epoch.
///
/// All persisted timestamps in the gateway use this representation.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
