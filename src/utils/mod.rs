pub mod backoff;
pub mod checksum;
pub mod clock;
pub mod env_utils;
pub mod settings;

/// Renders a duration as `1d 2h 3m 4s`, for operator-facing messages.
pub fn secs_to_dhms(mut secs: u64) -> String {
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3_600;
    secs %= 3_600;
    let minutes = secs / 60;
    secs %= 60;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{}d ", days));
    }
    if hours > 0 || days > 0 {
        out.push_str(&format!("{}h ", hours));
    }
    if minutes > 0 || hours > 0 || days > 0 {
        out.push_str(&format!("{}m ", minutes));
    }
    out.push_str(&format!("{}s", secs));
    out
}
