//! Display formatting for effect listings.
//!
//! Remaining durations, stack counts and modifier values all go through this
//! module so that handler views and the validate tool print the same way.

/// Format a remaining duration for effect listings.
///
/// - Values >= 60s: `M:SS`
/// - Values >= 10s: whole seconds with `s` suffix
/// - Values < 10s: one decimal place with `s` suffix
/// - Values <= 0: `"expired"`
///
/// # Examples
/// ```
/// use boons_types::formatting::format_remaining;
/// assert_eq!(format_remaining(75.3), "1:15");
/// assert_eq!(format_remaining(15.7), "16s");
/// assert_eq!(format_remaining(3.5), "3.5s");
/// assert_eq!(format_remaining(0.0), "expired");
/// ```
pub fn format_remaining(secs: f64) -> String {
    if secs <= 0.0 {
        return "expired".to_string();
    }
    if secs >= 60.0 {
        format_duration(secs.floor() as i64)
    } else if secs >= 10.0 {
        format!("{:.0}s", secs)
    } else {
        format!("{:.1}s", secs)
    }
}

/// Format whole seconds as `M:SS`.
///
/// # Examples
/// ```
/// use boons_types::formatting::format_duration;
/// assert_eq!(format_duration(125), "2:05");
/// assert_eq!(format_duration(59), "0:59");
/// assert_eq!(format_duration(0), "0:00");
/// ```
pub fn format_duration(secs: i64) -> String {
    let mins = secs / 60;
    let secs = secs % 60;
    format!("{}:{:02}", mins, secs)
}

/// Format an optional remaining duration, where `None` means permanent.
///
/// # Examples
/// ```
/// use boons_types::formatting::format_lifetime;
/// assert_eq!(format_lifetime(None), "permanent");
/// assert_eq!(format_lifetime(Some(4.3)), "4.3s");
/// ```
pub fn format_lifetime(remaining: Option<f64>) -> String {
    match remaining {
        Some(secs) => format_remaining(secs),
        None => "permanent".to_string(),
    }
}

/// Format a stack count, omitting it for single-stack effects.
///
/// # Examples
/// ```
/// use boons_types::formatting::format_stacks;
/// assert_eq!(format_stacks(1), "");
/// assert_eq!(format_stacks(3), "x3");
/// ```
pub fn format_stacks(stacks: i32) -> String {
    if stacks > 1 {
        format!("x{}", stacks)
    } else {
        String::new()
    }
}

/// Format a modifier contribution with an explicit sign, trimming a zero
/// fractional part.
///
/// # Examples
/// ```
/// use boons_types::formatting::format_signed;
/// assert_eq!(format_signed(10.0), "+10");
/// assert_eq!(format_signed(-2.5), "-2.50");
/// assert_eq!(format_signed(0.0), "+0");
/// ```
pub fn format_signed(n: f64) -> String {
    let body = if n.fract() == 0.0 {
        format!("{:.0}", n.abs())
    } else {
        format!("{:.2}", n.abs())
    };
    if n < 0.0 {
        format!("-{}", body)
    } else {
        format!("+{}", body)
    }
}
