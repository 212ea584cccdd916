use chrono::NaiveDate;

/// Two-digit years below this become 20xx, the rest 19xx.
pub const DEFAULT_PIVOT_YEAR: u32 = 50;

/// Parse a money cell: strips `$`, `,`, quotes and whitespace; `(12.50)` and
/// trailing `-`/`CR` markers are negative.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let s = raw
        .replace([',', '"', '$', '£', '€'], "")
        .replace('\u{2212}', "-");
    let mut s = s.trim();
    if s.is_empty() || s == "-" {
        return None;
    }
    let mut negative = false;
    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        negative = true;
        s = inner.trim();
    }
    let upper = s.to_ascii_uppercase();
    if let Some(stripped) = upper.strip_suffix("CR") {
        negative = !negative;
        return finish(stripped.trim(), negative);
    }
    if let Some(stripped) = s.strip_suffix('-') {
        negative = !negative;
        return finish(stripped.trim(), negative);
    }
    finish(s, negative)
}

fn finish(s: &str, negative: bool) -> Option<f64> {
    let value: f64 = s.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

/// Round to cents.
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Expand a two-digit year around `pivot`.
pub fn expand_year(year: u32, pivot: u32) -> i32 {
    if year >= 100 {
        return year as i32;
    }
    if year < pivot {
        2000 + year as i32
    } else {
        1900 + year as i32
    }
}

/// Normalize a date cell to `YYYY-MM-DD`. Accepts ISO dates, `m/d/y` and
/// `m-d-y` (falling back to `d/m/y` when the first part cannot be a month),
/// and spelled-out forms like `Jan 15, 2024` or `15 Jan 2024`.
pub fn normalize_date(raw: &str, pivot: u32) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    // chrono's %Y takes one or two digits too, so `03-07-24` must not reach it.
    if has_four_digit_year_prefix(raw) {
        for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
            if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
                return Some(iso(d));
            }
        }
    }
    if let Some(d) = parse_numeric_date(raw, pivot) {
        return Some(iso(d));
    }
    for fmt in ["%b %d, %Y", "%B %d, %Y", "%d %b %Y", "%d %B %Y", "%b %d %Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(iso(d));
        }
    }
    None
}

fn has_four_digit_year_prefix(raw: &str) -> bool {
    let b = raw.as_bytes();
    b.len() > 4 && b[..4].iter().all(u8::is_ascii_digit) && !b[4].is_ascii_digit()
}

fn parse_numeric_date(raw: &str, pivot: u32) -> Option<NaiveDate> {
    let sep = if raw.contains('/') {
        '/'
    } else if raw.contains('-') {
        '-'
    } else if raw.contains('.') {
        '.'
    } else {
        return None;
    };
    let parts: Vec<&str> = raw.split(sep).collect();
    if parts.len() != 3 || parts[2].len() == 3 || parts[2].len() > 4 {
        return None;
    }
    let a: u32 = parts[0].parse().ok()?;
    let b: u32 = parts[1].parse().ok()?;
    let y: u32 = parts[2].parse().ok()?;
    let year = expand_year(y, pivot);
    NaiveDate::from_ymd_opt(year, a, b).or_else(|| NaiveDate::from_ymd_opt(year, b, a))
}

/// Strict ISO calendar date check, as required for committed annotations.
pub fn is_iso_date(raw: &str) -> bool {
    raw.len() == 10 && NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok()
}

#[cfg(feature = "spreadsheet")]
pub fn excel_serial_to_date(serial: f64) -> Option<String> {
    // Excel epoch is 1899-12-30 (accounting for the 1900 leap year bug)
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    let date = base.checked_add_signed(chrono::Duration::days(serial as i64))?;
    Some(iso(date))
}

fn iso(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// Fold case and collapse whitespace, for duplicate detection and header matching.
pub fn fold(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
