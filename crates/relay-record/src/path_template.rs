//! Segment path templates.
//!
//! Record paths are templates containing `%path` plus the strftime-like
//! placeholders `%Y %m %d %H %M %S` and `%f` (microseconds). Rendering
//! produces the segment file path (without extension); parsing recovers
//! the timestamp from a segment's base name so the cleaner can age files
//! without any on-disk index.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

/// Expand a record path template for one segment.
pub fn render(template: &str, path_name: &str, ts: DateTime<Utc>) -> String {
    let mut result = String::with_capacity(template.len() * 2);
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            result.push(c);
            continue;
        }

        match chars.peek() {
            Some('p') => {
                // accept only the full %path placeholder
                let rest: String = chars.clone().take(4).collect();
                if rest == "path" {
                    result.push_str(path_name);
                    for _ in 0..4 {
                        chars.next();
                    }
                } else {
                    result.push('%');
                }
            }
            Some('Y') => {
                result.push_str(&format!("{:04}", ts.year()));
                chars.next();
            }
            Some('m') => {
                result.push_str(&format!("{:02}", ts.month()));
                chars.next();
            }
            Some('d') => {
                result.push_str(&format!("{:02}", ts.day()));
                chars.next();
            }
            Some('H') => {
                result.push_str(&format!("{:02}", ts.hour()));
                chars.next();
            }
            Some('M') => {
                result.push_str(&format!("{:02}", ts.minute()));
                chars.next();
            }
            Some('S') => {
                result.push_str(&format!("{:02}", ts.second()));
                chars.next();
            }
            Some('f') => {
                result.push_str(&format!("{:06}", ts.timestamp_subsec_micros()));
                chars.next();
            }
            Some('%') => {
                result.push('%');
                chars.next();
            }
            _ => result.push('%'),
        }
    }

    result
}

/// Base-name portion of a template (after the last separator).
pub fn base_name_template(template: &str) -> &str {
    template.rsplit('/').next().unwrap_or(template)
}

/// Deepest directory prefix of a template that contains no placeholder.
pub fn common_dir(template: &str) -> String {
    let fixed = match template.find('%') {
        Some(pos) => &template[..pos],
        None => template,
    };
    match fixed.rfind('/') {
        Some(pos) => fixed[..pos].to_string(),
        None => String::new(),
    }
}

/// Recover the timestamp from a segment base name (extension stripped).
/// Returns None when the name does not match the template.
pub fn parse_base_name(template: &str, base: &str) -> Option<DateTime<Utc>> {
    let mut year = 0i32;
    let mut month = 1u32;
    let mut day = 1u32;
    let mut hour = 0u32;
    let mut minute = 0u32;
    let mut second = 0u32;
    let mut micros = 0u32;

    let base: Vec<char> = base.chars().collect();
    let mut pos = 0;
    let mut chars = template.chars().peekable();

    fn read_digits(base: &[char], pos: &mut usize, count: usize) -> Option<u32> {
        if *pos + count > base.len() {
            return None;
        }
        let mut value = 0u32;
        for c in &base[*pos..*pos + count] {
            value = value * 10 + c.to_digit(10)?;
        }
        *pos += count;
        Some(value)
    }

    while let Some(c) = chars.next() {
        if c != '%' {
            if base.get(pos) != Some(&c) {
                return None;
            }
            pos += 1;
            continue;
        }

        match chars.next() {
            Some('Y') => year = read_digits(&base, &mut pos, 4)? as i32,
            Some('m') => month = read_digits(&base, &mut pos, 2)?,
            Some('d') => day = read_digits(&base, &mut pos, 2)?,
            Some('H') => hour = read_digits(&base, &mut pos, 2)?,
            Some('M') => minute = read_digits(&base, &mut pos, 2)?,
            Some('S') => second = read_digits(&base, &mut pos, 2)?,
            Some('f') => micros = read_digits(&base, &mut pos, 6)?,
            Some('%') => {
                if base.get(pos) != Some(&'%') {
                    return None;
                }
                pos += 1;
            }
            _ => return None,
        }
    }

    if pos != base.len() {
        return None;
    }

    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .map(|dt| dt + chrono::Duration::microseconds(micros as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2008, 5, 20, 22, 15, 25).unwrap()
            + chrono::Duration::microseconds(125)
    }

    #[test]
    fn render_substitutes_all_placeholders() {
        let out = render("/rec/%path/%Y-%m-%d_%H-%M-%S-%f", "mypath", ts());
        assert_eq!(out, "/rec/mypath/2008-05-20_22-15-25-000125");
    }

    #[test]
    fn render_keeps_unknown_placeholders_literal() {
        let out = render("%q-%S", "p", ts());
        assert_eq!(out, "%q-25");
    }

    #[test]
    fn parse_recovers_the_timestamp() {
        let parsed = parse_base_name("%Y-%m-%d_%H-%M-%S-%f", "2008-05-20_22-15-25-000125").unwrap();
        assert_eq!(parsed, ts());
    }

    #[test]
    fn parse_rejects_non_matching_names() {
        assert!(parse_base_name("%Y-%m-%d_%H-%M-%S-%f", "notasegment").is_none());
        assert!(parse_base_name("%Y-%m-%d_%H-%M-%S-%f", "2008-05-20_22-15-25").is_none());
    }

    #[test]
    fn common_dir_stops_at_the_first_placeholder() {
        assert_eq!(common_dir("/rec/%path/%Y-%m-%d"), "/rec");
        assert_eq!(common_dir("/rec/fixed/%Y"), "/rec/fixed");
        assert_eq!(common_dir("relative/%path/x"), "relative");
    }

    #[test]
    fn base_name_template_is_the_last_component() {
        assert_eq!(
            base_name_template("/rec/%path/%Y-%m-%d_%H-%M-%S-%f"),
            "%Y-%m-%d_%H-%M-%S-%f"
        );
    }
}
