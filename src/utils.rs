use crate::error::{Result, VarianceError};
use chrono::{Days, NaiveDate};

pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.checked_sub_days(Days::new(1))
}

/// First and last day of a calendar quarter.
pub fn quarter_bounds(year: i32, quarter: u32) -> Result<(NaiveDate, NaiveDate)> {
    if !(1..=4).contains(&quarter) {
        return Err(VarianceError::InvalidConfig {
            field: "quarter".to_string(),
            details: format!("{} is not a quarter between 1 and 4", quarter),
        });
    }
    let first_month = (quarter - 1) * 3 + 1;
    let out_of_range = || VarianceError::InvalidConfig {
        field: "year".to_string(),
        details: format!("{} is outside the supported date range", year),
    };
    let start = NaiveDate::from_ymd_opt(year, first_month, 1).ok_or_else(out_of_range)?;
    let end = last_day_of_month(year, first_month + 2).ok_or_else(out_of_range)?;
    Ok((start, end))
}

/// Formats an amount with thousands separators and two decimals, e.g. `-1,234,567.89`.
pub fn format_amount(value: f64) -> String {
    let sign = if value < 0.0 { "-" } else { "" };
    let fixed = format!("{:.2}", value.abs());
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    format!("{}{}.{}", sign, grouped, frac_part)
}

/// Formats a signed amount with an explicit sign, e.g. `+45,000.00`.
pub fn format_signed_amount(value: f64) -> String {
    if value > 0.0 {
        format!("+{}", format_amount(value))
    } else {
        format_amount(value)
    }
}

pub fn format_share(share: f64) -> String {
    format!("{:.1}%", share * 100.0)
}

/// `(new - old) / |old|`, or `None` when `old` is zero.
pub fn relative_change(old: f64, new: f64) -> Option<f64> {
    if old == 0.0 {
        None
    } else {
        Some((new - old) / old.abs())
    }
}
