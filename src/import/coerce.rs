//! セル値の型変換

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::Serialize;

use super::mapping::DataType;
use super::reader::Cell;

/// 正規化後の値
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Text(String),
    Number(Decimal),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y/%m/%d"];

const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
];

/// 空でないセルを型変換する。空セルは呼び出し側で扱う
pub fn coerce(cell: &Cell, data_type: DataType) -> Result<FieldValue, String> {
    match (data_type, cell) {
        (_, Cell::Empty) => Ok(FieldValue::Null),
        (DataType::Text, _) => Ok(FieldValue::Text(cell.to_text().trim().to_string())),
        (DataType::Number | DataType::Currency, Cell::Number(n)) => Decimal::try_from(*n)
            .map(|d| FieldValue::Number(d.normalize()))
            .map_err(|e| format!("{} is not representable as a decimal: {}", n, e)),
        (DataType::Number | DataType::Currency, Cell::Text(s)) => {
            parse_decimal(s).map(FieldValue::Number)
        }
        (DataType::Number | DataType::Currency, Cell::DateTime(_)) => {
            Err(format!("expected a number, found date '{}'", cell.to_text()))
        }
        (DataType::Date, Cell::DateTime(dt)) => Ok(date_value(*dt)),
        (DataType::Date, Cell::Text(s)) => parse_date(s),
        (DataType::Date, Cell::Number(n)) => Err(format!("expected a date, found number {}", n)),
    }
}

fn date_value(dt: NaiveDateTime) -> FieldValue {
    if dt.time() == chrono::NaiveTime::MIN {
        FieldValue::Date(dt.date())
    } else {
        FieldValue::DateTime(dt)
    }
}

pub fn parse_date(raw: &str) -> Result<FieldValue, String> {
    let s = raw.trim();
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return Ok(FieldValue::Date(date));
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(date_value(dt));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(FieldValue::DateTime(dt.naive_local()));
    }
    Err(format!("'{}' does not match any accepted date format", s))
}

fn is_symbol(c: char) -> bool {
    c.is_ascii_uppercase() || !(c.is_alphanumeric() || c.is_whitespace() || ".,+-()".contains(c))
}

/// ロケール差（`1.234,56` / `1,234.56`）と通貨記号を許容して数値にする
pub fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\'')
        .collect();
    let mut s = compact.as_str();
    let mut negative = false;

    if let Some(inner) = s.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        negative = true;
        s = inner;
    }

    // 数字の前後は符号と通貨記号のみ許す
    let first = s.find(|c: char| c.is_ascii_digit() || c == '.' || c == ',');
    let last = s.rfind(|c: char| c.is_ascii_digit());
    let (prefix, core, suffix) = match (first, last) {
        (Some(f), Some(l)) if f <= l => (&s[..f], &s[f..=l], &s[l + 1..]),
        _ => return Err(format!("'{}' is not a number", raw.trim())),
    };

    for c in prefix.chars().chain(suffix.chars()) {
        match c {
            '-' => negative = !negative,
            '+' => {}
            c if is_symbol(c) => {}
            _ => return Err(format!("'{}' is not a number", raw.trim())),
        }
    }

    if core.chars().any(|c| !(c.is_ascii_digit() || c == '.' || c == ',')) {
        return Err(format!("'{}' is not a number", raw.trim()));
    }

    let normalized = normalize_separators(core).ok_or_else(|| {
        format!("'{}' has ambiguous or malformed separators", raw.trim())
    })?;
    let value = Decimal::from_str(&normalized)
        .map_err(|e| format!("'{}' is not a number: {}", raw.trim(), e))?;
    Ok(if negative { -value } else { value })
}

/// 桁区切りを除き、小数点を `.` に揃える
fn normalize_separators(core: &str) -> Option<String> {
    let dots = core.matches('.').count();
    let commas = core.matches(',').count();

    let (grouping, decimal) = match (dots, commas) {
        (0, 0) => return Some(core.to_string()),
        (_, 0) | (0, _) => {
            let sep = if dots > 0 { '.' } else { ',' };
            let count = dots.max(commas);
            let (before, after) = core.rsplit_once(sep)?;
            let grouped = after.len() == 3
                && !before.is_empty()
                && before.len() <= 3
                && !before.starts_with('0');
            if count > 1 || grouped {
                (Some(sep), None)
            } else {
                (None, Some(sep))
            }
        }
        _ => {
            let last_dot = core.rfind('.')?;
            let last_comma = core.rfind(',')?;
            if last_dot > last_comma {
                (Some(','), Some('.'))
            } else {
                (Some('.'), Some(','))
            }
        }
    };

    let (integer, fraction) = match decimal {
        Some(d) => {
            let (i, f) = core.rsplit_once(d)?;
            if f.contains(grouping.unwrap_or(d)) || i.contains(d) {
                return None;
            }
            (i, Some(f))
        }
        None => (core, None),
    };

    let digits = match grouping {
        Some(g) => {
            let groups: Vec<&str> = integer.split(g).collect();
            let well_formed = groups.len() == 1
                || (!groups[0].is_empty()
                    && groups[0].len() <= 3
                    && groups[1..].iter().all(|grp| grp.len() == 3));
            if !well_formed {
                return None;
            }
            groups.concat()
        }
        None => integer.to_string(),
    };

    let integer = if digits.is_empty() { "0".to_string() } else { digits };
    match fraction {
        Some(f) if f.is_empty() => None,
        Some(f) => Some(format!("{}.{}", integer, f)),
        None => Some(integer),
    }
}
