use crate::error::{ResultsError, Result};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use serde_json::json;
use std::fmt;

/// A (year, month) key grouping one meta record and its result rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i64, month: i64) -> Result<Self> {
        if !(1000..=9999).contains(&year) {
            return Err(ResultsError::validation_with(
                "year must be a 4-digit integer",
                json!({ "year": year }),
            ));
        }
        if !(1..=12).contains(&month) {
            return Err(ResultsError::validation_with(
                "month must be between 1 and 12",
                json!({ "month": month }),
            ));
        }
        Ok(Period {
            year: year as i32,
            month: month as u32,
        })
    }

    /// Reads `year` and `month` from request params. Both must be JSON integers.
    pub fn from_params(params: &serde_json::Value) -> Result<Self> {
        let year = required_int(params, "year")?;
        let month = required_int(params, "month")?;
        Period::new(year, month)
    }

    pub fn containing(date: NaiveDate) -> Self {
        Period {
            year: date.year(),
            month: date.month(),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

fn required_int(params: &serde_json::Value, key: &str) -> Result<i64> {
    let Some(v) = params.get(key) else {
        return Err(ResultsError::validation(format!("missing {}", key)));
    };
    v.as_i64().ok_or_else(|| {
        ResultsError::validation_with(format!("{} must be an integer", key), json!({ key: v }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_month() {
        assert!(Period::new(2025, 0).is_err());
        assert!(Period::new(2025, 13).is_err());
        assert!(Period::new(2025, 12).is_ok());
    }

    #[test]
    fn rejects_non_integer_year_param() {
        let err = Period::from_params(&json!({ "year": "2025", "month": 6 })).unwrap_err();
        assert_eq!(err.code(), "bad_params");
        let err = Period::from_params(&json!({ "year": 2025.5, "month": 6 })).unwrap_err();
        assert_eq!(err.code(), "bad_params");
    }

    #[test]
    fn periods_order_chronologically() {
        let a = Period::new(2024, 12).unwrap();
        let b = Period::new(2025, 1).unwrap();
        assert!(a < b);
        assert_eq!(b.to_string(), "2025-01");
    }
}
