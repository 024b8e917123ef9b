//! Case identifiers of the form `YYMM-NN`.
//!
//! The sequence part is scoped to a period and is derived from the store's
//! ledger of issued identifiers, so numbers freed by deleting a case are never
//! handed out again.

use crate::errors::{AppError, AppResult};
use crate::store::MetadataStore;
use chrono::{Datelike, Local, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

static CASE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{2})(\d{2})-(\d{2,})$").expect("valid case id regex"));
static PERIOD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{2})(\d{2})$").expect("valid period regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    year: u8,
    month: u8,
}

impl Period {
    pub fn new(year: u8, month: u8) -> AppResult<Self> {
        if year > 99 || !(1..=12).contains(&month) {
            return Err(AppError::Invalid(format!(
                "period {:02}{:02} is out of range",
                year, month
            )));
        }
        Ok(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: (date.year().rem_euclid(100)) as u8,
            month: date.month() as u8,
        }
    }

    pub fn current() -> Self {
        Self::from_date(Local::now().date_naive())
    }

    /// The `YYMM` key used to scope sequences.
    pub fn key(&self) -> String {
        format!("{:02}{:02}", self.year, self.month)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let captures = PERIOD_RE
            .captures(value.trim())
            .ok_or_else(|| AppError::Invalid(format!("period '{}' is not YYMM", value)))?;
        let year = captures[1]
            .parse::<u8>()
            .map_err(|error| AppError::Invalid(error.to_string()))?;
        let month = captures[2]
            .parse::<u8>()
            .map_err(|error| AppError::Invalid(error.to_string()))?;
        Self::new(year, month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaseId {
    period: Period,
    sequence: u32,
}

impl CaseId {
    pub fn new(period: Period, sequence: u32) -> AppResult<Self> {
        if sequence == 0 {
            return Err(AppError::Invalid("case sequence starts at 1".to_string()));
        }
        Ok(Self { period, sequence })
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Parses only the generated `YYMM-NN` shape. Renamed cases may carry
    /// free-form identifiers that do not parse.
    pub fn parse(value: &str) -> AppResult<Self> {
        let captures = CASE_ID_RE
            .captures(value)
            .ok_or_else(|| AppError::Invalid(format!("'{}' is not a YYMM-NN case id", value)))?;
        let period: Period = format!("{}{}", &captures[1], &captures[2]).parse()?;
        let sequence = captures[3]
            .parse::<u32>()
            .map_err(|error| {
                AppError::Invalid(format!("case sequence in '{}': {}", value, error))
            })?;
        Self::new(period, sequence)
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.period, self.sequence)
    }
}

/// Computes the next identifier for `period`. Callers must hold the registry
/// write lock until the matching `insert_case` has committed.
pub fn next_case_id(period: Period, store: &dyn MetadataStore) -> AppResult<CaseId> {
    let max = store.get_max_sequence(&period.key())?;
    let next = max.checked_add(1).ok_or_else(|| {
        AppError::Invalid(format!("case sequence exhausted for period {}", period))
    })?;
    CaseId::new(period, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::models::{Case, CaseType};
    use chrono::Utc;

    fn case(case_id: &str) -> Case {
        Case {
            case_id: case_id.to_string(),
            case_type: CaseType::Person,
            client_ref: None,
            client_name: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn period_from_date_uses_two_digit_year() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).expect("date");
        assert_eq!(Period::from_date(date).key(), "2401");
    }

    #[test]
    fn period_rejects_bad_months() {
        assert!("2413".parse::<Period>().is_err());
        assert!("2400".parse::<Period>().is_err());
        assert!("24-1".parse::<Period>().is_err());
        assert_eq!("2412".parse::<Period>().expect("period").key(), "2412");
    }

    #[test]
    fn case_id_pads_to_two_digits_and_widens_past_99() {
        let period: Period = "2401".parse().expect("period");
        assert_eq!(CaseId::new(period, 7).expect("id").to_string(), "2401-07");
        assert_eq!(CaseId::new(period, 100).expect("id").to_string(), "2401-100");
    }

    #[test]
    fn case_id_parse_accepts_generated_shape_only() {
        let parsed = CaseId::parse("2401-12").expect("parse");
        assert_eq!(parsed.period().key(), "2401");
        assert_eq!(parsed.sequence(), 12);
        assert!(CaseId::parse("2401-1").is_err());
        assert!(CaseId::parse("acme-audit").is_err());
        assert!(CaseId::parse("2401-00").is_err());
    }

    #[test]
    fn next_case_id_starts_at_one_and_skips_deleted_numbers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(&dir.path().join("cases.db")).expect("store");
        let period: Period = "2401".parse().expect("period");

        assert_eq!(next_case_id(period, &store).expect("next").to_string(), "2401-01");

        store.insert_case(&case("2401-01")).expect("insert 01");
        store.insert_case(&case("2401-02")).expect("insert 02");
        store.delete_case("2401-02").expect("delete 02");

        assert_eq!(next_case_id(period, &store).expect("next").to_string(), "2401-03");

        let other: Period = "2402".parse().expect("period");
        assert_eq!(next_case_id(other, &store).expect("next").to_string(), "2402-01");
    }
}
