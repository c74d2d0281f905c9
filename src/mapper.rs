// 🔄 Field Mapper - raw strings → typed, normalized entities
//
// Lossy transforms (truncation, unparsable optional values, unknown enum
// aliases) produce warnings and keep going. A record is rejected only when
// its identifying field is absent.

use crate::entities::{
    Activity, AliasEnum, ClassGroup, Contact, MappedEntity, School, Student, StudentLegacy,
};
use crate::parser::{RawRecord, SourceKind};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Default maximum stored length for text fields
pub const DEFAULT_MAX_STRING_LENGTH: usize = 255;

// ============================================================================
// OUTCOME TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub field: Option<String>,
    pub text: String,
}

impl Warning {
    pub fn new(field: Option<&str>, text: impl Into<String>) -> Self {
        Warning {
            field: field.map(|f| f.to_string()),
            text: text.into(),
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}: {}", field, self.text),
            None => f.write_str(&self.text),
        }
    }
}

/// Why a record produced no entity at all
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub field: String,
    pub reason: String,
    pub original_value: Option<String>,
    pub line: Option<usize>,
    pub warnings: Vec<Warning>,
}

/// Mapped-but-flagged vs. absent are different outcomes
#[derive(Debug, Clone, PartialEq)]
pub enum MapOutcome<T> {
    Mapped { entity: T, warnings: Vec<Warning> },
    Rejected(Rejection),
}

impl<T> MapOutcome<T> {
    pub fn entity(&self) -> Option<&T> {
        match self {
            MapOutcome::Mapped { entity, .. } => Some(entity),
            MapOutcome::Rejected(_) => None,
        }
    }

    pub fn warnings(&self) -> &[Warning] {
        match self {
            MapOutcome::Mapped { warnings, .. } => warnings,
            MapOutcome::Rejected(r) => &r.warnings,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> MapOutcome<U> {
        match self {
            MapOutcome::Mapped { entity, warnings } => MapOutcome::Mapped {
                entity: f(entity),
                warnings,
            },
            MapOutcome::Rejected(r) => MapOutcome::Rejected(r),
        }
    }
}

// ============================================================================
// FIELD MAPPER
// ============================================================================

pub struct FieldMapper {
    max_string_length: usize,
}

impl FieldMapper {
    pub fn new(max_string_length: usize) -> Self {
        FieldMapper { max_string_length }
    }

    pub fn max_string_length(&self) -> usize {
        self.max_string_length
    }

    /// Map any record, dispatching on its kind
    pub fn map(&self, record: &RawRecord) -> MapOutcome<MappedEntity> {
        match record.kind {
            SourceKind::School => self.map_school(record).map(MappedEntity::School),
            SourceKind::ClassGroup => self.map_class_group(record).map(MappedEntity::ClassGroup),
            SourceKind::Activity => self.map_activity(record).map(MappedEntity::Activity),
            SourceKind::Student => self.map_student(record).map(MappedEntity::Student),
        }
    }

    pub fn map_school(&self, record: &RawRecord) -> MapOutcome<School> {
        let mut m = FieldCursor::new(record, self.max_string_length);
        let code = match m.identifier() {
            Ok(code) => code,
            Err(rejection) => return MapOutcome::Rejected(rejection),
        };

        let mut school = School::new(code);
        school.name = m.text("Name");
        school.address = m.text("Address");
        school.city = m.text("City");
        school.phone = m.text("Phone");
        school.email = m.text("Email");
        school.default_price = m.decimal("Default Price");
        school.status = m.alias("Status");

        m.finish(school)
    }

    pub fn map_class_group(&self, record: &RawRecord) -> MapOutcome<ClassGroup> {
        let mut m = FieldCursor::new(record, self.max_string_length);
        let code = match m.identifier() {
            Ok(code) => code,
            Err(rejection) => return MapOutcome::Rejected(rejection),
        };

        let mut group = ClassGroup::new(code);
        group.name = m.text("Name");
        group.school_code = m.text("School");
        group.day = m.alias("Day");
        group.start_time = m.time("Start Time");
        group.level = m.text("Level");
        group.capacity = m.integer("Capacity");

        m.finish(group)
    }

    pub fn map_activity(&self, record: &RawRecord) -> MapOutcome<Activity> {
        let mut m = FieldCursor::new(record, self.max_string_length);
        let code = match m.identifier() {
            Ok(code) => code,
            Err(rejection) => return MapOutcome::Rejected(rejection),
        };

        let mut activity = Activity::new(code);
        activity.name = m.text("Name");
        activity.class_group_code = m.text("Class Group");
        activity.date = m.date("Date");
        activity.duration_minutes = m.integer("Duration");
        activity.status = m.alias("Status");

        m.finish(activity)
    }

    pub fn map_student(&self, record: &RawRecord) -> MapOutcome<Student> {
        let mut m = FieldCursor::new(record, self.max_string_length);
        let student_ref = match m.identifier() {
            Ok(student_ref) => student_ref,
            Err(rejection) => return MapOutcome::Rejected(rejection),
        };

        let mut student = Student::new(student_ref);
        student.first_name = m.text("First Name");
        student.last_name = m.text("Last Name");
        student.birth_date = m.date("Birth Date");
        student.school_code = m.text("School");
        student.class_group_code = m.text("Class Group");
        student.status = m.alias("Status");
        student.attendance = m.alias("Attendance");

        // Contacts end up on family rows, so they get the same truncation.
        // Grouping and billing fields stay verbatim.
        let contact = |m: &mut FieldCursor, prefix: &str, name_field: &str| Contact {
            name: m.text(name_field),
            phone: m.text(&format!("{} Phone", prefix)),
            email: m.text(&format!("{} Email", prefix)),
        };
        student.legacy = StudentLegacy {
            family: m.raw("Family"),
            account_holder: contact(&mut m, "Account Holder", "Account Holder"),
            mother: contact(&mut m, "Mother", "Mother Name"),
            father: contact(&mut m, "Father", "Father Name"),
            charge: m.raw("Charge"),
            charge_date: m.raw("Charge Date"),
            deposit: m.raw("Deposit"),
            deposit_date: m.raw("Deposit Date"),
            uniform: (m.raw("Uniform Date"), m.raw("Uniform Amount")),
            uniform_2: (m.raw("Uniform 2 Date"), m.raw("Uniform 2 Amount")),
        };

        m.finish(student)
    }
}

impl Default for FieldMapper {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STRING_LENGTH)
    }
}

// ============================================================================
// FIELD CURSOR - per-record conversion state
// ============================================================================

struct FieldCursor<'a> {
    record: &'a RawRecord,
    max_len: usize,
    warnings: Vec<Warning>,
}

impl<'a> FieldCursor<'a> {
    fn new(record: &'a RawRecord, max_len: usize) -> Self {
        FieldCursor {
            record,
            max_len,
            warnings: Vec::new(),
        }
    }

    fn finish<T>(self, entity: T) -> MapOutcome<T> {
        MapOutcome::Mapped {
            entity,
            warnings: self.warnings,
        }
    }

    /// Mandatory natural key. `0` is the reader's sentinel for a missing
    /// required numeric field and counts as absent.
    fn identifier(&mut self) -> Result<String, Rejection> {
        let field = self.record.kind.natural_key_field();
        match self.record.get(field) {
            Some(value) if value != "0" => Ok(self
                .text(field)
                .unwrap_or_else(|| value.to_string())),
            other => Err(Rejection {
                field: field.to_string(),
                reason: format!("mandatory identifier '{}' is missing", field),
                original_value: other.map(|v| v.to_string()),
                line: self.record.line,
                warnings: std::mem::take(&mut self.warnings),
            }),
        }
    }

    fn raw(&self, field: &str) -> Option<String> {
        self.record.get(field).map(|v| v.to_string())
    }

    fn warn(&mut self, field: &str, text: String) {
        self.warnings.push(Warning::new(Some(field), text));
    }

    /// Text truncated to the configured maximum, with one warning
    fn text(&mut self, field: &str) -> Option<String> {
        let value = self.record.get(field)?;
        let (kept, original_len) = truncate_chars(value, self.max_len);
        if let Some(original_len) = original_len {
            self.warn(
                field,
                format!(
                    "truncated from {} to {} characters",
                    original_len, self.max_len
                ),
            );
        }
        Some(kept)
    }

    fn integer(&mut self, field: &str) -> Option<i64> {
        let value = self.record.get(field)?;
        let parsed = parse_integer(value);
        if parsed.is_none() {
            self.warn(field, format!("'{}' is not a number; left empty", value));
        }
        parsed
    }

    fn decimal(&mut self, field: &str) -> Option<f64> {
        let value = self.record.get(field)?;
        let parsed = parse_decimal(value);
        if parsed.is_none() {
            self.warn(field, format!("'{}' is not a number; left empty", value));
        }
        parsed
    }

    fn date(&mut self, field: &str) -> Option<NaiveDate> {
        let value = self.record.get(field)?;
        let parsed = parse_date(value);
        if parsed.is_none() {
            self.warn(field, format!("'{}' is not a recognizable date; left empty", value));
        }
        parsed
    }

    fn time(&mut self, field: &str) -> Option<NaiveTime> {
        let value = self.record.get(field)?;
        let parsed = parse_time(value);
        if parsed.is_none() {
            self.warn(field, format!("'{}' is not a recognizable time; left empty", value));
        }
        parsed
    }

    /// Absent → default silently; unknown alias → default with a warning
    fn alias<E: AliasEnum>(&mut self, field: &str) -> E {
        let Some(value) = self.record.get(field) else {
            return E::DEFAULT;
        };
        match E::from_alias(value) {
            Some(variant) => variant,
            None => {
                self.warn(
                    field,
                    format!(
                        "unrecognized value '{}'; using default '{}'",
                        value,
                        E::DEFAULT.label()
                    ),
                );
                E::DEFAULT
            }
        }
    }
}

// ============================================================================
// CONVERSION HELPERS
// ============================================================================

/// Keep at most `max` characters; returns the original length when cut
pub fn truncate_chars(value: &str, max: usize) -> (String, Option<usize>) {
    let len = value.chars().count();
    if len <= max {
        (value.to_string(), None)
    } else {
        (value.chars().take(max).collect(), Some(len))
    }
}

/// Exact integer forms first (`42`, `42.0`), then the locale fallback
pub fn parse_integer(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return Some(n);
    }
    parse_decimal(trimmed)
        .filter(|d| d.fract() == 0.0 && d.abs() < i64::MAX as f64)
        .map(|d| d as i64)
}

/// Exact decimal form first, then locale-aware separators
pub fn parse_decimal(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    if let Ok(n) = trimmed.parse::<f64>() {
        return n.is_finite().then_some(n);
    }
    parse_locale_decimal(trimmed)
}

/// Accepts `1 234,56`, `1.234,56`, `1,234.56`, `12,5`, `(45.00)`.
///
/// The right-most of `,`/`.` is the decimal separator when both appear. A
/// lone comma is decimal when followed by one or two digits, otherwise a
/// thousands separator.
pub fn parse_locale_decimal(value: &str) -> Option<f64> {
    let mut s: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\u{202f}' && *c != '\'')
        .collect();

    let negative_parens = s.starts_with('(') && s.ends_with(')');
    if negative_parens {
        s = s[1..s.len() - 1].to_string();
    }

    let last_comma = s.rfind(',');
    let last_dot = s.rfind('.');
    let normalized = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => s.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => s.replace(',', ""),
        (Some(c), None) => {
            let decimals = s.len() - c - 1;
            if s.matches(',').count() == 1 && (1..=2).contains(&decimals) {
                s.replace(',', ".")
            } else {
                s.replace(',', "")
            }
        }
        (None, _) => s,
    };

    let parsed = normalized.parse::<f64>().ok().filter(|n| n.is_finite())?;
    Some(if negative_parens { -parsed } else { parsed })
}

const DATE_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%Y%m%d",
    "%d/%m/%y",
];

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];

/// `%Y` also accepts one- or two-digit years; those belong to `%y`
const MIN_FOUR_DIGIT_YEAR: i32 = 1000;

/// Exact formats first (ISO, day-first legacy forms), then month names in
/// English or French ("3 septembre 2024", "Sept 3, 2024").
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    let four_digit_year = |d: &NaiveDate| d.year() >= MIN_FOUR_DIGIT_YEAR;

    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            if four_digit_year(&dt.date()) {
                return Some(dt.date());
            }
        }
    }
    for format in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, format) {
            if four_digit_year(&d) {
                return Some(d);
            }
        }
    }

    parse_named_month_date(trimmed).filter(four_digit_year)
}

fn parse_named_month_date(value: &str) -> Option<NaiveDate> {
    let folded = crate::entities::fold_alias(value);
    let tokens: Vec<&str> = folded
        .split(|c: char| c.is_whitespace() || c == ',' || c == '.')
        .filter(|t| !t.is_empty() && *t != "le" && *t != "the")
        .collect();

    let mut month = None;
    let mut numbers = Vec::new();
    for token in tokens {
        if let Some(m) = month_from_name(token) {
            month = Some(m);
        } else if let Ok(n) = token.trim_end_matches(char::is_alphabetic).parse::<u32>() {
            numbers.push(n);
        }
    }

    let month = month?;
    if numbers.len() != 2 {
        return None;
    }
    let (year, day) = if numbers[0] > 31 {
        (numbers[0], numbers[1])
    } else {
        (numbers[1], numbers[0])
    };
    NaiveDate::from_ymd_opt(year as i32, month, day)
}

fn month_from_name(token: &str) -> Option<u32> {
    const MONTHS: [(&str, u32); 30] = [
        ("january", 1), ("janvier", 1), ("jan", 1), ("janv", 1),
        ("february", 2), ("fevrier", 2), ("feb", 2), ("fevr", 2),
        ("march", 3), ("mars", 3), ("mar", 3),
        ("april", 4), ("avril", 4), ("apr", 4), ("avr", 4),
        ("may", 5), ("mai", 5),
        ("june", 6), ("juin", 6),
        ("july", 7), ("juillet", 7),
        ("august", 8), ("aout", 8), ("aug", 8),
        ("september", 9), ("septembre", 9), ("sept", 9),
        ("october", 10), ("octobre", 10), ("oct", 10),
    ];
    const LATE_MONTHS: [(&str, u32); 6] = [
        ("november", 11), ("novembre", 11), ("nov", 11),
        ("december", 12), ("decembre", 12), ("dec", 12),
    ];

    MONTHS
        .iter()
        .chain(LATE_MONTHS.iter())
        .find(|(name, _)| *name == token)
        .map(|(_, m)| *m)
}

/// `17:30`, `17:30:00`, `17h30`, `5:30 PM`, or an exporter datetime whose
/// date part is a placeholder (`1899-12-30T17:30:00`)
pub fn parse_time(value: &str) -> Option<NaiveTime> {
    let trimmed = value.trim();
    for format in ["%H:%M", "%H:%M:%S", "%I:%M %p", "%I:%M%p"] {
        if let Ok(t) = NaiveTime::parse_from_str(trimmed, format) {
            return Some(t);
        }
    }
    if let Some((h, m)) = trimmed.to_lowercase().split_once('h') {
        let minutes = if m.is_empty() { Some(0) } else { m.parse::<u32>().ok() };
        if let (Ok(h), Some(m)) = (h.trim().parse::<u32>(), minutes) {
            return NaiveTime::from_hms_opt(h, m, 0);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt.time());
        }
    }
    None
}

// ============================================================================
// TESTS
// ============================================================================
