// 👥 Class Group Entity - a weekly group belonging to one school

use super::{AliasEnum, EntityKind};
use crate::db::EntityRow;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
    /// Unrecognized or missing day code
    Unknown,
}

impl DayOfWeek {
    pub fn as_str(&self) -> &'static str {
        match self {
            DayOfWeek::Monday => "monday",
            DayOfWeek::Tuesday => "tuesday",
            DayOfWeek::Wednesday => "wednesday",
            DayOfWeek::Thursday => "thursday",
            DayOfWeek::Friday => "friday",
            DayOfWeek::Saturday => "saturday",
            DayOfWeek::Sunday => "sunday",
            DayOfWeek::Unknown => "unknown",
        }
    }
}

impl AliasEnum for DayOfWeek {
    const ALIASES: &'static [(&'static str, Self)] = &[
        ("monday", DayOfWeek::Monday),
        ("mon", DayOfWeek::Monday),
        ("lundi", DayOfWeek::Monday),
        ("lun", DayOfWeek::Monday),
        ("1", DayOfWeek::Monday),
        ("tuesday", DayOfWeek::Tuesday),
        ("tue", DayOfWeek::Tuesday),
        ("mardi", DayOfWeek::Tuesday),
        ("mar", DayOfWeek::Tuesday),
        ("2", DayOfWeek::Tuesday),
        ("wednesday", DayOfWeek::Wednesday),
        ("wed", DayOfWeek::Wednesday),
        ("mercredi", DayOfWeek::Wednesday),
        ("mer", DayOfWeek::Wednesday),
        ("3", DayOfWeek::Wednesday),
        ("thursday", DayOfWeek::Thursday),
        ("thu", DayOfWeek::Thursday),
        ("jeudi", DayOfWeek::Thursday),
        ("jeu", DayOfWeek::Thursday),
        ("4", DayOfWeek::Thursday),
        ("friday", DayOfWeek::Friday),
        ("fri", DayOfWeek::Friday),
        ("vendredi", DayOfWeek::Friday),
        ("ven", DayOfWeek::Friday),
        ("5", DayOfWeek::Friday),
        ("saturday", DayOfWeek::Saturday),
        ("sat", DayOfWeek::Saturday),
        ("samedi", DayOfWeek::Saturday),
        ("sam", DayOfWeek::Saturday),
        ("6", DayOfWeek::Saturday),
        ("sunday", DayOfWeek::Sunday),
        ("sun", DayOfWeek::Sunday),
        ("dimanche", DayOfWeek::Sunday),
        ("dim", DayOfWeek::Sunday),
        ("7", DayOfWeek::Sunday),
    ];

    const DEFAULT: Self = DayOfWeek::Unknown;

    fn label(&self) -> &'static str {
        self.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassGroup {
    /// Natural key
    pub code: String,
    pub name: Option<String>,
    /// Legacy reference to the owning school (school code)
    pub school_code: Option<String>,
    /// Filled in by the resolver
    pub school_id: Option<i64>,
    pub day: DayOfWeek,
    pub start_time: Option<NaiveTime>,
    pub level: Option<String>,
    pub capacity: Option<i64>,
}

impl ClassGroup {
    pub fn new(code: impl Into<String>) -> Self {
        ClassGroup {
            code: code.into(),
            name: None,
            school_code: None,
            school_id: None,
            day: DayOfWeek::DEFAULT,
            start_time: None,
            level: None,
            capacity: None,
        }
    }

    pub fn to_row(&self) -> EntityRow {
        EntityRow::new(EntityKind::ClassGroup, &self.code)
            .column("name", json!(self.name))
            .column("school_id", json!(self.school_id))
            .column("day_of_week", json!(self.day.as_str()))
            .column(
                "start_time",
                json!(self.start_time.map(|t| t.format("%H:%M").to_string())),
            )
            .column("level", json!(self.level))
            .column("capacity", json!(self.capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_day_aliases() {
        assert_eq!(DayOfWeek::from_alias("Mercredi"), Some(DayOfWeek::Wednesday));
        assert_eq!(DayOfWeek::from_alias("SAT"), Some(DayOfWeek::Saturday));
        assert_eq!(DayOfWeek::from_alias("7"), Some(DayOfWeek::Sunday));
        assert_eq!(DayOfWeek::from_alias("someday"), None);
        assert_eq!(DayOfWeek::DEFAULT, DayOfWeek::Unknown);
    }

    #[test]
    fn test_row_formats_start_time() {
        let mut group = ClassGroup::new("G1");
        group.start_time = NaiveTime::from_hms_opt(17, 30, 0);
        group.school_id = Some(3);

        let row = group.to_row();
        assert_eq!(row.get("start_time"), Some(&json!("17:30")));
        assert_eq!(row.get("school_id"), Some(&json!(3)));
    }
}
