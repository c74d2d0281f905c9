// 📅 Activity Entity - one scheduled session of a class group

use super::{AliasEnum, EntityKind};
use crate::db::EntityRow;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Scheduled => "scheduled",
            ActivityStatus::Completed => "completed",
            ActivityStatus::Cancelled => "cancelled",
        }
    }
}

impl AliasEnum for ActivityStatus {
    const ALIASES: &'static [(&'static str, Self)] = &[
        ("scheduled", ActivityStatus::Scheduled),
        ("planned", ActivityStatus::Scheduled),
        ("prevu", ActivityStatus::Scheduled),
        ("planifie", ActivityStatus::Scheduled),
        ("a venir", ActivityStatus::Scheduled),
        ("completed", ActivityStatus::Completed),
        ("done", ActivityStatus::Completed),
        ("termine", ActivityStatus::Completed),
        ("complete", ActivityStatus::Completed),
        ("fait", ActivityStatus::Completed),
        ("cancelled", ActivityStatus::Cancelled),
        ("canceled", ActivityStatus::Cancelled),
        ("annule", ActivityStatus::Cancelled),
    ];

    const DEFAULT: Self = ActivityStatus::Scheduled;

    fn label(&self) -> &'static str {
        self.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Natural key
    pub code: String,
    pub name: Option<String>,
    pub class_group_code: Option<String>,
    pub class_group_id: Option<i64>,
    pub date: Option<NaiveDate>,
    pub duration_minutes: Option<i64>,
    pub status: ActivityStatus,
}

impl Activity {
    pub fn new(code: impl Into<String>) -> Self {
        Activity {
            code: code.into(),
            name: None,
            class_group_code: None,
            class_group_id: None,
            date: None,
            duration_minutes: None,
            status: ActivityStatus::DEFAULT,
        }
    }

    pub fn to_row(&self) -> EntityRow {
        EntityRow::new(EntityKind::Activity, &self.code)
            .column("name", json!(self.name))
            .column("class_group_id", json!(self.class_group_id))
            .column("date", json!(self.date.map(|d| d.to_string())))
            .column("duration_minutes", json!(self.duration_minutes))
            .column("status", json!(self.status.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_aliases() {
        assert_eq!(ActivityStatus::from_alias("Annulé"), Some(ActivityStatus::Cancelled));
        assert_eq!(ActivityStatus::from_alias("canceled"), Some(ActivityStatus::Cancelled));
        assert_eq!(ActivityStatus::from_alias("Terminé"), Some(ActivityStatus::Completed));
        assert_eq!(ActivityStatus::from_alias("postponed"), None);
    }
}
