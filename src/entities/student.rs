// 🎒 Student Entity - person records plus the dirty legacy fields the
// synthesizer mines for households and billing

use super::{AliasEnum, EntityKind};
use crate::db::EntityRow;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;

// ============================================================================
// STATUS ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrollmentStatus {
    Active,
    Inactive,
    Waitlisted,
    Withdrawn,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Inactive => "inactive",
            EnrollmentStatus::Waitlisted => "waitlisted",
            EnrollmentStatus::Withdrawn => "withdrawn",
        }
    }
}

impl AliasEnum for EnrollmentStatus {
    const ALIASES: &'static [(&'static str, Self)] = &[
        ("active", EnrollmentStatus::Active),
        ("actif", EnrollmentStatus::Active),
        ("active student", EnrollmentStatus::Active),
        ("inscrit", EnrollmentStatus::Active),
        ("enrolled", EnrollmentStatus::Active),
        ("a", EnrollmentStatus::Active),
        ("inactive", EnrollmentStatus::Inactive),
        ("inactif", EnrollmentStatus::Inactive),
        ("i", EnrollmentStatus::Inactive),
        ("waitlist", EnrollmentStatus::Waitlisted),
        ("waitlisted", EnrollmentStatus::Waitlisted),
        ("waiting", EnrollmentStatus::Waitlisted),
        ("en attente", EnrollmentStatus::Waitlisted),
        ("liste d'attente", EnrollmentStatus::Waitlisted),
        ("withdrawn", EnrollmentStatus::Withdrawn),
        ("abandon", EnrollmentStatus::Withdrawn),
        ("desinscrit", EnrollmentStatus::Withdrawn),
        ("retire", EnrollmentStatus::Withdrawn),
    ];

    const DEFAULT: Self = EnrollmentStatus::Active;

    fn label(&self) -> &'static str {
        self.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attendance {
    Present,
    Absent,
    Excused,
    Late,
    Unknown,
}

impl Attendance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Attendance::Present => "present",
            Attendance::Absent => "absent",
            Attendance::Excused => "excused",
            Attendance::Late => "late",
            Attendance::Unknown => "unknown",
        }
    }
}

impl AliasEnum for Attendance {
    const ALIASES: &'static [(&'static str, Self)] = &[
        ("present", Attendance::Present),
        ("p", Attendance::Present),
        ("here", Attendance::Present),
        ("absent", Attendance::Absent),
        ("abs", Attendance::Absent),
        ("a", Attendance::Absent),
        ("excused", Attendance::Excused),
        ("excuse", Attendance::Excused),
        ("motive", Attendance::Excused),
        ("absence motivee", Attendance::Excused),
        ("e", Attendance::Excused),
        ("late", Attendance::Late),
        ("retard", Attendance::Late),
        ("en retard", Attendance::Late),
        ("r", Attendance::Late),
    ];

    const DEFAULT: Self = Attendance::Unknown;

    fn label(&self) -> &'static str {
        self.as_str()
    }
}

// ============================================================================
// LEGACY FIELDS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl Contact {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.phone.is_none() && self.email.is_none()
    }
}

/// Raw legacy strings kept verbatim (trimmed) for the synthesizer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudentLegacy {
    /// Household key, compared with exact string equality
    pub family: Option<String>,

    /// Contact sources in priority order
    pub account_holder: Contact,
    pub mother: Contact,
    pub father: Contact,

    pub charge: Option<String>,
    pub charge_date: Option<String>,
    pub deposit: Option<String>,
    pub deposit_date: Option<String>,

    /// Two fixed ancillary (uniform) payment slots: (date, amount)
    pub uniform: (Option<String>, Option<String>),
    pub uniform_2: (Option<String>, Option<String>),
}

impl StudentLegacy {
    /// Contacts ordered from highest to lowest priority
    pub fn contacts_by_priority(&self) -> [&Contact; 3] {
        [&self.account_holder, &self.mother, &self.father]
    }
}

// ============================================================================
// STUDENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    /// Natural key (legacy student reference)
    pub student_ref: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub school_code: Option<String>,
    pub school_id: Option<i64>,
    pub class_group_code: Option<String>,
    pub class_group_id: Option<i64>,
    pub status: EnrollmentStatus,
    pub attendance: Attendance,
    pub legacy: StudentLegacy,
}

impl Student {
    pub fn new(student_ref: impl Into<String>) -> Self {
        Student {
            student_ref: student_ref.into(),
            first_name: None,
            last_name: None,
            birth_date: None,
            school_code: None,
            school_id: None,
            class_group_code: None,
            class_group_id: None,
            status: EnrollmentStatus::DEFAULT,
            attendance: Attendance::DEFAULT,
            legacy: StudentLegacy::default(),
        }
    }

    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{} {}", first, last),
            (Some(only), None) | (None, Some(only)) => only.clone(),
            (None, None) => self.student_ref.clone(),
        }
    }

    pub fn to_row(&self) -> EntityRow {
        EntityRow::new(EntityKind::Student, &self.student_ref)
            .column("first_name", json!(self.first_name))
            .column("last_name", json!(self.last_name))
            .column("birth_date", json!(self.birth_date.map(|d| d.to_string())))
            .column("school_id", json!(self.school_id))
            .column("class_group_id", json!(self.class_group_id))
            .column("status", json!(self.status.as_str()))
            .column("attendance", json!(self.attendance.as_str()))
    }
}
