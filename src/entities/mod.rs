// Entity Models
// Typed, normalized entities produced by the mapper (School, ClassGroup,
// Activity, Student) and by the synthesizer (FamilyGroup, billing).
//
// Each entity has:
// - A natural (legacy) key that identifies the real-world thing across reruns
// - Optional persisted ids for the kinds it references
// - A row projection used by the persistence boundary

pub mod activity;
pub mod billing;
pub mod class_group;
pub mod family;
pub mod school;
pub mod student;

pub use activity::{Activity, ActivityStatus};
pub use billing::{BillingArtifact, Invoice, Payment, PaymentPurpose};
pub use class_group::{ClassGroup, DayOfWeek};
pub use family::FamilyGroup;
pub use school::{School, SchoolStatus};
pub use student::{Attendance, Contact, EnrollmentStatus, Student, StudentLegacy};

use crate::parser::SourceKind;
use serde::{Deserialize, Serialize};

// ============================================================================
// ENTITY KIND
// ============================================================================

/// Every kind the executor writes, primary and derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    School,
    ClassGroup,
    Activity,
    Student,
    Family,
    Invoice,
    Payment,
}

impl EntityKind {
    /// Strict dependency order for writes
    pub const WRITE_ORDER: [EntityKind; 7] = [
        EntityKind::School,
        EntityKind::ClassGroup,
        EntityKind::Activity,
        EntityKind::Student,
        EntityKind::Family,
        EntityKind::Invoice,
        EntityKind::Payment,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EntityKind::School => "School",
            EntityKind::ClassGroup => "ClassGroup",
            EntityKind::Activity => "Activity",
            EntityKind::Student => "Student",
            EntityKind::Family => "Family",
            EntityKind::Invoice => "Invoice",
            EntityKind::Payment => "Payment",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::School => "schools",
            EntityKind::ClassGroup => "class_groups",
            EntityKind::Activity => "activities",
            EntityKind::Student => "students",
            EntityKind::Family => "families",
            EntityKind::Invoice => "invoices",
            EntityKind::Payment => "payments",
        }
    }

    /// Synthesized rather than read from a document
    pub fn is_derived(&self) -> bool {
        matches!(
            self,
            EntityKind::Family | EntityKind::Invoice | EntityKind::Payment
        )
    }

    pub fn source(&self) -> Option<SourceKind> {
        match self {
            EntityKind::School => Some(SourceKind::School),
            EntityKind::ClassGroup => Some(SourceKind::ClassGroup),
            EntityKind::Activity => Some(SourceKind::Activity),
            EntityKind::Student => Some(SourceKind::Student),
            EntityKind::Family | EntityKind::Invoice | EntityKind::Payment => None,
        }
    }
}

impl From<SourceKind> for EntityKind {
    fn from(kind: SourceKind) -> Self {
        match kind {
            SourceKind::School => EntityKind::School,
            SourceKind::ClassGroup => EntityKind::ClassGroup,
            SourceKind::Activity => EntityKind::Activity,
            SourceKind::Student => EntityKind::Student,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// ALIAS ENUMS
// ============================================================================

/// Closed enum parsed from free-text legacy codes through an explicit alias
/// table. Unknown aliases map to `DEFAULT`; callers attach the warning.
pub trait AliasEnum: Sized + Copy + 'static {
    /// (folded alias, variant) pairs; aliases must already be folded
    const ALIASES: &'static [(&'static str, Self)];

    /// Value used when the alias is not in the table
    const DEFAULT: Self;

    /// Canonical stored value
    fn label(&self) -> &'static str;

    fn from_alias(raw: &str) -> Option<Self> {
        let key = fold_alias(raw);
        Self::ALIASES
            .iter()
            .find(|(alias, _)| *alias == key)
            .map(|(_, variant)| *variant)
    }
}

/// Lowercase, strip accents, collapse whitespace ("  Présent " → "present")
pub fn fold_alias(raw: &str) -> String {
    let folded: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'à' | 'â' | 'ä' | 'á' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'î' | 'ï' | 'í' => 'i',
            'ô' | 'ö' | 'ó' => 'o',
            'ù' | 'û' | 'ü' | 'ú' => 'u',
            'ç' => 'c',
            '-' | '_' => ' ',
            other => other,
        })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// MAPPED ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MappedEntity {
    School(School),
    ClassGroup(ClassGroup),
    Activity(Activity),
    Student(Student),
}

impl MappedEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            MappedEntity::School(_) => EntityKind::School,
            MappedEntity::ClassGroup(_) => EntityKind::ClassGroup,
            MappedEntity::Activity(_) => EntityKind::Activity,
            MappedEntity::Student(_) => EntityKind::Student,
        }
    }

    pub fn natural_key(&self) -> &str {
        match self {
            MappedEntity::School(s) => &s.code,
            MappedEntity::ClassGroup(c) => &c.code,
            MappedEntity::Activity(a) => &a.code,
            MappedEntity::Student(s) => &s.student_ref,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_alias() {
        assert_eq!(fold_alias("  Présent "), "present");
        assert_eq!(fold_alias("EN   ATTENTE"), "en attente");
        assert_eq!(fold_alias("Mercredi"), "mercredi");
        assert_eq!(fold_alias("non-active"), "non active");
    }

    #[test]
    fn test_write_order_puts_derived_last() {
        let first_derived = EntityKind::WRITE_ORDER
            .iter()
            .position(|k| k.is_derived())
            .unwrap();
        assert!(EntityKind::WRITE_ORDER[first_derived..]
            .iter()
            .all(|k| k.is_derived()));
        assert_eq!(EntityKind::WRITE_ORDER[0], EntityKind::School);
    }

    #[test]
    fn test_source_round_trip() {
        for kind in SourceKind::ALL {
            assert_eq!(EntityKind::from(kind).source(), Some(kind));
        }
        assert_eq!(EntityKind::Invoice.source(), None);
    }
}
