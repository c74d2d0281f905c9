// 🏫 School Entity - the organization every other kind hangs off

use super::{AliasEnum, EntityKind};
use crate::db::EntityRow;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchoolStatus {
    Active,
    Inactive,
}

impl SchoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchoolStatus::Active => "active",
            SchoolStatus::Inactive => "inactive",
        }
    }
}

impl AliasEnum for SchoolStatus {
    const ALIASES: &'static [(&'static str, Self)] = &[
        ("active", SchoolStatus::Active),
        ("actif", SchoolStatus::Active),
        ("active school", SchoolStatus::Active),
        ("open", SchoolStatus::Active),
        ("ouvert", SchoolStatus::Active),
        ("a", SchoolStatus::Active),
        ("1", SchoolStatus::Active),
        ("inactive", SchoolStatus::Inactive),
        ("inactif", SchoolStatus::Inactive),
        ("closed", SchoolStatus::Inactive),
        ("ferme", SchoolStatus::Inactive),
        ("i", SchoolStatus::Inactive),
        ("0", SchoolStatus::Inactive),
    ];

    const DEFAULT: Self = SchoolStatus::Active;

    fn label(&self) -> &'static str {
        self.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct School {
    /// Natural key
    pub code: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    /// Fallback invoice amount for students without a charge
    pub default_price: Option<f64>,
    pub status: SchoolStatus,
}

impl School {
    pub fn new(code: impl Into<String>) -> Self {
        School {
            code: code.into(),
            name: None,
            address: None,
            city: None,
            phone: None,
            email: None,
            default_price: None,
            status: SchoolStatus::DEFAULT,
        }
    }

    pub fn to_row(&self) -> EntityRow {
        EntityRow::new(EntityKind::School, &self.code)
            .column("name", json!(self.name))
            .column("address", json!(self.address))
            .column("city", json!(self.city))
            .column("phone", json!(self.phone))
            .column("email", json!(self.email))
            .column("default_price", json!(self.default_price))
            .column("status", json!(self.status.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_aliases_bilingual() {
        assert_eq!(SchoolStatus::from_alias("Actif"), Some(SchoolStatus::Active));
        assert_eq!(SchoolStatus::from_alias("FERMÉ"), Some(SchoolStatus::Inactive));
        assert_eq!(SchoolStatus::from_alias("maybe"), None);
    }

    #[test]
    fn test_row_projection() {
        let mut school = School::new("S1");
        school.default_price = Some(120.0);

        let row = school.to_row();
        assert_eq!(row.natural_key, "S1");
        assert_eq!(row.get("default_price"), Some(&json!(120.0)));
        assert_eq!(row.get("status"), Some(&json!("active")));
    }
}
