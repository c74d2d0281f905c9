// 🏠 Family Group - derived household keyed by the verbatim legacy string

use super::student::{Contact, Student};
use super::EntityKind;
use crate::db::EntityRow;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyGroup {
    /// Verbatim family string from the legacy export
    pub key: String,
    pub members: Vec<Student>,
    pub contact: Contact,
}

impl FamilyGroup {
    pub fn new(key: impl Into<String>) -> Self {
        FamilyGroup {
            key: key.into(),
            members: Vec::new(),
            contact: Contact::default(),
        }
    }

    /// Stable key for reruns: `FAM-` + 16 hex chars of SHA-256(key).
    ///
    /// Hashes the exact bytes, so "Smith" and "smith " stay distinct.
    pub fn legacy_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        format!("FAM-{}", &digest[..16])
    }

    pub fn member_refs(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.student_ref.as_str()).collect()
    }

    pub fn to_row(&self) -> EntityRow {
        EntityRow::new(EntityKind::Family, &self.legacy_key())
            .column("label", json!(self.key))
            .column("contact_name", json!(self.contact.name))
            .column("contact_phone", json!(self.contact.phone))
            .column("contact_email", json!(self.contact.email))
            .column("member_count", json!(self.members.len()))
    }
}
