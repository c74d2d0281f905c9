// 🔗 Reference Resolver
// Turns natural-key references (school code, class-group code, student ref)
// into persisted ids. Tables are fetched in bulk once per kind; each
// resolution is a hash lookup.

use crate::db::ImportStore;
use crate::entities::{EntityKind, MappedEntity};
use crate::mapper::Warning;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Keys compare trimmed and case-insensitive ("s1 " finds "S1")
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

#[derive(Debug, Clone, Default)]
pub struct LookupTable {
    ids: HashMap<String, i64>,
    /// Normalized keys shared by several stored keys ("S1" and "s1")
    ambiguous: HashSet<String>,
}

impl LookupTable {
    /// Stored keys that collide once normalized resolve to the lowest
    /// (earliest persisted) id and are flagged as ambiguous
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, i64)>,
        K: AsRef<str>,
    {
        let mut table = LookupTable::default();
        for (key, id) in pairs {
            let normalized = normalize_key(key.as_ref());
            match table.ids.get_mut(&normalized) {
                Some(existing) => {
                    warn!(
                        key = key.as_ref(),
                        ids = ?(*existing, id),
                        "stored keys differ only in case or spacing"
                    );
                    *existing = (*existing).min(id);
                    table.ambiguous.insert(normalized);
                }
                None => {
                    table.ids.insert(normalized, id);
                }
            }
        }
        table
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.ids.get(&normalize_key(key)).copied()
    }

    pub fn is_ambiguous(&self, key: &str) -> bool {
        self.ambiguous.contains(&normalize_key(key))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ReferenceResolver {
    tables: HashMap<EntityKind, LookupTable>,
}

impl ReferenceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (or refresh) the lookup table for one kind
    pub fn load(&mut self, store: &dyn ImportStore, kind: EntityKind) -> Result<()> {
        let table = LookupTable::from_pairs(store.lookup_table(kind)?);
        debug!(kind = %kind, entries = table.len(), "loaded lookup table");
        self.tables.insert(kind, table);
        Ok(())
    }

    pub fn insert_table(&mut self, kind: EntityKind, table: LookupTable) {
        self.tables.insert(kind, table);
    }

    pub fn table(&self, kind: EntityKind) -> Option<&LookupTable> {
        self.tables.get(&kind)
    }

    /// Resolve one reference. Absent and unknown keys both come back as
    /// `None` with a warning naming the field.
    pub fn resolve(&self, kind: EntityKind, key: Option<&str>, field: &str) -> (Option<i64>, Option<Warning>) {
        let Some(key) = key else {
            return (
                None,
                Some(Warning::new(Some(field), format!("no {} reference given", kind))),
            );
        };

        let table = self.tables.get(&kind);
        match table.and_then(|t| t.get(key)) {
            Some(id) if table.is_some_and(|t| t.is_ambiguous(key)) => (
                Some(id),
                Some(Warning::new(
                    Some(field),
                    format!(
                        "ambiguous reference: several {} keys match '{}' ignoring case; using id {}",
                        kind, key, id
                    ),
                )),
            ),
            Some(id) => (Some(id), None),
            None => (
                None,
                Some(Warning::new(
                    Some(field),
                    format!("unresolved reference: no {} with key '{}'", kind, key),
                )),
            ),
        }
    }

    /// Fill every foreign key on a mapped entity; returns the warnings for
    /// references that could not be resolved
    pub fn resolve_entity(&self, entity: &mut MappedEntity) -> Vec<Warning> {
        let mut warnings = Vec::new();
        let mut fill = |kind: EntityKind, key: Option<&str>, field: &str| {
            let (id, warning) = self.resolve(kind, key, field);
            warnings.extend(warning);
            id
        };

        match entity {
            MappedEntity::School(_) => {}
            MappedEntity::ClassGroup(group) => {
                group.school_id = fill(EntityKind::School, group.school_code.as_deref(), "School");
            }
            MappedEntity::Activity(activity) => {
                activity.class_group_id = fill(
                    EntityKind::ClassGroup,
                    activity.class_group_code.as_deref(),
                    "Class Group",
                );
            }
            MappedEntity::Student(student) => {
                student.school_id = fill(EntityKind::School, student.school_code.as_deref(), "School");
                student.class_group_id = fill(
                    EntityKind::ClassGroup,
                    student.class_group_code.as_deref(),
                    "Class Group",
                );
            }
        }

        warnings
    }
}
