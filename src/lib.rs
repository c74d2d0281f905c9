// Legacy Import - Core Library
// Exposes all modules for use in the CLI and tests

pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod executor;   // Conflict-resolution executor + run state machine
pub mod mapper;     // Field mapping: legacy record → typed entity
pub mod parser;     // Streaming XML reader
pub mod report;     // Run summaries + exceptions report
pub mod resolver;   // Natural key → persisted id
pub mod schema;     // XSD subset: field types, required fields
pub mod synthesizer; // Families + billing derived from students

// Re-export commonly used types
pub use config::{ImportConfig, SourceFiles};
pub use db::{
    EntityRow, Event, FieldChange, ImportStore, InsertOutcome, MemoryStore, SqliteStore,
    get_events_for_entity, insert_event, setup_database,
};
pub use entities::{
    AliasEnum, EntityKind, MappedEntity,
    Activity, ClassGroup, School, Student, FamilyGroup, Invoice, Payment, BillingArtifact,
};
pub use error::ImportError;
pub use executor::{
    ConflictPolicy, ExecutionContext, Executor, ImportException, ImportRunResult,
    KindCounters, RecordWarning, RunPhase,
};
pub use mapper::{FieldMapper, MapOutcome, Rejection, Warning};
pub use parser::{read_document, RawRecord, RecordStream, SourceKind};
pub use report::{default_report_path, success_rate, write_report, write_report_if_needed, RunSummary};
pub use resolver::{LookupTable, ReferenceResolver};
pub use schema::{SchemaDefinition, ValidationError};
pub use synthesizer::{ReceiptSequence, Synthesizer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
