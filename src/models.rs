//! Core data models used throughout shadow-sync.
//!
//! These types describe what the source system exposes (sources, tables,
//! fields, records), what the shadow store persists (rows and neighbors), and
//! who is asking (caller identity).

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// A single source record: field name → dynamically typed value.
pub type Record = serde_json::Map<String, Value>;

/// An external base owned by the source system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub id: String,
    pub title: String,
    /// Where the base's data physically lives, when it is backed by an
    /// external database rather than the source system's own storage.
    pub connection: Option<ConnectionTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: Option<u16>,
    pub database: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub id: String,
    pub name: String,
}

/// Column metadata as reported by the source system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub primary_key: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            primary_key: false,
        }
    }
}

/// Closed set of semantic type tags understood by the text mapper.
///
/// Parsed from the source system's column type strings; anything
/// unrecognized is kept verbatim in [`FieldType::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FieldType {
    ShortText,
    LongText,
    Number,
    Decimal,
    Currency,
    Percent,
    Duration,
    Rating,
    Boolean,
    Checkbox,
    Date,
    DateTime,
    SingleSelect,
    MultiSelect,
    Attachment,
    Barcode,
    QrCode,
    Geometry,
    Json,
    PrimaryKey,
    Unknown(String),
}

impl FieldType {
    /// Type assumed for every field when column metadata is unavailable.
    pub const DEFAULT: FieldType = FieldType::ShortText;

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "SingleLineText" | "Email" | "URL" | "PhoneNumber" | "Formula" | "Lookup" => {
                FieldType::ShortText
            }
            "LongText" | "RichText" => FieldType::LongText,
            "Number" | "AutoNumber" | "Year" => FieldType::Number,
            "Decimal" => FieldType::Decimal,
            "Currency" => FieldType::Currency,
            "Percent" => FieldType::Percent,
            "Duration" => FieldType::Duration,
            "Rating" => FieldType::Rating,
            "Boolean" => FieldType::Boolean,
            "Checkbox" => FieldType::Checkbox,
            "Date" => FieldType::Date,
            "DateTime" | "CreatedTime" | "LastModifiedTime" | "CreateTime" | "LastModifiedAt" => {
                FieldType::DateTime
            }
            "SingleSelect" => FieldType::SingleSelect,
            "MultiSelect" => FieldType::MultiSelect,
            "Attachment" => FieldType::Attachment,
            "Barcode" => FieldType::Barcode,
            "QrCode" => FieldType::QrCode,
            "GeoData" | "Geometry" => FieldType::Geometry,
            "JSON" => FieldType::Json,
            "ID" => FieldType::PrimaryKey,
            other => FieldType::Unknown(other.to_string()),
        }
    }

    /// Snake-case name, or the original tag for [`FieldType::Unknown`].
    pub fn as_str(&self) -> &str {
        match self {
            FieldType::ShortText => "short_text",
            FieldType::LongText => "long_text",
            FieldType::Number => "number",
            FieldType::Decimal => "decimal",
            FieldType::Currency => "currency",
            FieldType::Percent => "percent",
            FieldType::Duration => "duration",
            FieldType::Rating => "rating",
            FieldType::Boolean => "boolean",
            FieldType::Checkbox => "checkbox",
            FieldType::Date => "date",
            FieldType::DateTime => "date_time",
            FieldType::SingleSelect => "single_select",
            FieldType::MultiSelect => "multi_select",
            FieldType::Attachment => "attachment",
            FieldType::Barcode => "barcode",
            FieldType::QrCode => "qr_code",
            FieldType::Geometry => "geometry",
            FieldType::Json => "json",
            FieldType::PrimaryKey => "primary_key",
            FieldType::Unknown(tag) => tag,
        }
    }
}

/// A row to be written into a shadow table.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRow {
    pub record_id: String,
    pub data: Value,
    pub semantic_text: Option<String>,
    /// Version of the source record, used for compare-and-set on update.
    pub source_updated_at: Option<DateTime<Utc>>,
}

/// A row as persisted in a shadow table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShadowRow {
    pub id: i64,
    pub record_id: String,
    pub data: Value,
    pub semantic_text: Option<String>,
    #[serde(skip_serializing)]
    pub embedding: Option<Vec<f32>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
}

/// A row waiting for its embedding.
#[derive(Debug, Clone)]
pub struct EmbeddingTask {
    pub id: i64,
    pub text: String,
}

/// A nearest-neighbor hit returned by the store.
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub id: i64,
    pub record_id: String,
    pub data: Value,
    /// Cosine distance in `[0, 2]`.
    pub distance: f64,
}

/// Counts for one shadow table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableStats {
    pub rows: i64,
    pub embedded: i64,
    /// Rows written since the cutoff the caller asked about.
    pub recent: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Who is calling the query surface, and which source they may read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallerIdentity {
    pub id: Option<String>,
    pub name: Option<String>,
    pub allowed_source: Option<String>,
}

/// Record-level change kinds delivered by the source system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordOperation {
    Insert,
    Update,
    Delete,
}

impl RecordOperation {
    pub const ALL: [RecordOperation; 3] = [
        RecordOperation::Insert,
        RecordOperation::Update,
        RecordOperation::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOperation::Insert => "insert",
            RecordOperation::Update => "update",
            RecordOperation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Some(RecordOperation::Insert),
            "update" => Some(RecordOperation::Update),
            "delete" => Some(RecordOperation::Delete),
            _ => None,
        }
    }
}

/// A webhook registered (or to be registered) on a source table.
#[derive(Debug, Clone, PartialEq)]
pub struct HookSpec {
    pub title: String,
    pub operation: RecordOperation,
    pub url: String,
    /// Extra headers the source system should send with each delivery.
    pub headers: Vec<(String, String)>,
}

/// Connection details for registering a shadow database back into the
/// source system as a read-only mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorConfig {
    pub title: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}
