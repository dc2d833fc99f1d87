//! Declared field shapes for engine-side value objects

use std::collections::BTreeMap;

/// Column holding the entity's creation time (unix seconds)
pub const CREATED_AT: &str = "created_at";
/// Column holding the entity's last update time (unix seconds)
pub const UPDATED_AT: &str = "updated_at";

/// Kind of an engine-side property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Stored as INTEGER 0/1
    Bool,
    Int32,
    Int64,
    Float,
    Double,
    Text,
    Bytes,
    /// Arrays, maps and nested structs, stored as JSON text
    Json,
}

impl FieldKind {
    /// Column affinity used in generated DDL
    pub fn sql_type(self) -> &'static str {
        match self {
            FieldKind::Bool | FieldKind::Int32 | FieldKind::Int64 => "INTEGER",
            FieldKind::Float | FieldKind::Double => "REAL",
            FieldKind::Text | FieldKind::Json => "TEXT",
            FieldKind::Bytes => "BLOB",
        }
    }
}

/// Engine-side property value
#[derive(Debug, Clone, PartialEq)]
pub enum EngineValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Composite(serde_json::Value),
}

/// Engine-side value object: property name to value
pub type EngineObject = BTreeMap<String, EngineValue>;

/// One declared field of a shape
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
    pub default: Option<EngineValue>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            default: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Value used when a record lacks this field
    pub fn default(mut self, value: EngineValue) -> Self {
        self.default = Some(value);
        self
    }
}

/// Table layout of an entity type
///
/// Every shape has an integer primary key column (`id`). The declared fields
/// follow in order. Shapes with managed timestamps carry two more integer
/// columns, [`CREATED_AT`] and [`UPDATED_AT`].
#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    table: String,
    id_column: String,
    fields: Vec<FieldSpec>,
    timestamps: bool,
}

impl Shape {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id_column: "id".to_string(),
            fields: Vec::new(),
            timestamps: false,
        }
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_timestamps(&self) -> bool {
        self.timestamps
    }

    /// All columns in table order
    pub fn column_names(&self) -> Vec<&str> {
        let mut columns = Vec::with_capacity(self.fields.len() + 3);
        columns.push(self.id_column.as_str());
        columns.extend(self.fields.iter().map(|f| f.name.as_str()));
        if self.timestamps {
            columns.push(CREATED_AT);
            columns.push(UPDATED_AT);
        }
        columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        name == self.id_column
            || self.field_spec(name).is_some()
            || (self.timestamps && (name == CREATED_AT || name == UPDATED_AT))
    }

    /// Comma-separated, quoted column list for SELECT statements
    pub fn select_columns(&self) -> String {
        self.column_names()
            .into_iter()
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// DDL for this shape, suitable as a migration step
    pub fn create_table_sql(&self) -> String {
        let mut columns = vec![format!("{} INTEGER PRIMARY KEY", quote_ident(&self.id_column))];
        for field in &self.fields {
            let mut column = format!("{} {}", quote_ident(&field.name), field.kind.sql_type());
            if !field.nullable {
                column.push_str(" NOT NULL");
            }
            columns.push(column);
        }
        if self.timestamps {
            columns.push(format!("{} INTEGER NOT NULL", quote_ident(CREATED_AT)));
            columns.push(format!("{} INTEGER NOT NULL", quote_ident(UPDATED_AT)));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
            quote_ident(&self.table),
            columns.join(",\n    ")
        )
    }
}

/// Quote an identifier for use in generated SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
