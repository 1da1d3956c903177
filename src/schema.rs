//! 主键 schema 与存储层注册表（规划器构建上下文）

use crate::common::SchemaVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int8, Int16, Int32, Int64,
    Float32, Float64,
    Varchar,
    Date,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumn {
    pub column_id:   u32,
    pub name:        String,
    pub column_type: ColumnType,
}

impl KeyColumn {
    pub fn new(column_id: u32, name: &str, column_type: ColumnType) -> Self {
        Self { column_id, name: name.into(), column_type }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeySchema {
    pub schema_version: SchemaVersion,
    pub columns:        Vec<KeyColumn>,
}

impl PrimaryKeySchema {
    pub fn new(schema_version: SchemaVersion, columns: Vec<KeyColumn>) -> Self {
        Self { schema_version, columns }
    }

    pub fn is_empty(&self) -> bool { self.columns.is_empty() }
}

// ── 存储层 ────────────────────────────────────────────────────────────────────

/// 可用存储的登记表；第一个为默认存储
#[derive(Debug, Clone)]
pub struct StoragesManager {
    storages: Vec<String>,
}

impl StoragesManager {
    pub const DEFAULT_STORAGE: &'static str = "__DEFAULT";

    pub fn new(extra: &[&str]) -> Self {
        let mut storages = vec![Self::DEFAULT_STORAGE.to_string()];
        storages.extend(extra.iter().map(|s| s.to_string()));
        Self { storages }
    }

    pub fn default_storage(&self) -> &str { &self.storages[0] }
}

impl Default for StoragesManager {
    fn default() -> Self { Self::new(&[]) }
}
