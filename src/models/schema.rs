//! Schema-related data models.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    Table,
    View,
    SystemTable,
}

impl TableType {
    /// Parse the table type reported by the catalog queries.
    pub fn parse(s: &str) -> Self {
        let lower = s.to_lowercase();
        match lower.as_str() {
            "view" => Self::View,
            "system table" | "system_table" => Self::SystemTable,
            _ => Self::Table, // Default to table
        }
    }

    /// Types listed by `tables()` when no filter is given.
    pub fn user_visible() -> &'static [TableType] {
        &[Self::Table, Self::View]
    }
}

impl std::fmt::Display for TableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "TABLE"),
            Self::View => write!(f, "VIEW"),
            Self::SystemTable => write!(f, "SYSTEM TABLE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub table_type: TableType,
}

impl TableInfo {
    pub fn new(name: impl Into<String>, table_type: TableType) -> Self {
        Self {
            name: name.into(),
            table_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_type_parse() {
        assert_eq!(TableType::parse("VIEW"), TableType::View);
        assert_eq!(TableType::parse("SYSTEM TABLE"), TableType::SystemTable);
        assert_eq!(TableType::parse("TABLE"), TableType::Table);
        assert_eq!(TableType::parse("something"), TableType::Table);
    }

    #[test]
    fn test_table_type_display_round_trip() {
        for ty in [TableType::Table, TableType::View, TableType::SystemTable] {
            assert_eq!(TableType::parse(&ty.to_string()), ty);
        }
    }
}
