use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Xlsx,
    Xls,
    Csv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Text,
    Number,
    Date,
    Currency,
}

/// 取込元の列からシステム項目への対応
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub system_field: String,
    /// 見出し名・列記号（`A`, `AB`）・1始まりの列番号のいずれか
    pub source_column: String,
    pub data_type: DataType,
    #[serde(default)]
    pub required: bool,
}

impl FieldMapping {
    pub fn new(
        system_field: impl Into<String>,
        source_column: impl Into<String>,
        data_type: DataType,
        required: bool,
    ) -> Self {
        Self {
            system_field: system_field.into(),
            source_column: source_column.into(),
            data_type,
            required,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMapping {
    pub file_kind: FileKind,
    pub header_row: u32,
    pub first_data_row: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv_delimiter: Option<char>,
    pub fields: Vec<FieldMapping>,
}

impl ImportMapping {
    pub fn delimiter(&self) -> u8 {
        match self.csv_delimiter {
            Some(c) if c.is_ascii() => c as u8,
            _ => b',',
        }
    }

    /// 項目名と理由の組で問題を返す
    pub(crate) fn check(&self) -> Vec<(String, String)> {
        let mut problems = Vec::new();

        if self.header_row < 1 {
            problems.push(("importMapping.headerRow".to_string(), "must be at least 1".to_string()));
        }
        if self.first_data_row <= self.header_row {
            problems.push((
                "importMapping.firstDataRow".to_string(),
                format!("must be greater than headerRow ({})", self.header_row),
            ));
        }
        if let Some(delimiter) = self.csv_delimiter {
            if self.file_kind != FileKind::Csv {
                problems.push((
                    "importMapping.csvDelimiter".to_string(),
                    "only allowed for csv files".to_string(),
                ));
            } else if !delimiter.is_ascii() || matches!(delimiter, '"' | '\n' | '\r') {
                problems.push((
                    "importMapping.csvDelimiter".to_string(),
                    format!("'{}' cannot be used as a delimiter", delimiter.escape_default()),
                ));
            }
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            let name = field.system_field.trim();
            if name.is_empty() {
                problems.push((
                    "importMapping.fields".to_string(),
                    "systemField must not be empty".to_string(),
                ));
                continue;
            }
            if !seen.insert(name) {
                problems.push((
                    format!("importMapping.fields.{}", name),
                    "duplicate systemField".to_string(),
                ));
            }
            if field.required && field.source_column.trim().is_empty() {
                problems.push((
                    format!("importMapping.fields.{}", name),
                    "required field must reference a sourceColumn".to_string(),
                ));
            }
        }

        problems
    }
}
