//! 取込マッピングの解釈
//!
//! ダウンロードしたファイルを行単位で正規化する。行単位の変換エラーは
//! その行を除外するだけで、ファイル全体の処理は止めない。

use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use super::coerce::{coerce, FieldValue};
use super::mapping::ImportMapping;
use super::reader::{read_rows, Cell, SourceRow};
use crate::error::{ErrorKind, ScraperError};

/// 正規化済みの1行
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRow {
    /// ファイル上の行番号（1始まり）
    pub row_number: usize,
    /// データ行としての通し番号（1始まり）
    pub data_row: usize,
    pub values: IndexMap<String, FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRejection {
    pub kind: ErrorKind,
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedRow {
    pub row_number: usize,
    pub data_row: usize,
    pub reasons: Vec<FieldRejection>,
}

/// 任意項目の変換失敗（値は null になる）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowWarning {
    pub row_number: usize,
    pub data_row: usize,
    pub kind: ErrorKind,
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    /// 見出し行（診断用）
    pub headers: Vec<String>,
    pub records: Vec<NormalizedRow>,
    pub rejected: Vec<RejectedRow>,
    pub warnings: Vec<RowWarning>,
    /// 解決できなかった sourceColumn
    pub unresolved_columns: Vec<String>,
}

/// ファイルとマッピングから正規化レコードを作る（副作用なし）
pub fn interpret(bytes: &[u8], mapping: &ImportMapping) -> Result<ImportOutcome, ScraperError> {
    let rows = read_rows(bytes, mapping)?;

    let header_row = mapping.header_row as usize;
    let first_data_row = mapping.first_data_row as usize;

    let headers: Vec<String> = rows
        .iter()
        .find(|r| r.row_number == header_row)
        .map(|r| r.cells.iter().map(|c| c.to_text().trim().to_string()).collect())
        .unwrap_or_default();

    let mut outcome = ImportOutcome {
        headers,
        ..Default::default()
    };

    let columns: Vec<Option<usize>> = mapping
        .fields
        .iter()
        .map(|f| resolve_column(&f.source_column, &outcome.headers))
        .collect();
    for (field, column) in mapping.fields.iter().zip(&columns) {
        if column.is_none() && !outcome.unresolved_columns.contains(&field.source_column) {
            outcome.unresolved_columns.push(field.source_column.clone());
        }
    }

    let data_rows = rows
        .iter()
        .filter(|r| r.row_number >= first_data_row && !r.is_blank());

    for (i, row) in data_rows.enumerate() {
        normalize_row(row, i + 1, mapping, &columns, &mut outcome);
    }

    debug!(
        records = outcome.records.len(),
        rejected = outcome.rejected.len(),
        "import mapping interpreted"
    );
    Ok(outcome)
}

fn normalize_row(
    row: &SourceRow,
    data_row: usize,
    mapping: &ImportMapping,
    columns: &[Option<usize>],
    outcome: &mut ImportOutcome,
) {
    let mut values = IndexMap::with_capacity(mapping.fields.len());
    let mut reasons = Vec::new();

    for (field, column) in mapping.fields.iter().zip(columns) {
        let cell = match column {
            Some(index) => row.cell(*index).clone(),
            None => Cell::Empty,
        };

        let result = if cell.is_blank() {
            Err(match column {
                Some(_) => format!("column '{}' is empty", field.source_column),
                None => format!("column '{}' not found", field.source_column),
            })
        } else {
            coerce(&cell, field.data_type)
        };

        match result {
            Ok(value) => {
                values.insert(field.system_field.clone(), value);
            }
            Err(reason) if field.required => reasons.push(FieldRejection {
                kind: ErrorKind::RowCoercionError,
                field: field.system_field.clone(),
                reason,
            }),
            Err(reason) => {
                if !cell.is_blank() {
                    outcome.warnings.push(RowWarning {
                        row_number: row.row_number,
                        data_row,
                        kind: ErrorKind::RowCoercionError,
                        field: field.system_field.clone(),
                        reason,
                    });
                }
                values.insert(field.system_field.clone(), FieldValue::Null);
            }
        }
    }

    if reasons.is_empty() {
        outcome.records.push(NormalizedRow {
            row_number: row.row_number,
            data_row,
            values,
        });
    } else {
        outcome.rejected.push(RejectedRow {
            row_number: row.row_number,
            data_row,
            reasons,
        });
    }
}

/// 見出し名 → 列記号 → 列番号の順に解決する
fn resolve_column(source: &str, headers: &[String]) -> Option<usize> {
    let source = source.trim();
    if source.is_empty() {
        return None;
    }

    if let Some(index) = headers.iter().position(|h| h.eq_ignore_ascii_case(source)) {
        return Some(index);
    }

    if source.len() <= 3 && source.chars().all(|c| c.is_ascii_uppercase()) {
        let index = source
            .bytes()
            .fold(0usize, |acc, b| acc * 26 + (b - b'A' + 1) as usize);
        return Some(index - 1);
    }

    match source.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n - 1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::{DataType, FieldMapping, FileKind};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn mapping() -> ImportMapping {
        ImportMapping {
            file_kind: FileKind::Csv,
            header_row: 1,
            first_data_row: 2,
            csv_delimiter: None,
            fields: vec![
                FieldMapping::new("date", "Date", DataType::Date, true),
                FieldMapping::new("amount", "Amount", DataType::Currency, true),
                FieldMapping::new("note", "C", DataType::Text, false),
            ],
        }
    }

    const CSV: &str = "Date,Amount,Note\n\
                       04/11/2024,\"R$ 10,50\",first\n\
                       05/11/2024,,second\n\
                       06/11/2024,7.25,  third  \n";

    #[test]
    fn test_blank_required_cell_rejects_only_that_row() {
        let outcome = interpret(CSV.as_bytes(), &mapping()).unwrap();

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.rejected.len(), 1);

        let rejected = &outcome.rejected[0];
        assert_eq!(rejected.data_row, 2);
        assert_eq!(rejected.row_number, 3);
        assert_eq!(rejected.reasons.len(), 1);
        assert_eq!(rejected.reasons[0].field, "amount");
        assert_eq!(rejected.reasons[0].kind, ErrorKind::RowCoercionError);

        // 元の行順を保つ
        let data_rows: Vec<_> = outcome.records.iter().map(|r| r.data_row).collect();
        assert_eq!(data_rows, vec![1, 3]);

        let first = &outcome.records[0].values;
        assert_eq!(
            first["date"],
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 11, 4).unwrap())
        );
        assert_eq!(first["amount"], FieldValue::Number("10.50".parse::<Decimal>().unwrap()));
        assert_eq!(outcome.records[1].values["note"], FieldValue::Text("third".into()));
        assert_eq!(outcome.headers, vec!["Date", "Amount", "Note"]);
    }

    #[test]
    fn test_interpret_is_idempotent() {
        let mapping = mapping();
        let a = interpret(CSV.as_bytes(), &mapping).unwrap();
        let b = interpret(CSV.as_bytes(), &mapping).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_optional_field_coercion_failure_is_a_warning() {
        let mut mapping = mapping();
        mapping.fields.push(FieldMapping::new("km", "4", DataType::Number, false));
        let csv = "Date,Amount,Note,Km\n04/11/2024,1,a,n/a\n05/11/2024,2,b,\n";

        let outcome = interpret(csv.as_bytes(), &mapping).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[0].values["km"], FieldValue::Null);
        assert_eq!(outcome.records[1].values["km"], FieldValue::Null);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].field, "km");
        assert_eq!(outcome.warnings[0].data_row, 1);
        assert_eq!(outcome.warnings[0].kind, ErrorKind::RowCoercionError);
    }

    #[test]
    fn test_unresolved_required_column_rejects_rows() {
        let mut mapping = mapping();
        mapping.fields[1].source_column = "Valor Total".into();

        let outcome = interpret(CSV.as_bytes(), &mapping).unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.rejected.len(), 3);
        assert_eq!(outcome.unresolved_columns, vec!["Valor Total".to_string()]);
        assert!(outcome.rejected[0].reasons[0].reason.contains("not found"));
    }

    #[test]
    fn test_coercion_failure_reason_is_per_field() {
        let csv = "Date,Amount,Note\nyesterday,abc,x\n";
        let outcome = interpret(csv.as_bytes(), &mapping()).unwrap();
        let fields: Vec<_> = outcome.rejected[0]
            .reasons
            .iter()
            .map(|r| r.field.as_str())
            .collect();
        assert_eq!(fields, vec!["date", "amount"]);
    }

    #[test]
    fn test_header_and_first_data_row_offsets() {
        let mut mapping = mapping();
        mapping.header_row = 2;
        mapping.first_data_row = 4;
        mapping.csv_delimiter = Some(';');
        let csv = "Relatorio semanal;;\nDate;Amount;Note\n-;-;-\n04/11/2024;3,00;x\n\n";

        let outcome = interpret(csv.as_bytes(), &mapping).unwrap();
        assert_eq!(outcome.headers, vec!["Date", "Amount", "Note"]);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].row_number, 4);
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn test_blank_lines_above_header_keep_row_window() {
        let mut mapping = mapping();
        mapping.header_row = 3;
        mapping.first_data_row = 4;
        mapping.fields.truncate(2);
        let csv = "Weekly statement\n\nDate,Amount\n04/11/2024,12.40\n";

        let outcome = interpret(csv.as_bytes(), &mapping).unwrap();
        assert_eq!(outcome.headers, vec!["Date", "Amount"]);
        assert!(outcome.unresolved_columns.is_empty());
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].row_number, 4);
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn test_resolve_column() {
        let headers = vec!["Data".to_string(), "Valor".to_string()];
        assert_eq!(resolve_column("valor", &headers), Some(1));
        assert_eq!(resolve_column("A", &headers), Some(0));
        assert_eq!(resolve_column("AB", &headers), Some(27));
        assert_eq!(resolve_column("3", &headers), Some(2));
        assert_eq!(resolve_column("0", &headers), None);
        assert_eq!(resolve_column("Motorista", &headers), None);
    }
}
