//! 取込ファイルの読込（CSV / Excel）

use std::io::Cursor;

use calamine::{open_workbook_from_rs, Data, DataType as _, Reader, Xls, Xlsx};
use chrono::NaiveDateTime;
use tracing::debug;

use super::mapping::{FileKind, ImportMapping};
use crate::error::ScraperError;

/// セルの値（表計算ファイルでは型情報を残す）
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    DateTime(NaiveDateTime),
}

impl Cell {
    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            Cell::Number(_) | Cell::DateTime(_) => false,
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Cell::Number(n) => n.to_string(),
            Cell::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

/// 1行分（`row_number` はファイル上の1始まりの行番号）
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub row_number: usize,
    pub cells: Vec<Cell>,
}

impl SourceRow {
    pub fn cell(&self, index: usize) -> &Cell {
        self.cells.get(index).unwrap_or(&Cell::Empty)
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(Cell::is_blank)
    }
}

pub fn read_rows(bytes: &[u8], mapping: &ImportMapping) -> Result<Vec<SourceRow>, ScraperError> {
    match mapping.file_kind {
        FileKind::Csv => read_csv(bytes, mapping.delimiter()),
        FileKind::Xlsx => read_sheet::<Xlsx<_>>(bytes),
        FileKind::Xls => read_sheet::<Xls<_>>(bytes),
    }
}

/// UTF-8 でなければ Latin-1 とみなす
fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            debug!("CSV is not valid UTF-8, decoding as Latin-1");
            bytes.iter().map(|&b| b as char).collect()
        }
    }
}

fn read_csv(bytes: &[u8], delimiter: u8) -> Result<Vec<SourceRow>, ScraperError> {
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());

    let mut lines = LineCounter::new(text.as_bytes());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ScraperError::ArtifactUnreadable(format!("CSV: {}", e)))?;
        let row_number = match record.position() {
            Some(p) => lines.line_at(p.byte() as usize),
            None => rows.len() + 1,
        };
        let cells = record
            .iter()
            .map(|value| {
                if value.is_empty() {
                    Cell::Empty
                } else {
                    Cell::Text(value.to_string())
                }
            })
            .collect();
        rows.push(SourceRow { row_number, cells });
    }
    Ok(rows)
}

/// バイト位置からファイル上の行番号を求める
///
/// csv の `Position::line` は空行を数えないため、改行を自前で数える。
/// レコードの開始位置は前のレコードの終端直後を指すことがあるので、
/// 続く改行を読み飛ばしてから数える。
struct LineCounter<'a> {
    text: &'a [u8],
    offset: usize,
    line: usize,
}

impl<'a> LineCounter<'a> {
    fn new(text: &'a [u8]) -> Self {
        Self {
            text,
            offset: 0,
            line: 1,
        }
    }

    fn line_at(&mut self, byte: usize) -> usize {
        let mut start = byte.min(self.text.len());
        while start < self.text.len() && matches!(self.text[start], b'\r' | b'\n') {
            start += 1;
        }
        if start > self.offset {
            self.line += self.text[self.offset..start]
                .iter()
                .filter(|&&b| b == b'\n')
                .count();
            self.offset = start;
        }
        self.line
    }
}

fn read_sheet<R>(bytes: &[u8]) -> Result<Vec<SourceRow>, ScraperError>
where
    R: Reader<Cursor<Vec<u8>>>,
    R::Error: std::fmt::Display,
{
    let unreadable = |e: R::Error| ScraperError::ArtifactUnreadable(format!("spreadsheet: {}", e));

    let mut workbook: R = open_workbook_from_rs(Cursor::new(bytes.to_vec())).map_err(unreadable)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ScraperError::ArtifactUnreadable("spreadsheet has no worksheet".into()))?
        .map_err(unreadable)?;

    // Range は最初の非空セルから始まるので絶対位置に戻す
    let (start_row, start_col) = match range.start() {
        Some((r, c)) => (r as usize, c as usize),
        None => return Ok(Vec::new()),
    };

    let rows = range
        .rows()
        .enumerate()
        .map(|(i, row)| {
            let mut cells = vec![Cell::Empty; start_col];
            cells.extend(row.iter().map(sheet_cell));
            SourceRow {
                row_number: start_row + i + 1,
                cells,
            }
        })
        .collect();
    Ok(rows)
}

fn sheet_cell(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::String(s) => Cell::Text(s.clone()),
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Text(b.to_string()),
        Data::DateTime(_) => match data.as_datetime() {
            Some(dt) => Cell::DateTime(dt),
            None => Cell::Text(data.to_string()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
        Data::Error(e) => Cell::Text(format!("#{:?}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::mapping::FieldMapping;

    fn csv_mapping(delimiter: Option<char>) -> ImportMapping {
        ImportMapping {
            file_kind: FileKind::Csv,
            header_row: 1,
            first_data_row: 2,
            csv_delimiter: delimiter,
            fields: vec![FieldMapping::new("a", "A", super::super::DataType::Text, false)],
        }
    }

    #[test]
    fn test_csv_keeps_file_line_numbers() {
        let data = "Data;Valor\n04/11/2024;10,00\n\n05/11/2024;\"1.234,50\"\n";
        let rows = read_rows(data.as_bytes(), &csv_mapping(Some(';'))).unwrap();
        let numbers: Vec<_> = rows.iter().map(|r| r.row_number).collect();
        assert_eq!(numbers, vec![1, 2, 4]);
        assert_eq!(rows[2].cell(1), &Cell::Text("1.234,50".into()));
        assert_eq!(rows[0].cell(5), &Cell::Empty);
    }

    #[test]
    fn test_csv_line_numbers_count_leading_blank_lines() {
        let data = "Weekly statement\n\nDate,Amount\r\n\r\n04/11/2024,12.40\n";
        let rows = read_rows(data.as_bytes(), &csv_mapping(None)).unwrap();
        let numbers: Vec<_> = rows.iter().map(|r| r.row_number).collect();
        assert_eq!(numbers, vec![1, 3, 5]);
    }

    #[test]
    fn test_csv_quoted_newline_spans_lines() {
        let data = "Note,Amount\n\"two\nlines\",1\n\nlast,2\n";
        let rows = read_rows(data.as_bytes(), &csv_mapping(None)).unwrap();
        let numbers: Vec<_> = rows.iter().map(|r| r.row_number).collect();
        assert_eq!(numbers, vec![1, 2, 5]);
        assert_eq!(rows[1].cell(0), &Cell::Text("two\nlines".into()));
    }

    #[test]
    fn test_csv_latin1_and_bom() {
        let mut bytes = b"\xEF\xBB\xBFMotorista,Pedagio\n".to_vec();
        assert_eq!(
            read_rows(&bytes, &csv_mapping(None)).unwrap()[0].cell(0),
            &Cell::Text("Motorista".into())
        );

        bytes = b"Jos\xE9,Ped\xE1gio\n".to_vec();
        let rows = read_rows(&bytes, &csv_mapping(None)).unwrap();
        assert_eq!(rows[0].cell(0), &Cell::Text("José".into()));
    }

    #[test]
    fn test_garbage_spreadsheet_is_unreadable() {
        let mut mapping = csv_mapping(None);
        mapping.file_kind = FileKind::Xlsx;
        match read_rows(b"not a zip archive", &mapping) {
            Err(ScraperError::ArtifactUnreadable(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_number_cell_text() {
        assert_eq!(Cell::Number(42.0).to_text(), "42");
        assert_eq!(Cell::Number(12.5).to_text(), "12.5");
    }
}
