//! 取込マッピング
//!
//! ダウンロードした表形式ファイルを列マッピングに従って正規化する。

mod coerce;
mod interpreter;
mod mapping;
mod reader;

pub use coerce::{parse_date, parse_decimal, FieldValue};
pub use interpreter::{
    interpret, FieldRejection, ImportOutcome, NormalizedRow, RejectedRow, RowWarning,
};
pub use mapping::{DataType, FieldMapping, FileKind, ImportMapping};
pub use reader::Cell;
