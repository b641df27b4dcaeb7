//! Spreadsheet reading for CSV and Excel (.xlsx/.xlsm/.xlsb).
//!
//! Values only, no formatting. Rows keep their absolute positions so that
//! merged-cell coordinates line up with row indices.

use crate::error::SheetError;
use crate::model::{CellValue, MergedCellRange, Rows};
use calamine::{Data, Range, Reader, Xlsb, Xlsx};
use std::io::Cursor;

/// An opened workbook, ready to serve rows and merged ranges per sheet.
pub enum Workbook {
    Csv { name: String, rows: Rows },
    Xlsx(Box<Xlsx<Cursor<Vec<u8>>>>),
    Xlsb(Box<Xlsb<Cursor<Vec<u8>>>>),
}

/// Open a workbook, dispatching on the file extension.
pub fn open_workbook(filename: &str, data: &[u8]) -> Result<Workbook, SheetError> {
    let ext = filename.rsplit('.').next().unwrap_or("").to_lowercase();

    match ext.as_str() {
        "csv" => Ok(Workbook::Csv {
            name: sheet_name_from_path(filename),
            rows: parse_csv(data)?,
        }),
        "xlsx" | "xlsm" => {
            let mut workbook = Xlsx::new(Cursor::new(data.to_vec()))
                .map_err(|e| SheetError::Workbook(e.to_string()))?;
            if let Err(e) = workbook.load_merged_regions() {
                tracing::warn!("Merged regions unavailable for {}: {}", filename, e);
            }
            Ok(Workbook::Xlsx(Box::new(workbook)))
        }
        "xlsb" => {
            let workbook = Xlsb::new(Cursor::new(data.to_vec()))
                .map_err(|e| SheetError::Workbook(e.to_string()))?;
            Ok(Workbook::Xlsb(Box::new(workbook)))
        }
        _ => Err(SheetError::UnsupportedFormat(ext)),
    }
}

impl Workbook {
    pub fn sheet_names(&self) -> Vec<String> {
        match self {
            Self::Csv { name, .. } => vec![name.clone()],
            Self::Xlsx(wb) => wb.sheet_names().to_vec(),
            Self::Xlsb(wb) => wb.sheet_names().to_vec(),
        }
    }

    fn sheet_name(&self, sheet_index: usize) -> Result<String, SheetError> {
        let names = self.sheet_names();
        names
            .get(sheet_index)
            .cloned()
            .ok_or(SheetError::SheetIndex {
                index: sheet_index,
                available: names.len(),
            })
    }

    /// First `max_rows` rows of a sheet, values only.
    pub fn read_rows(&mut self, sheet_index: usize, max_rows: usize) -> Result<Rows, SheetError> {
        let name = self.sheet_name(sheet_index)?;
        let range = match self {
            Self::Csv { rows, .. } => return Ok(rows.iter().take(max_rows).cloned().collect()),
            Self::Xlsx(wb) => wb
                .worksheet_range(&name)
                .map_err(|e| SheetError::Workbook(e.to_string()))?,
            Self::Xlsb(wb) => wb
                .worksheet_range(&name)
                .map_err(|e| SheetError::Workbook(e.to_string()))?,
        };
        Ok(range_to_rows(&range, max_rows))
    }

    /// Merged regions of a sheet. Formats without merge metadata yield none.
    pub fn read_merged_ranges(&mut self, sheet_index: usize) -> Result<Vec<MergedCellRange>, SheetError> {
        let name = self.sheet_name(sheet_index)?;
        let Self::Xlsx(wb) = self else {
            return Ok(Vec::new());
        };

        let dims: Vec<calamine::Dimensions> = wb
            .merged_regions_by_sheet(&name)
            .into_iter()
            .map(|(_, _, dims)| *dims)
            .collect();
        if dims.is_empty() {
            return Ok(Vec::new());
        }

        let range = wb
            .worksheet_range(&name)
            .map_err(|e| SheetError::Workbook(e.to_string()))?;
        Ok(dims
            .into_iter()
            .map(|d| {
                let merged = dimensions_to_range(d);
                match range.get_value(d.start) {
                    Some(cell) if !matches!(cell, Data::Empty) => {
                        merged.with_value(cell_to_value(cell).text())
                    }
                    _ => merged,
                }
            })
            .collect())
    }
}

fn dimensions_to_range(d: calamine::Dimensions) -> MergedCellRange {
    MergedCellRange::new(
        d.start.0 as usize,
        d.end.0 as usize,
        d.start.1 as usize,
        d.end.1 as usize,
    )
}

fn parse_csv(data: &[u8]) -> Result<Rows, SheetError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_reader(data);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            record
                .iter()
                .map(|f| {
                    if f.trim().is_empty() {
                        CellValue::Empty
                    } else {
                        CellValue::Text(f.to_string())
                    }
                })
                .collect(),
        );
    }
    Ok(rows)
}

fn sheet_name_from_path(filename: &str) -> String {
    filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename)
        .trim_end_matches(".csv")
        .to_string()
}

/// Convert a calamine range into absolute-position rows.
/// A range that does not start at A1 is padded with empty rows/cells.
fn range_to_rows(range: &Range<Data>, max_rows: usize) -> Rows {
    let (start_row, start_col) = range
        .start()
        .map(|(r, c)| (r as usize, c as usize))
        .unwrap_or((0, 0));

    let mut rows: Rows = (0..start_row.min(max_rows)).map(|_| Vec::new()).collect();
    for row in range.rows().take(max_rows.saturating_sub(rows.len())) {
        let mut values = vec![CellValue::Empty; start_col];
        values.extend(row.iter().map(cell_to_value));
        while matches!(values.last(), Some(CellValue::Empty)) {
            values.pop();
        }
        rows.push(values);
    }
    rows
}

fn cell_to_value(cell: &Data) -> CellValue {
    match cell {
        Data::Empty => CellValue::Empty,
        Data::String(s) if s.trim().is_empty() => CellValue::Empty,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Float(f) => CellValue::Number(*f),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ts) if ts.time() == chrono::NaiveTime::MIN => {
                CellValue::Text(ts.format("%Y-%m-%d").to_string())
            }
            Some(ts) => CellValue::Text(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
            None => CellValue::Number(dt.as_f64()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(e) => CellValue::Text(format!("#ERR:{:?}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_keeps_all_rows() {
        let data = "月度经营报表,,\n单位: 元,,\n项目,预算,实际\n收入,100,110\n".as_bytes();
        let mut wb = open_workbook("reports/2025.csv", data).unwrap();
        assert_eq!(wb.sheet_names(), vec!["2025"]);

        let rows = wb.read_rows(0, 10).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0][0], CellValue::Text("月度经营报表".into()));
        assert_eq!(rows[0][1], CellValue::Empty);
        assert_eq!(rows[3][2], CellValue::Text("110".into()));
        assert!(wb.read_merged_ranges(0).unwrap().is_empty());
    }

    #[test]
    fn test_csv_max_rows() {
        let data = b"a,b\n1,2\n3,4\n5,6\n";
        let mut wb = open_workbook("t.csv", data).unwrap();
        assert_eq!(wb.read_rows(0, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_sheet_index_out_of_range() {
        let mut wb = open_workbook("t.csv", b"a,b\n").unwrap();
        let err = wb.read_rows(3, 10).unwrap_err();
        assert!(matches!(err, SheetError::SheetIndex { index: 3, available: 1 }));
    }

    #[test]
    fn test_unsupported_extension() {
        let err = open_workbook("notes.txt", b"data").err().unwrap();
        assert!(matches!(err, SheetError::UnsupportedFormat(ext) if ext == "txt"));
    }

    #[test]
    fn test_corrupt_excel_is_workbook_error() {
        let err = open_workbook("budget.xlsx", b"not a zip").err().unwrap();
        assert!(matches!(err, SheetError::Workbook(_)));
        let err = open_workbook("budget.xlsb", b"not a zip").err().unwrap();
        assert!(matches!(err, SheetError::Workbook(_)));
    }

    #[test]
    fn test_range_offset_padding() {
        let mut range: Range<Data> = Range::new((1, 1), (2, 2));
        range.set_value((1, 1), Data::String("项目".into()));
        range.set_value((2, 2), Data::Float(12.5));

        let rows = range_to_rows(&range, 10);
        assert_eq!(rows.len(), 3);
        assert!(rows[0].is_empty());
        assert_eq!(rows[1], vec![CellValue::Empty, CellValue::Text("项目".into())]);
        assert_eq!(
            rows[2],
            vec![CellValue::Empty, CellValue::Empty, CellValue::Number(12.5)]
        );
    }
}
