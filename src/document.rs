use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{FerretError, Result};
use crate::models::FileType;
use crate::normalize::{fold, normalize_date, parse_amount, DEFAULT_PIVOT_YEAR};

/// OLE compound file header; password-protected XLSX files are wrapped in one.
const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Header row plus data rows of a delimited or spreadsheet document.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Build a table from raw records, skipping any preamble above the header row.
    pub fn from_records(records: Vec<Vec<String>>) -> Option<Table> {
        let header_idx = find_header_row(&records)?;
        let mut iter = records.into_iter().skip(header_idx);
        let headers: Vec<String> = iter.next()?.into_iter().map(|h| h.trim().to_string()).collect();
        let rows = iter
            .filter(|r| r.iter().any(|c| !c.trim().is_empty()))
            .collect();
        Some(Table { headers, rows })
    }

    /// Learning key: hash of the folded, ordered header names.
    pub fn signature(&self) -> String {
        let joined = self
            .headers
            .iter()
            .map(|h| fold(h))
            .collect::<Vec<_>>()
            .join("\u{1f}");
        hex::encode(Sha256::digest(joined.as_bytes()))
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        let wanted = fold(name);
        self.headers.iter().position(|h| fold(h) == wanted)
    }

    pub fn cell<'a>(&self, row: &'a [String], column: usize) -> &'a str {
        row.get(column).map(|c| c.trim()).unwrap_or("")
    }

    pub fn sample_rows(&self, n: usize) -> Vec<Vec<String>> {
        self.rows.iter().take(n).cloned().collect()
    }
}

/// The header is the first row at full width with at least two labels and no
/// cell that already looks like data (a date or an amount).
fn find_header_row(records: &[Vec<String>]) -> Option<usize> {
    let width = records.iter().map(|r| non_empty_width(r)).max()?;
    if width < 2 {
        return None;
    }
    records.iter().position(|r| {
        let filled = r.iter().filter(|c| !c.trim().is_empty()).count();
        non_empty_width(r) == width
            && filled >= 2
            && r.iter().all(|c| {
                let c = c.trim();
                normalize_date(c, DEFAULT_PIVOT_YEAR).is_none() && parse_amount(c).is_none()
            })
    })
}

fn non_empty_width(record: &[String]) -> usize {
    record
        .iter()
        .rposition(|c| !c.trim().is_empty())
        .map_or(0, |i| i + 1)
}

/// Read-only view of an uploaded document handed to every strategy.
#[derive(Debug, Clone)]
pub struct Document {
    pub file_type: FileType,
    pub table: Option<Table>,
    pub lines: Vec<String>,
    pub bytes: Vec<u8>,
}

impl Document {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn from_text(file_type: FileType, text: &str) -> Document {
        Document {
            file_type,
            table: None,
            lines: text_lines(text),
            bytes: text.as_bytes().to_vec(),
        }
    }
}

fn text_lines(text: &str) -> Vec<String> {
    text.lines().map(|l| l.trim_end().to_string()).collect()
}

pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn detect_file_type(file_path: &Path, bytes: &[u8]) -> Result<FileType> {
    let ext = file_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let by_ext = match ext.as_str() {
        "csv" | "tsv" => Some(FileType::Csv),
        "xlsx" | "xls" | "xlsm" | "ods" => Some(FileType::Spreadsheet),
        "pdf" => Some(FileType::Pdf),
        "txt" | "text" | "prn" => Some(FileType::Text),
        "png" | "jpg" | "jpeg" | "tif" | "tiff" | "heic" => Some(FileType::Image),
        _ => None,
    };
    if let Some(t) = by_ext {
        return Ok(t);
    }
    if bytes.starts_with(b"%PDF") {
        return Ok(FileType::Pdf);
    }
    if bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(&OLE_MAGIC) {
        return Ok(FileType::Spreadsheet);
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) || bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Ok(FileType::Image);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) if looks_delimited(text) => Ok(FileType::Csv),
        Ok(_) => Ok(FileType::Text),
        Err(_) => Err(FerretError::UnsupportedFile(file_path.display().to_string())),
    }
}

fn looks_delimited(text: &str) -> bool {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).take(5).collect();
    lines.len() >= 2 && lines.iter().all(|l| l.matches(',').count() >= 2)
}

/// Encryption markers only; decrypting is left to the upload layer.
pub fn is_encrypted(file_type: FileType, bytes: &[u8]) -> bool {
    match file_type {
        FileType::Pdf => bytes.windows(8).any(|w| w == b"/Encrypt"),
        // A modern workbook in an OLE container is an encrypted package.
        FileType::Spreadsheet => bytes.starts_with(&OLE_MAGIC) && contains(bytes, b"EncryptionInfo"),
        _ => false,
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

pub fn load_bytes(file_path: &Path, file_type: FileType, bytes: Vec<u8>) -> Result<Document> {
    if is_encrypted(file_type, &bytes) {
        return Err(FerretError::EncryptedDocument);
    }
    tracing::debug!(path = %file_path.display(), file_type = file_type.key(), size = bytes.len(), "loading document");
    match file_type {
        FileType::Csv => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let delimiter = if file_path
                .extension()
                .map_or(false, |e| e.eq_ignore_ascii_case("tsv"))
            {
                b'\t'
            } else {
                b','
            };
            let table = Table::from_records(read_delimited(&text, delimiter)?);
            Ok(Document {
                file_type,
                table,
                lines: text_lines(&text),
                bytes,
            })
        }
        FileType::Spreadsheet => load_spreadsheet(file_path, bytes),
        FileType::Text => Ok(Document::from_text(file_type, &String::from_utf8_lossy(&bytes))),
        // Rendering is an upstream concern; only the AI collaborator reads these bytes.
        FileType::Pdf | FileType::Image => Ok(Document {
            file_type,
            table: None,
            lines: Vec::new(),
            bytes,
        }),
    }
}

fn read_delimited(text: &str, delimiter: u8) -> Result<Vec<Vec<String>>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());
    let mut records = Vec::new();
    for result in rdr.records() {
        let record = result?;
        records.push(record.iter().map(|f| f.to_string()).collect());
    }
    Ok(records)
}

#[cfg(feature = "spreadsheet")]
fn load_spreadsheet(file_path: &Path, bytes: Vec<u8>) -> Result<Document> {
    use calamine::{Data, Reader};

    let mut workbook = calamine::open_workbook_auto(file_path)?;
    let mut records: Vec<Vec<String>> = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook.worksheet_range(&name)?;
        if range.is_empty() {
            continue;
        }
        for row in range.rows() {
            records.push(
                row.iter()
                    .map(|cell| match cell {
                        Data::String(s) => s.clone(),
                        Data::Float(f) => f.to_string(),
                        Data::Int(i) => i.to_string(),
                        Data::Bool(b) => b.to_string(),
                        Data::DateTime(dt) => {
                            crate::normalize::excel_serial_to_date(dt.as_f64()).unwrap_or_default()
                        }
                        Data::DateTimeIso(s) => s.clone(),
                        _ => String::new(),
                    })
                    .collect(),
            );
        }
        // First sheet with data wins.
        break;
    }
    let lines = records
        .iter()
        .map(|r| r.join("\t").trim_end().to_string())
        .collect();
    Ok(Document {
        file_type: FileType::Spreadsheet,
        table: Table::from_records(records),
        lines,
        bytes,
    })
}

#[cfg(not(feature = "spreadsheet"))]
fn load_spreadsheet(file_path: &Path, _bytes: Vec<u8>) -> Result<Document> {
    Err(FerretError::UnsupportedFile(format!(
        "{} (built without spreadsheet support)",
        file_path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(file_path: &Path) -> Result<Document> {
        let bytes = std::fs::read(file_path).unwrap();
        let file_type = detect_file_type(file_path, &bytes)?;
        load_bytes(file_path, file_type, bytes)
    }

    fn records(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_table_skips_preamble() {
        let recs = records(&[
            &["Description", "", "Summary Amt."],
            &["Beginning balance as of 01/01/2025", "", "1,000.00"],
            &[],
            &["Date", "Description", "Amount", "Running Bal."],
            &["01/15/2025", "ADOBE CREATIVE", "-50.00", "950.00"],
        ]);
        let table = Table::from_records(recs).unwrap();
        assert_eq!(table.headers, vec!["Date", "Description", "Amount", "Running Bal."]);
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn test_signature_ignores_case_and_spacing() {
        let a = Table { headers: vec!["Date".into(), "Desc".into()], rows: vec![] };
        let b = Table { headers: vec![" date ".into(), "DESC".into()], rows: vec![] };
        let c = Table { headers: vec!["Desc".into(), "Date".into()], rows: vec![] };
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn test_detect_file_type() {
        assert_eq!(detect_file_type(Path::new("a.CSV"), b"").unwrap(), FileType::Csv);
        assert_eq!(detect_file_type(Path::new("a.xlsx"), b"").unwrap(), FileType::Spreadsheet);
        assert_eq!(detect_file_type(Path::new("upload"), b"%PDF-1.7").unwrap(), FileType::Pdf);
        assert_eq!(
            detect_file_type(Path::new("upload"), b"a,b,c\n1,2,3\n").unwrap(),
            FileType::Csv
        );
        assert_eq!(
            detect_file_type(Path::new("upload"), b"12/31/2023 WALMART $45.67\n").unwrap(),
            FileType::Text
        );
    }

    #[test]
    fn test_encrypted_pdf_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.pdf");
        std::fs::write(&path, b"%PDF-1.4\n1 0 obj << /Encrypt 2 0 R >>\n").unwrap();
        assert!(matches!(load(&path), Err(FerretError::EncryptedDocument)));
    }

    #[test]
    fn test_load_csv_builds_table_and_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stmt.csv");
        std::fs::write(&path, "Date,Desc,Amt\n01/15/2024,Coffee Shop,4.50\n01/16/2024,Salary,-2000.00\n").unwrap();
        let doc = load(&path).unwrap();
        assert_eq!(doc.file_type, FileType::Csv);
        let table = doc.table.unwrap();
        assert_eq!(table.headers, vec!["Date", "Desc", "Amt"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(doc.lines.len(), 3);
    }

    #[test]
    fn test_load_text_has_no_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stmt.txt");
        std::fs::write(&path, "STATEMENT\n12/31/2023 WALMART $45.67\n").unwrap();
        let doc = load(&path).unwrap();
        assert!(doc.table.is_none());
        assert_eq!(doc.lines[1], "12/31/2023 WALMART $45.67");
    }
}
