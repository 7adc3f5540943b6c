//! CSV export of report rows

use opsync_core::{OpsyncError, Result};
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

/// A record with a fixed column layout
pub trait Tabular {
    fn headers() -> &'static [&'static str];

    /// Field values in header order
    fn row(&self) -> Vec<String>;
}

/// Write `records` to `path` as CSV with a header row. Returns the number of
/// records written. Nothing is written for an empty slice.
pub fn export_csv<T: Tabular>(records: &[T], path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    if records.is_empty() {
        warn!("No data to export");
        return Ok(0);
    }

    let file = File::create(path).map_err(|e| {
        OpsyncError::Export(format!("cannot create {}: {}", path.display(), e))
    })?;
    let mut writer = BufWriter::new(file);
    let written = write_csv(records, &mut writer)?;
    writer.flush()?;

    info!(rows = written, path = %path.display(), "Exported records");
    Ok(written)
}

/// Write header and rows to any writer.
pub fn write_csv<T: Tabular, W: Write>(records: &[T], mut writer: W) -> Result<usize> {
    write_line(&mut writer, T::headers().iter().copied())?;
    for record in records {
        let row = record.row();
        write_line(&mut writer, row.iter().map(String::as_str))?;
    }
    Ok(records.len())
}

fn write_line<'a, W: Write>(writer: &mut W, fields: impl Iterator<Item = &'a str>) -> Result<()> {
    let line = fields.map(escape_field).collect::<Vec<_>>().join(",");
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\r\n")?;
    Ok(())
}

/// Quote a field when it contains a delimiter, quote or line break.
fn escape_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\r', '\n']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Customer {
        id: i64,
        name: &'static str,
    }

    impl Tabular for Customer {
        fn headers() -> &'static [&'static str] {
            &["customer_id", "customer_name"]
        }

        fn row(&self) -> Vec<String> {
            vec![self.id.to_string(), self.name.to_string()]
        }
    }

    #[test]
    fn test_write_csv_with_header() {
        let records = [
            Customer { id: 7, name: "Ana" },
            Customer { id: 9, name: "Lee, Bo" },
        ];
        let mut out = Vec::new();
        let written = write_csv(&records, &mut out).unwrap();

        assert_eq!(written, 2);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "customer_id,customer_name\r\n7,Ana\r\n9,\"Lee, Bo\"\r\n"
        );
    }

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn test_export_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("top_customers.csv");

        let written = export_csv(&[Customer { id: 1, name: "Ana" }], &path).unwrap();
        assert_eq!(written, 1);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "customer_id,customer_name\r\n1,Ana\r\n"
        );
    }

    #[test]
    fn test_empty_export_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");

        let records: Vec<Customer> = Vec::new();
        assert_eq!(export_csv(&records, &path).unwrap(), 0);
        assert!(!path.exists());
    }
}
