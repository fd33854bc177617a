//! JSON-lines manifests exported by a data-pool scanner
//!
//! One [`ScannedObject`] per line; blank lines are ignored.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use super::objects::ScannedObject;
use crate::error::{Result, ScanError};

pub struct ManifestSource<R> {
    lines: Lines<R>,
    line_no: usize,
}

impl ManifestSource<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        tracing::info!("Reading manifest {}", path.as_ref().display());
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> ManifestSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for ManifestSource<R> {
    type Item = Result<ScannedObject>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(|e| {
                tracing::warn!("Manifest line {} unreadable: {}", self.line_no, e);
                ScanError::Json(e)
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    #[test]
    fn test_reads_lines_and_skips_blanks() {
        let text = concat!(
            r#"{"oid":"2a.00000000","size":5,"mtime":"2024-01-01T00:00:00Z","chunk_size":4096}"#,
            "\n\n",
            "not json\n",
            r#"{"oid":"2b.00000000","size":6,"mtime":"2024-01-01T00:00:00Z","parent":"0102"}"#,
            "\n",
        );
        let items: Vec<_> = ManifestSource::new(Cursor::new(text)).collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().chunk_size, Some(4096));
        assert!(matches!(items[1], Err(ScanError::Json(_))));
        assert_eq!(items[2].as_ref().unwrap().parent, Some(vec![1, 2]));
    }

    #[test]
    fn test_open_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"oid":"2a.00000000","size":5,"mtime":"2024-01-01T00:00:00Z"}}"#
        )
        .unwrap();
        let objects: Vec<_> = ManifestSource::open(file.path())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].oid, "2a.00000000");
    }
}
