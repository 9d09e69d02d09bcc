//! Byte sinks
//!
//! The diverging-request sink is an arbitrary byte writer supplied by
//! configuration; each diff produces one `write_record` call carrying the
//! raw request bytes.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// One record per call; implementations decide their own framing.
pub trait ByteSink: Send {
    fn write_record(&mut self, data: &[u8]) -> Result<()>;
}

/// Append-mode file sink, flushed per record so diverging requests survive a
/// crash.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(FileSink {
            writer: BufWriter::new(file),
        })
    }
}

impl ByteSink for FileSink {
    fn write_record(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        if !data.ends_with(b"\n") {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sink_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diffs.log");

        let mut sink = FileSink::open(&path).unwrap();
        sink.write_record(b"GET /a HTTP/1.1\r\n\r\n").unwrap();
        sink.write_record(b"GET /b HTTP/1.1\r\n\r\n").unwrap();
        drop(sink);

        let contents = std::fs::read(&path).unwrap();
        assert!(contents.starts_with(b"GET /a HTTP/1.1"));
        assert!(String::from_utf8_lossy(&contents).contains("GET /b"));
    }

    #[test]
    fn test_file_sink_reopens_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diffs.log");

        FileSink::open(&path)
            .unwrap()
            .write_record(b"first")
            .unwrap();
        FileSink::open(&path)
            .unwrap()
            .write_record(b"second")
            .unwrap();

        let contents = String::from_utf8(std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }
}
