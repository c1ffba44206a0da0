//! Streaming reader for pipe-delimited crash reports.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use csv::{ByteRecord, ReaderBuilder, Trim};
use flate2::read::MultiGzDecoder;

use crate::error::ImportError;
use crate::record::{Header, ParseError, Record, AVIATION_FIELDS, DELIMITER};

/// Opens `path`, decompressing on the fly when it ends in `.gz`.
pub fn open_input(path: &Path) -> std::io::Result<Box<dyn Read + Send>> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        log::info!("Gunzipping {} ...", path.display());
        Ok(Box::new(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

/// Yields one [`Record`] per data line. The first line is the header. A blank
/// line between records is an error like any other malformed row.
pub struct RecordReader<R: Read> {
    reader: csv::Reader<R>,
    header: Arc<Header>,
    raw: ByteRecord,
    last_line: u64,
    deferred: Option<Result<Record, ImportError>>,
}

impl RecordReader<Box<dyn Read + Send>> {
    pub fn open(path: &Path) -> Result<Self, ImportError> {
        RecordReader::from_reader(open_input(path)?)
    }
}

impl<R: Read> RecordReader<R> {
    pub fn from_reader(input: R) -> Result<RecordReader<R>, ImportError> {
        let mut reader = ReaderBuilder::new()
            .delimiter(DELIMITER as u8)
            .has_headers(false)
            .quoting(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(input);

        let mut raw = ByteRecord::new();
        if !reader.read_byte_record(&mut raw)? {
            return Err(ImportError::EmptyInput);
        }
        let header = Header::from_fields(lossy_fields(&raw)).map_err(|source| ImportError::Record {
            line: line_of(&raw),
            source,
        })?;
        if !header.names().iter().map(String::as_str).eq(AVIATION_FIELDS) {
            log::debug!(
                "Header has {} column(s) and does not follow the NTSB export layout",
                header.len()
            );
        }

        Ok(RecordReader {
            reader,
            header: Arc::new(header),
            last_line: line_of(&raw),
            raw,
            deferred: None,
        })
    }

    pub fn header(&self) -> &Arc<Header> {
        &self.header
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Record, ImportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(deferred) = self.deferred.take() {
            return Some(deferred);
        }
        match self.reader.read_byte_record(&mut self.raw) {
            Ok(false) => None,
            Ok(true) => {
                let line = line_of(&self.raw);
                let fields = lossy_fields(&self.raw);
                let record = Record::from_fields(&self.header, fields.iter().map(AsRef::as_ref))
                    .map_err(|source| ImportError::Record { line, source });

                // csv skips empty lines, so they show up as a gap in line numbers.
                let blank = self.last_line + 1;
                self.last_line = line;
                if line > blank {
                    self.deferred = Some(record);
                    return Some(Err(ImportError::Record {
                        line: blank,
                        source: ParseError::FieldCount {
                            expected: self.header.len(),
                            found: 0,
                        },
                    }));
                }
                Some(record)
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}

fn lossy_fields(raw: &ByteRecord) -> Vec<Cow<'_, str>> {
    raw.iter().map(String::from_utf8_lossy).collect()
}

fn line_of(raw: &ByteRecord) -> u64 {
    raw.position().map_or(0, |position| position.line())
}
