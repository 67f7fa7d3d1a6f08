//! JSONL output artifact
//!
//! One record per successful line, appended in line order:
//! `{"line_number": 0, "answer": "..."}`.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::Result;
use crate::util::constants::{LINE_NUMBER_KEY, OUTPUT_FILE_NAME};

/// `{"line_number": n, ...output}`; the line number always wins
fn record(line_number: usize, output: &Map<String, Value>) -> Map<String, Value> {
    let mut record = Map::with_capacity(output.len() + 1);
    record.insert(LINE_NUMBER_KEY.to_string(), Value::from(line_number));
    for (k, v) in output {
        if k != LINE_NUMBER_KEY {
            record.insert(k.clone(), v.clone());
        }
    }
    record
}

/// Sink for per-line output records
pub trait OutputWriter: Send {
    fn append(&mut self, line_number: usize, output: &Map<String, Value>) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct JsonlOutputWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JsonlOutputWriter {
    /// Create (or truncate) `output.jsonl` inside `dir`
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(OUTPUT_FILE_NAME);
        let out = BufWriter::new(File::create(&path)?);
        Ok(Self { path, out })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OutputWriter for JsonlOutputWriter {
    fn append(&mut self, line_number: usize, output: &Map<String, Value>) -> Result<()> {
        serde_json::to_writer(&mut self.out, &record(line_number, output))?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// In-memory writer, handy for embedding and tests
impl OutputWriter for Vec<Map<String, Value>> {
    fn append(&mut self, line_number: usize, output: &Map<String, Value>) -> Result<()> {
        self.push(record(line_number, output));
        Ok(())
    }
}
