use crate::{constants::TEXT_LOG_HEADER, state::BeatRecord};
use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufWriter, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Tab separated record log. Rows are buffered and only reach the file in batches,
/// on [`TextLog::write_batch`].
pub struct TextLog {
    file: BufWriter<File>,
    path: PathBuf,
}

impl TextLog {
    /// Truncate/create `path` and write the header row.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<TextLog, TextLogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| TextLogError::Open(path.clone(), e))?;
        let mut file = BufWriter::new(file);
        writeln!(file, "{}", TEXT_LOG_HEADER)?;
        Ok(TextLog { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_batch(&mut self, records: &[BeatRecord], min_target: f64, max_target: f64) -> Result<(), TextLogError> {
        for r in records {
            writeln!(
                self.file,
                "{}\t{}\t{}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{:.6}",
                r.beat,
                r.tag,
                r.timestamp,
                r.global_rate,
                r.window_rate,
                r.instant_rate,
                min_target,
                max_target
            )?;
        }
        self.file.flush()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), TextLogError> {
        self.file.flush()?;
        let file = self.file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

impl core::fmt::Debug for TextLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextLog").field("path", &self.path).finish()
    }
}

/// Decides when records in the ring go to the text log. A batch is written every time
/// the ring's write cursor wraps; whatever is left over is written at teardown.
#[derive(Debug, Default)]
pub struct FlushScheduler {
    log: Option<TextLog>,
    batches: u64,
}

impl FlushScheduler {
    pub fn new(log: Option<TextLog>) -> Self {
        FlushScheduler { log, batches: 0 }
    }

    pub fn has_log(&self) -> bool {
        self.log.is_some()
    }

    /// Number of batches handed to `flush` so far, whether or not a log is attached.
    pub fn batches(&self) -> u64 {
        self.batches
    }

    pub fn flush(&mut self, records: &[BeatRecord], min_target: f64, max_target: f64) -> Result<(), TextLogError> {
        self.batches += 1;
        match self.log.as_mut() {
            Some(log) => {
                tracing::debug!("Flushing {} records to {}", records.len(), log.path().display());
                log.write_batch(records, min_target, max_target)
            }
            None => Ok(()),
        }
    }

    /// Write the final partial batch and close the file.
    pub fn finish(&mut self, records: &[BeatRecord], min_target: f64, max_target: f64) -> Result<(), TextLogError> {
        if let Some(mut log) = self.log.take() {
            log.write_batch(records, min_target, max_target)?;
            log.close()?;
        }
        Ok(())
    }
}

/// Parse a text log back into records. Rows that don't parse are skipped.
pub fn load_records(file: File) -> impl Iterator<Item = BeatRecord> {
    let lines = io::BufReader::new(file).lines();

    lines.skip(1).filter_map(|line| {
        let line_ = line.ok()?;
        let fields = line_.split('\t').collect::<Vec<_>>();
        if fields.len() >= 6 {
            Some(BeatRecord {
                beat: fields[0].parse().ok()?,
                tag: fields[1].parse().ok()?,
                timestamp: fields[2].parse().ok()?,
                global_rate: fields[3].parse().ok()?,
                window_rate: fields[4].parse().ok()?,
                instant_rate: fields[5].parse().ok()?,
            })
        } else {
            None
        }
    })
}

#[derive(Debug, Error)]
pub enum TextLogError {
    #[error("unable to open {0:?}: {1}")]
    Open(PathBuf, #[source] std::io::Error),

    #[error("{0}")]
    Io(
        #[source]
        #[from]
        std::io::Error,
    ),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(beat: i64) -> BeatRecord {
        BeatRecord {
            beat,
            tag: beat as i32 * 10,
            timestamp: 1000 * beat,
            global_rate: 1.5,
            window_rate: 2.25,
            instant_rate: f64::INFINITY,
        }
    }

    #[test]
    fn rows_are_tab_separated_with_targets() {
        let path = std::env::temp_dir().join(format!("hb-textlog-rows-{}", std::process::id()));
        let mut log = TextLog::create(&path).unwrap();
        log.write_batch(&[rec(3)], 10., 20.).unwrap();
        log.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], TEXT_LOG_HEADER);
        assert_eq!(
            lines[1],
            "3\t30\t3000\t1.500000\t2.250000\tinf\t10.000000\t20.000000"
        );
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn scheduler_writes_batches_and_remainder() {
        let path = std::env::temp_dir().join(format!("hb-textlog-batches-{}", std::process::id()));
        let mut s = FlushScheduler::new(Some(TextLog::create(&path).unwrap()));
        s.flush(&[rec(0), rec(1)], 0., 0.).unwrap();
        s.flush(&[rec(2), rec(3)], 0., 0.).unwrap();
        s.finish(&[rec(4)], 0., 0.).unwrap();
        assert_eq!(s.batches(), 2);
        assert!(!s.has_log());

        let beats = load_records(File::open(&path).unwrap())
            .map(|r| r.beat)
            .collect::<Vec<_>>();
        assert_eq!(beats, vec![0, 1, 2, 3, 4]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn create_in_missing_dir_fails() {
        match TextLog::create("/nonexistent-dir-for-heartbeat/log.txt") {
            Err(TextLogError::Open(_, _)) => {}
            _ => assert!(false),
        }
    }
}
