use std::{fs::File, io::Write, path::Path, sync::Mutex};

use log::{LevelFilter, Log, Record};

use osutils::files;

use super::LogEntry;

/// Writes every record as one JSON line of [`LogEntry`] to a file.
pub struct FileLog {
    target: Option<Mutex<File>>,
    max_level: LevelFilter,
}

impl FileLog {
    /// Truncates or creates `target`. When that fails the logger stays
    /// disabled and the failure is reported on stderr.
    pub fn new(target: impl AsRef<Path>) -> Self {
        let file = match files::create_file(target.as_ref()) {
            Ok(f) => Some(Mutex::new(f)),
            Err(err) => {
                eprintln!("Logging setup error: failed to create log file: {err:?}");
                None
            }
        };

        Self {
            max_level: LevelFilter::Trace,
            target: file,
        }
    }

    pub fn with_max_level(self, max_level: LevelFilter) -> Self {
        Self { max_level, ..self }
    }

    pub fn into_logger(self) -> Box<dyn Log> {
        Box::new(self)
    }

    fn write_entry(&self, record: &Record) -> Result<(), Box<dyn std::error::Error + '_>> {
        if let Some(file) = self.target.as_ref() {
            let mut serialized = serde_json::to_string(&LogEntry::from(record))?;
            serialized.push('\n');

            let mut file_lock = file.lock()?;
            file_lock.write_all(serialized.as_bytes())?;
            file_lock.flush()?;
        }

        Ok(())
    }
}

impl Log for FileLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.target.is_some() && metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        // Best effort
        let _ = self.write_entry(record);
    }

    fn flush(&self) {
        if let Some(Ok(mut file)) = self.target.as_ref().map(Mutex::lock) {
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use log::Level;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_filter() {
        let test_dir = tempdir().unwrap();
        let logger = FileLog::new(test_dir.path().join("devgraph.log"))
            .with_max_level(LevelFilter::Info)
            .into_logger();

        assert!(logger.enabled(&log::Metadata::builder().level(Level::Info).build()));
        assert!(!logger.enabled(&log::Metadata::builder().level(Level::Debug).build()));
    }

    #[test]
    fn test_unwritable_target_disables() {
        let test_dir = tempdir().unwrap();
        // A directory cannot be opened as a file.
        let log = FileLog::new(test_dir.path());
        assert!(log.target.is_none());
        assert!(!log
            .into_logger()
            .enabled(&log::Metadata::builder().level(Level::Error).build()));
    }

    #[test]
    fn test_truncates_existing_file() {
        let test_dir = tempdir().unwrap();
        let target = test_dir.path().join("devgraph.log");
        fs::write(&target, "previous run").unwrap();

        let logger = FileLog::new(&target).into_logger();
        logger.log(
            &log::Record::builder()
                .args(format_args!("Populating device tree"))
                .build(),
        );
        logger.flush();

        let content = fs::read_to_string(&target).unwrap();
        assert!(!content.contains("previous run"));
        assert!(content.contains("Populating device tree"));
    }

    #[test]
    fn test_json_lines() {
        let test_dir = tempdir().unwrap();
        let target = test_dir.path().join("devgraph.log");
        let logger = FileLog::new(&target).into_logger();

        for (message, line) in [("Added disk sda", 10), ("Removed partition sda1", 20)] {
            logger.log(
                &log::Record::builder()
                    .args(format_args!("{message}"))
                    .level(Level::Info)
                    .target("devgraph::devicetree")
                    .module_path(Some("devgraph::devicetree"))
                    .file(Some(file!()))
                    .line(Some(line))
                    .build(),
            );
        }
        logger.flush();

        let content = fs::read_to_string(target).unwrap();
        let entries: Vec<LogEntry> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, Level::Info.into());
        assert_eq!(entries[0].message, "Added disk sda");
        assert_eq!(entries[1].target, "devgraph::devicetree");
        assert_eq!(entries[1].file, file!());
        assert_eq!(entries[1].line, 20);
    }
}
