use log::{LevelFilter, Log, Metadata, Record};

/// Sends every record at or below `max_level` to each logger that accepts it.
pub struct MultiLogger {
    loggers: Vec<Box<dyn Log>>,
    max_level: LevelFilter,
}

impl Default for MultiLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiLogger {
    pub fn new() -> Self {
        Self {
            loggers: Vec::new(),
            max_level: LevelFilter::Trace,
        }
    }

    pub fn with_logger(mut self, logger: Box<dyn Log>) -> Self {
        self.add_logger(logger);
        self
    }

    pub fn with_max_level(mut self, max_level: LevelFilter) -> Self {
        self.max_level = max_level;
        self
    }

    pub fn add_logger(&mut self, logger: Box<dyn Log>) {
        self.loggers.push(logger);
    }

    /// Installs the logger as the global `log` backend.
    pub fn init(self) -> Result<(), log::SetLoggerError> {
        log::set_max_level(self.max_level);
        log::set_boxed_logger(Box::new(self))
    }
}

impl Log for MultiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level && self.loggers.iter().any(|l| l.enabled(metadata))
    }

    fn log(&self, record: &Record) {
        if record.level() > self.max_level {
            return;
        }
        for logger in self.loggers.iter().filter(|l| l.enabled(record.metadata())) {
            logger.log(record);
        }
    }

    fn flush(&self) {
        self.loggers.iter().for_each(|l| l.flush());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    use log::Level;

    /// Keeps the messages of the records it accepts.
    struct Recorder {
        level: LevelFilter,
        messages: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(level: LevelFilter) -> (Box<Self>, Arc<Mutex<Vec<String>>>) {
            let messages = Arc::new(Mutex::new(Vec::new()));
            let recorder = Box::new(Self {
                level,
                messages: messages.clone(),
            });
            (recorder, messages)
        }
    }

    impl Log for Recorder {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.level
        }

        fn log(&self, record: &Record) {
            self.messages.lock().unwrap().push(record.args().to_string());
        }

        fn flush(&self) {}
    }

    fn emit(logger: &MultiLogger, level: Level, message: &str) {
        logger.log(
            &Record::builder()
                .args(format_args!("{message}"))
                .level(level)
                .target("devgraph::actions")
                .build(),
        );
    }

    #[test]
    fn test_fan_out() {
        let (stderr, stderr_messages) = Recorder::new(LevelFilter::Warn);
        let (file, file_messages) = Recorder::new(LevelFilter::Debug);
        let logger = MultiLogger::new().with_logger(stderr).with_logger(file);

        emit(&logger, Level::Debug, "Sorted action: [1] Create Device partition sda1");
        emit(&logger, Level::Error, "Failed to process actions");

        assert_eq!(*stderr_messages.lock().unwrap(), vec!["Failed to process actions"]);
        assert_eq!(file_messages.lock().unwrap().len(), 2);
        assert!(logger.enabled(&Metadata::builder().level(Level::Debug).build()));
        assert!(!logger.enabled(&Metadata::builder().level(Level::Trace).build()));
    }

    #[test]
    fn test_max_level() {
        let (file, messages) = Recorder::new(LevelFilter::Trace);
        let mut logger = MultiLogger::new().with_max_level(LevelFilter::Info);
        assert!(!logger.enabled(&Metadata::builder().level(Level::Error).build()));
        logger.add_logger(file);

        emit(&logger, Level::Debug, "Tearing down partition sda1");
        emit(&logger, Level::Info, "Added partition sda1 to device tree");

        assert_eq!(
            *messages.lock().unwrap(),
            vec!["Added partition sda1 to device tree"]
        );
        assert!(!logger.enabled(&Metadata::builder().level(Level::Debug).build()));
    }
}
