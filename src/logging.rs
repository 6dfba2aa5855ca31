use crate::error::LoggingError;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;

pub const DEFAULT_LOG_FILE: &str = "chord.log";

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} {h({l:<5})} [{T}] {t} - {m}{n}";

/// Installs the global logger: console always, plus `file` when given.
/// The file receives the periodic node state lines the ring verifier reads.
pub fn init_logging(level: LevelFilter, file: Option<&Path>) -> Result<log4rs::Handle, LoggingError> {
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    let mut builder = Config::builder().appender(Appender::builder().build("console", Box::new(console)));
    let mut root = Root::builder().appender("console");

    if let Some(path) = file {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build(path)?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
    }

    let config = builder.build(root.build(level))?;
    Ok(log4rs::init_config(config)?)
}
