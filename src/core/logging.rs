/*
 * Logging initialization for host applications. The core itself only emits
 * through the `log` facade; embedding applications either install their own
 * logger or call `init_logging` once at startup.
 */
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use std::fs::File;
use std::path::Path;

pub use log::LevelFilter;

/*
 * Installs a terminal logger at the given level, optionally mirrored to a
 * file. Returns an error when a global logger is already installed.
 */
pub fn init_logging(
    level: LevelFilter,
    log_file: Option<&Path>,
) -> Result<(), log::SetLoggerError> {
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = log_file {
        match File::create(path) {
            Ok(file) => loggers.push(WriteLogger::new(level, Config::default(), file)),
            Err(e) => eprintln!("context_packer: could not open log file {path:?}: {e}"),
        }
    }
    CombinedLogger::init(loggers)
}
