//! Console logging plus an optional file collecting warnings and errors.

use std::fs::File;
use std::io;
use std::path::Path;

use env_logger::{Builder, Env, Logger, Target, WriteStyle};
use log::{LevelFilter, Log, Metadata, Record};

/// Forwards each record to the console and, at warn level and above, to the error log.
struct TeeLogger {
    console: Logger,
    errors: Option<Logger>,
}

impl Log for TeeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.console.enabled(metadata)
            || self.errors.as_ref().is_some_and(|errors| errors.enabled(metadata))
    }

    fn log(&self, record: &Record) {
        self.console.log(record);
        if let Some(errors) = &self.errors {
            errors.log(record);
        }
    }

    fn flush(&self) {
        self.console.flush();
        if let Some(errors) = &self.errors {
            errors.flush();
        }
    }
}

/// Installs the global logger. `error_log` is truncated if it exists.
pub fn init(error_log: Option<&Path>) -> io::Result<()> {
    // Progress is logged at info level unless RUST_LOG says otherwise
    let console = Builder::from_env(Env::default().default_filter_or("info")).build();
    let errors = error_log.map(error_logger).transpose()?;

    let max_level = errors
        .as_ref()
        .map_or(LevelFilter::Off, Logger::filter)
        .max(console.filter());
    log::set_boxed_logger(Box::new(TeeLogger { console, errors })).map_err(io::Error::other)?;
    log::set_max_level(max_level);
    Ok(())
}

fn error_logger(path: &Path) -> io::Result<Logger> {
    let file = File::create(path)?;
    Ok(Builder::new()
        .filter_level(LevelFilter::Warn)
        .write_style(WriteStyle::Never)
        .target(Target::Pipe(Box::new(file)))
        .build())
}
