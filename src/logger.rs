use colored::{Color, ColoredString, Colorize};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

struct LoggerState {
    level: LevelFilter,
    output: Box<dyn Write + Send>,
    /// Lines held back until the configured level is known
    deferred: Option<Vec<(Level, ColoredString)>>,
}

/**
 * Colored stderr logger. Everything logged before `print_deferred` is held
 * back, then replayed through whatever level the resolved configuration
 * asked for.
 */
pub struct BuildSandboxLogger {
    state: Mutex<LoggerState>,
}

impl BuildSandboxLogger {
    pub fn new(level: LevelFilter) -> &'static Self {
        Self::with_output(level, Box::new(io::stderr()))
    }

    fn with_output(
        level: LevelFilter,
        output: Box<dyn Write + Send>,
    ) -> &'static Self {
        Box::leak(Box::new(Self {
            state: Mutex::new(LoggerState {
                level,
                output,
                deferred: Some(Vec::new()),
            }),
        }))
    }

    pub fn init(&'static self) -> Result<&'static Self, log::SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(LevelFilter::Trace);
        Ok(self)
    }

    fn state(&self) -> MutexGuard<'_, LoggerState> {
        // a panic while logging leaves nothing half written worth refusing
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.state().level = level;
    }

    pub fn print_deferred(&self) {
        let mut state = self.state();
        let level = state.level;
        if let Some(deferred) = state.deferred.take() {
            for (line_level, line) in deferred {
                if line_level <= level {
                    let _ = writeln!(state.output, "{}", line);
                }
            }
        }
    }
}

fn level_style(level: Level) -> (String, Color) {
    match level {
        Level::Error => (level.to_string(), Color::Red),
        Level::Warn => (format!("{} ", level), Color::Yellow),
        Level::Info => (format!("{} ", level), Color::White),
        Level::Debug => (level.to_string(), Color::Blue),
        Level::Trace => (level.to_string(), Color::BrightBlack),
    }
}

impl Log for BuildSandboxLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.state().level
    }

    fn log(&self, record: &Record) {
        let (level_str, color) = level_style(record.level());
        let line = format!(
            "[{}] {}: {}",
            level_str.color(color),
            record.target(),
            record.args()
        )
        .color(color);

        let mut state = self.state();
        let enabled = record.level() <= state.level;
        match state.deferred.as_mut() {
            Some(deferred) => deferred.push((record.level(), line)),
            None if enabled => {
                let _ = writeln!(state.output, "{}", line);
            }
            None => (),
        }
    }

    fn flush(&self) {
        let _ = self.state().output.flush();
    }
}
