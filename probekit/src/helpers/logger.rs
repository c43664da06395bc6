use std::{
    env,
    io::{self, stderr, IsTerminal, Write},
    sync::{Arc, Mutex},
};

use anyhow::Result;
use log::{LevelFilter, Metadata, Record};
use termcolor::{BufferedStandardStream, Color, ColorChoice, ColorSpec, WriteColor};
use time::{macros::format_description, OffsetDateTime};

/// Tag prepended to every line, so our output is distinguishable from the
/// host's own.
const TAG: &str = "[probekit]";
/// Records whose target starts with this come from the engine itself.
const ENGINE_TARGET: &str = "probekit";

/// Optional stderr logger for the log:: messages of the engine. Embedders
/// having their own logger installed do not need it; those who don't can use
/// this one, records from other targets are then shown with their target.
pub struct Logger {
    max_level: LevelFilter,
    use_colors: bool,
    /// Messages only go to stderr, stdout belongs to the host.
    out: Mutex<BufferedStandardStream>,
}

impl Logger {
    fn new(max_level: LevelFilter) -> Self {
        let use_colors =
            stderr().is_terminal() && matches!(env::var("TERM"), Ok(x) if x != "dumb");
        Self {
            max_level,
            use_colors,
            out: Mutex::new(BufferedStandardStream::stderr(match use_colors {
                true => ColorChoice::Auto,
                false => ColorChoice::Never,
            })),
        }
    }

    /// Install the logger as the process-wide log:: backend. Fails if a logger
    /// was already set.
    pub fn init(max_level: LevelFilter) -> Result<Arc<Self>> {
        let logger = Arc::new(Self::new(max_level));

        log::set_max_level(max_level);
        log::set_boxed_logger(Box::new(Arc::clone(&logger)))?;

        Ok(logger)
    }

    fn write_record<W: WriteColor>(&self, out: &mut W, record: &Record) -> io::Result<()> {
        static LEVEL_COLORS: &[Option<Color>] = &[
            None,                // Default.
            Some(Color::Red),    // Error.
            Some(Color::Yellow), // Warn.
            Some(Color::Blue),   // Info.
            Some(Color::Cyan),   // Debug.
            Some(Color::White),  // Trace.
        ];
        let verbose = self.max_level >= LevelFilter::Debug;

        write!(out, "{TAG} ")?;
        if verbose {
            OffsetDateTime::now_utc()
                .format_into(
                    &mut *out,
                    format_description!("[hour]:[minute]:[second].[subsecond digits:6] "),
                )
                .map_err(io::Error::other)?;
        }

        // Levels are only worth showing for problems, unless debugging.
        if verbose || record.level() <= LevelFilter::Warn {
            if self.use_colors {
                out.set_color(ColorSpec::new().set_fg(LEVEL_COLORS[record.level() as usize]))?;
            }
            write!(out, "{:5} ", record.level())?;
            if self.use_colors {
                out.reset()?;
            }
        }

        if !record.target().starts_with(ENGINE_TARGET) {
            write!(out, "{}: ", record.target())?;
        }
        writeln!(out, "{}", record.args())
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut out = self.out.lock().unwrap();
        // Nowhere to report a failure to log.
        if self.write_record(&mut *out, record).is_ok() {
            let _ = out.flush();
        }
    }

    fn flush(&self) {
        let _ = self.out.lock().unwrap().flush();
    }
}
