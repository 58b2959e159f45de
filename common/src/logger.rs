use log::{LevelFilter, SetLoggerError};
use redox_log::{OutputBuilder, RedoxLogger};

pub fn output_level() -> LevelFilter {
    //TODO: adjust with bootloader environment
    LevelFilter::Info
}

pub fn file_level() -> LevelFilter {
    LevelFilter::Info
}

/// Parses a level name as written in driver config files (`"info"`, `"TRACE"`, `"off"`).
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    name.trim().parse().ok()
}

/// Configures logging for a single driver.
///
/// Output always goes to stderr; on Redox two additional files are opened in the logging scheme,
/// `<logfile_base>.log` and `<logfile_base>.ansi.log`. Fails only if a global logger has already
/// been installed.
#[cfg_attr(not(target_os = "redox"), allow(unused_variables, unused_mut))]
pub fn setup_logging(
    category: &str,
    subcategory: &str,
    logfile_base: &str,
    output_level: LevelFilter,
    file_level: LevelFilter,
) -> Result<(), SetLoggerError> {
    let mut logger = RedoxLogger::new().with_output(
        OutputBuilder::stderr()
            .with_filter(output_level)
            .with_ansi_escape_codes()
            .flush_on_newline(true)
            .build(),
    );

    #[cfg(target_os = "redox")]
    for (suffix, ansi) in [("log", false), ("ansi.log", true)] {
        match OutputBuilder::in_redox_logging_scheme(
            category,
            subcategory,
            format!("{logfile_base}.{suffix}"),
        ) {
            Ok(b) => {
                let b = b.with_filter(file_level).flush_on_newline(true);
                let b = if ansi { b.with_ansi_escape_codes() } else { b };
                logger = logger.with_output(b.build());
            }
            Err(error) => eprintln!("Failed to create {logfile_base}.{suffix}: {}", error),
        }
    }

    logger.enable().map(|_| ())
}
