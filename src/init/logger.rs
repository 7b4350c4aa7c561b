use anyhow::Result;
use fern::colors::{Color, ColoredLevelConfig};

/// Wires the `log` facade to stderr. Without the verbose switch every
/// informational log is suppressed; telemetry bypasses the logger entirely
/// and goes to stdout.
pub fn init(verbose: bool, colored: bool) -> Result<()> {
    let colors = ColoredLevelConfig::new()
        .trace(Color::Magenta)
        .debug(Color::Blue)
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red);

    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Off
    };

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Utc::now().to_rfc3339(),
                if colored {
                    colors.color(record.level()).to_string()
                } else {
                    record.level().to_string()
                },
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}
