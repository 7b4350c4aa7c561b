use anyhow::Result;

use crate::{
    cmd::{self, Args, Config},
    init::logger,
};

pub const USAGE: &str = "usage: iproxy <port> <image-flag> <attack-flag>";

/// Parses the command line and brings up the logger. Usage failures bubble
/// up for the exit-code-2 path.
pub fn init() -> Result<Config> {
    let (args, mut operands) = Args::parse()?;
    if !operands.is_empty() {
        operands.remove(0); // executable path
    }

    if args.help.is_some_and(|h| h) {
        println!("{USAGE}");
        Args::print_help();
        std::process::exit(0);
    }

    let config = cmd::build(
        &operands,
        args.verbose.unwrap_or(false),
        args.colored.unwrap_or(false),
    )?;
    logger::init(config.verbose, config.colored)?;
    log::debug!("{config:?}");
    Ok(config)
}
