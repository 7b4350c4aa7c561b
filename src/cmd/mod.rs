use anyhow::{Context, Result, ensure};
use sarge::prelude::*;

sarge! {
    #[derive(Debug)]
    pub Args,

    > "verbose logging to stderr"
    #ok 'v' @IPROXY_VERBOSE pub verbose: bool,

    > "colorize log levels"
    #ok pub colored: bool,

    > "print usage"
    #ok 'h' pub help: bool,
}

/// Validated runtime configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub image: bool,
    pub attack: bool,
    pub verbose: bool,
    pub colored: bool,
}

/// `<port> <image-flag> <attack-flag>` from the positional operands. All
/// three must be integers; nonzero flags install the transformers.
pub fn build(operands: &[String], verbose: bool, colored: bool) -> Result<Config> {
    ensure!(operands.len() >= 3, "insufficient arguments");

    let port: u16 = operands[0]
        .parse()
        .ok()
        .filter(|port| *port > 0)
        .with_context(|| format!("<port> must be an integer in 1-65535, got {:?}", operands[0]))?;
    let image: i64 = operands[1]
        .parse()
        .with_context(|| format!("<image-flag> must be a valid integer, got {:?}", operands[1]))?;
    let attack: i64 = operands[2]
        .parse()
        .with_context(|| format!("<attack-flag> must be a valid integer, got {:?}", operands[2]))?;

    Ok(Config {
        port,
        image: image != 0,
        attack: attack != 0,
        verbose,
        colored,
    })
}
