use std::process::ExitCode;

mod cmd;
mod init;
mod packet;
mod pool;
mod start;
mod telemetry;
mod transform;

/// Parses the command line, installs the interrupt handler and runs the
/// proxy until shutdown. Exit codes: 1 after an interrupt-driven shutdown,
/// 2 on usage or bind failure (0 stays reserved).
pub async fn run() -> ExitCode {
    let config = match init::cmd::init() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", init::cmd::USAGE);
            eprintln!("[*] error: {err}");
            return ExitCode::from(2);
        }
    };

    let signal = match init::shutdown::init() {
        Ok(signal) => signal,
        Err(err) => {
            eprintln!("[*] error: failed to install interrupt handler: {err}");
            return ExitCode::from(2);
        }
    };

    let transformers = transform::install(config.image, config.attack);

    match start::serve(&config, transformers, &signal).await {
        Ok(()) => {
            log::info!("shutdown complete");
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("[*] error: failed to initialise proxy socket: {err}");
            ExitCode::from(2)
        }
    }
}
