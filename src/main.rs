use std::process::ExitCode;

fn main() -> ExitCode {
    smol::block_on(iproxy::run())
}
