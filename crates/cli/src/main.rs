use std::process::ExitCode;

fn main() -> ExitCode {
    mender_cli::run()
}
