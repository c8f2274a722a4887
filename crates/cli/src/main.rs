use std::process::ExitCode;

fn main() -> ExitCode {
    procure_cli::run()
}
