use std::process::ExitCode;

fn main() -> ExitCode {
    pricebot_cli::run()
}
