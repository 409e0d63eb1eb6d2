use std::process::ExitCode;

use dotenv::dotenv;
use fuota_worker_lib::{cli::parse_args, commands::run};

fn main() -> ExitCode {
    dotenv().ok();

    let cli = parse_args();
    match run(&cli) {
        0 => ExitCode::SUCCESS,
        code => ExitCode::from(u8::try_from(code).unwrap_or(1)),
    }
}
