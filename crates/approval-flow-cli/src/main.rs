use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = approval_flow_cli::Cli::parse();
    match approval_flow_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", approval_flow_cli::render_error(&err));
            ExitCode::FAILURE
        }
    }
}
