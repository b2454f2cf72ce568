use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    Ok(appdeck::run()?)
}
