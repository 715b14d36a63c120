use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    forge_worker::init_tracing();
    match forge_worker::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker exited with error");
            ExitCode::FAILURE
        }
    }
}
