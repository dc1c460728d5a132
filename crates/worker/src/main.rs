use std::process::ExitCode;

use forgequeue_core::CommandRegistry;

/// Standalone worker binary. Applications with their own commands embed
/// `forgequeue_worker::cli::run` with a populated registry instead.
#[tokio::main]
async fn main() -> ExitCode {
    forgequeue_worker::cli::run(CommandRegistry::new()).await
}
