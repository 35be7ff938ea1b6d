fn main() {
    if let Err(err) = sandbox_tools::cli::run_sandbox_tools() {
        tracing::error!(error = %err, "sandbox-tools failed");
        std::process::exit(1);
    }
}
