fn main() {
    if let Err(err) = doctorate_launcher_lib::run() {
        tracing::error!(trace_id = %err.trace_id, code = %err.code, "{}", err.error);
        std::process::exit(1);
    }
}
