use cairn::core::{logging, output};

fn main() {
    logging::init_tracing();
    if let Err((format, err)) = cairn::run() {
        tracing::debug!(kind = err.kind(), "command failed");
        let envelope = cairn::error_envelope(&err);
        if output::emit(format, &envelope).is_err() {
            eprintln!("{}", err);
        }
        std::process::exit(err.exit_code());
    }
}
