use env_logger::Env;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(Env::new().filter_or("AUTOPIN_LOG", "info"))
        .format_timestamp(None)
        .init();
    log::debug!("autopin {}", autopin::VERSION);

    if let Err(err) = autopin::app::run().await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
