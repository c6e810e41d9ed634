mod app;
mod config;
mod prelude;
mod stress;

fn main() {
    env_logger::builder()
        .parse_env(env_logger::Env::new().filter_or("IOTRACE_LOG", "info"))
        .format_timestamp(None)
        .init();

    if let Err(err) = app::run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
