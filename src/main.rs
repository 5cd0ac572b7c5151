fn main() {
    if let Err(err) = series_store::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
