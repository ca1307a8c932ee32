fn main() {
    let args = std::env::args();

    if let Err(err) = xbk::run(args) {
        eprintln!("xbk error: {err:#}");
        std::process::exit(1);
    }
}
