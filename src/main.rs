fn main() {
    std::process::exit(lobster_cli::run());
}
