fn main() {
    if let Err(e) = avatar_relay::run() {
        tracing::error!("{}", e);
        eprintln!("avatar-relay: {}", e);
        std::process::exit(1);
    }
}
