// Dies before its handshake, like a worker whose initialization failed
fn main() {
    std::process::exit(3);
}
