fn main() {
    if !cfg!(target_os = "linux") {
        panic!(
            "{} only works on linux (procfs host, unix domain sockets)",
            env!("CARGO_PKG_NAME")
        );
    }
}
