fn main() {
    println!("cargo:rerun-if-env-changed=DEVGRAPH_VERSION");
}
