//! Build script for llmodel-bridge.
//!
//! With the `native` feature, links against `libllmodel` from the gpt4all
//! backend. Point `LLMODEL_LIB_DIR` at the directory holding the shared
//! library; otherwise the system linker search path is used.
//!
//! Without the feature nothing is linked and the binary runs on the
//! simulated engine.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=LLMODEL_LIB_DIR");

    if std::env::var_os("CARGO_FEATURE_NATIVE").is_none() {
        return;
    }

    match std::env::var("LLMODEL_LIB_DIR") {
        Ok(dir) => {
            println!("cargo:rustc-link-search=native={dir}");
            // Backend implementations are dlopen'ed relative to the library.
            println!("cargo:rustc-link-arg=-Wl,-rpath,{dir}");
        }
        Err(_) => {
            println!("cargo:warning=LLMODEL_LIB_DIR not set, relying on the system search path for libllmodel");
        }
    }
}
