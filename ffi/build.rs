//! Generates the C header for the `extern "C"` surface into `OUT_DIR`.
//!
//! Set `COUCH_FFI_HEADER=<path>` to also write a copy where a host build
//! can pick it up.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src");
    println!("cargo:rerun-if-env-changed=COUCH_FFI_HEADER");

    let (Ok(crate_dir), Ok(out_dir)) = (env::var("CARGO_MANIFEST_DIR"), env::var("OUT_DIR")) else {
        return;
    };

    let generated = cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("COUCH_FFI_H")
        .generate();

    // A header failure must not break the Rust build.
    let bindings = match generated {
        Ok(bindings) => bindings,
        Err(err) => {
            println!("cargo:warning=cbindgen: {err}");
            return;
        }
    };
    bindings.write_to_file(PathBuf::from(out_dir).join("couch_ffi.h"));
    if let Ok(path) = env::var("COUCH_FFI_HEADER") {
        bindings.write_to_file(path);
    }
}
