use std::env;
use std::path::PathBuf;

const HEADER: &str = "transfer_ffi.h";

fn main() {
    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());

    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=src/types.rs");
    println!("cargo:rerun-if-env-changed=TRANSFER_FFI_HEADER_DIR");

    let bindings = match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_language(cbindgen::Language::C)
        .with_include_guard("TRANSFER_FFI_H")
        .with_documentation(true)
        .generate()
    {
        Ok(bindings) => bindings,
        Err(err) => {
            println!("cargo:warning=header generation skipped: {err}");
            return;
        }
    };

    // The build never writes into the source tree; set
    // TRANSFER_FFI_HEADER_DIR to get a copy somewhere else.
    if let Ok(out_dir) = env::var("OUT_DIR") {
        bindings.write_to_file(PathBuf::from(out_dir).join(HEADER));
    }
    if let Ok(dir) = env::var("TRANSFER_FFI_HEADER_DIR") {
        bindings.write_to_file(PathBuf::from(dir).join(HEADER));
    }
}
