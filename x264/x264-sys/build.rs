extern crate bindgen;

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=src/lib.h");
    println!("cargo:rerun-if-changed=src/lib.c");

    // pkg-config knows about non-standard prefixes (e.g. Homebrew). If it can't find the library we
    // fall back to whatever the system linker can find.
    let include_paths = match pkg_config::Config::new().atleast_version("0.148").probe("x264") {
        Ok(lib) => lib.include_paths,
        Err(_) => {
            println!("cargo:rustc-link-lib=x264");
            vec![]
        }
    };

    let mut shim = cc::Build::new();
    shim.file("src/lib.c");
    for path in &include_paths {
        shim.include(path);
    }
    shim.compile("x264-shim");

    let bindings = bindgen::Builder::default();

    // the "whilelist_" functions have been renamed in newer bindgen versions, but we use the old
    // names for wider compatibility
    #[allow(deprecated)]
    let bindings = bindings
        .header("src/lib.h")
        .clang_args(include_paths.iter().map(|path| format!("-I{}", path.display())))
        .whitelist_function("x264_.+")
        .whitelist_type("x264_.+")
        .whitelist_var("X264_.+")
        .generate()
        .expect("unable to generate bindings");

    let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
    bindings.write_to_file(out_path.join("bindings.rs")).expect("unable to write bindings");
}
