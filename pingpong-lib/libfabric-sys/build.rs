use std::{env, path::PathBuf};

/// Returns the first of `$LIBFABRIC_HOME` and the default prefixes that
/// contains the libfabric headers.
fn find_libfabric() -> PathBuf {
    const CHECK_FILE: &str = "include/rdma/fabric.h";
    println!("cargo:rerun-if-env-changed=LIBFABRIC_HOME");
    env::var_os("LIBFABRIC_HOME")
        .map(PathBuf::from)
        .into_iter()
        .chain(["/opt/amazon/efa", "/opt/libfabric", "/usr/local", "/usr"].map(PathBuf::from))
        .find(|dir| dir.join(CHECK_FILE).is_file())
        .unwrap_or_else(|| {
            panic!("LIBFABRIC_HOME is not set and {CHECK_FILE} is not found in the default paths")
        })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let libfabric_home = find_libfabric();
    println!("cargo:rerun-if-changed=wrapper.h");

    // Scalable endpoints, tagged messaging, RMA and atomics are all reached
    // through the ops tables, so only the types and the exported entry
    // points are needed here.
    let bindings = bindgen::Builder::default()
        .header("wrapper.h")
        .clang_arg(format!("-I{}/include", libfabric_home.display()))
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
        .prepend_enum_name(false)
        .allowlist_item(r"(fi|FI)_.*")
        .derive_default(true)
        .generate()
        .expect("Unable to generate libfabric bindings");
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    bindings
        .write_to_file(out_dir.join("libfabric-bindings.rs"))
        .expect("Couldn't write libfabric bindings!");

    println!("cargo:rustc-link-search=native={}/lib", libfabric_home.display());
    println!("cargo:rustc-link-search=native={}/lib64", libfabric_home.display());
    println!("cargo:rustc-link-lib=fabric");

    Ok(())
}
