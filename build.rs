use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=linker.ld");

    // Bare-metal link flags apply only to the kernel target; host builds
    // (unit tests) keep the default toolchain linkage.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg=-T{}/linker.ld", manifest_dir);
        println!("cargo:rustc-link-arg=-static");
        println!("cargo:rustc-link-arg=--gc-sections");
        println!("cargo:rustc-link-arg=-z");
        println!("cargo:rustc-link-arg=max-page-size=0x1000");
    }
}
