fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let compile_date = chrono::Local::now().format("%b %e %Y %H:%M:%S");
    println!("cargo:rustc-env=AGENT_COMPILE_DATE={compile_date}");
}
