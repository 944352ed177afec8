use std::env;

fn main() {
    if env::var("PROTOC").is_err() {
        if let Ok(path) = protoc_bin_vendored::protoc_bin_path() {
            // SAFETY: build scripts are single-process setup steps and set PROTOC before use.
            unsafe { env::set_var("PROTOC", path) };
        }
    }

    tonic_build::configure()
        .compile(&["proto/core_grpc.proto"], &["proto"])
        .expect("failed to compile core_grpc proto");

    println!("cargo:rerun-if-changed=proto/core_grpc.proto");
}
