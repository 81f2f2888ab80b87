fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = std::env::var("OUT_DIR")?;
    let descriptor_path = std::path::Path::new(&out_dir).join("canopy_descriptor.bin");

    // Use a vendored protoc binary so the build doesn't depend on a
    // system-installed protobuf compiler.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .file_descriptor_set_path(&descriptor_path)
        .compile_protos(&["proto/canopy.proto"], &["proto"])?;

    // Tell cargo to rerun if the proto file changes
    println!("cargo:rerun-if-changed=proto/canopy.proto");

    Ok(())
}
