use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/");

    // Use the vendored protoc so builds do not depend on a system install.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    let well_known = protoc_bin_vendored::include_path()?;

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                PathBuf::from("proto/ensign/v1beta1/ensign.proto"),
                PathBuf::from("proto/grpc/health/v1/health.proto"),
            ],
            &[PathBuf::from("proto"), well_known],
        )?;

    Ok(())
}
