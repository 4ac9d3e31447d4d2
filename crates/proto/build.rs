//! Build script for webmesh-proto.
//!
//! Compiles the protobuf definitions into Rust code with tonic-build.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo::rerun-if-changed=../../proto/webmesh/v1/webmesh.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["../../proto/webmesh/v1/webmesh.proto"], &["../../proto"])?;

    Ok(())
}
