use std::io::Result;

fn main() -> Result<()> {
    // List of proto files containing a message definition
    let proto_files = &[
        // Services
        "proto/ping.proto",
    ];

    // Name of the folder containing the proto definitions
    let proto_folder = "proto";

    tonic_prost_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(proto_files, &[proto_folder])?;

    Ok(())
}
