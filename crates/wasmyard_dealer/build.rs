fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/wasmdealer.proto");
    tonic_prost_build::compile_protos("proto/wasmdealer.proto")?;
    Ok(())
}
