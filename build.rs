fn main() {
    protobuf_codegen::Codegen::new()
        .pure()
        .includes(["proto"])
        .input("proto/relay.proto")
        .cargo_out_dir("proto")
        .run_from_script();
}
