fn main() {
    prost_build::compile_protos(&["proto/monitor.proto"], &["proto"]).expect("compile monitor.proto");
}
