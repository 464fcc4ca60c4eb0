fn main() {
    #[cfg(feature = "inception")]
    {
        use burn_import::onnx::ModelGen;

        println!("cargo:rerun-if-changed=models/inception_v3.onnx");
        ModelGen::new()
            .input("models/inception_v3.onnx")
            .out_dir("model/")
            .run_from_script();
    }
}
