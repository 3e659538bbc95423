//! Demo: one small matrix-vector product
//!
//! Compiles `out = M * in` for a 5x5 matrix and writes the tile and
//! core instruction streams plus the weight file into ./demo-out.
//!
//! Run with: cargo run --example simple_mvm

use puma_compiler::{CompilerOptions, ConstantMatrix, InputVector, Model, OutputVector, Vector};

fn main() {
    let model = Model::new("simple");
    let size = 5;
    let input = InputVector::new(&model, "in", size);
    let matrix = ConstantMatrix::new(&model, "constant_", size, size);
    let out = OutputVector::new(&model, "out_", size);

    let result = &matrix * &Vector::from(&input);
    out.assign(&result);

    let options = CompilerOptions {
        output_dir: "demo-out".into(),
        ..Default::default()
    };
    model.compile(options).expect("compilation failed");

    let mut instance = model.instance();
    let weights: Vec<f32> = (0..size * size).map(|i| i as f32 / 10.0).collect();
    instance.bind("constant_", &weights);
    instance.generate_data().expect("data generation failed");

    let report = model.report().unwrap();
    println!("compiled {} into demo-out/", model.name());
    println!("send + receive bytes: {}", report.send_bytes + report.receive_bytes);
}
