//! Demo: training-matrix outer-product update
//!
//! Builds `y = W x`, `e = W^T d`, and the weight update
//! `W -= d (x) x`, then compiles the training instruction streams.
//!
//! Run with: cargo run --example outer_product

use puma_compiler::{
    CompilerOptions, InputVector, Model, OuterProduct, OutputVector, TrainingMatrix, Vector,
};

fn main() {
    let model = Model::new("training");
    let size = 128;
    let input = InputVector::new(&model, "in", size);
    let grad = InputVector::new(&model, "grad", size);
    let out = OutputVector::new(&model, "out", size);
    let back = OutputVector::new(&model, "back", size);
    let mut weights = TrainingMatrix::new(&model, "W", size, size);

    let x = Vector::from(&input);
    let d = Vector::from(&grad);
    out.assign(&(&weights * &x));
    back.assign(&(&weights.t() * &d));
    weights -= OuterProduct::new(&d, &x);

    let options = CompilerOptions {
        output_dir: "demo-out".into(),
        ..Default::default()
    };
    model.compile(options).expect("compilation failed");
    println!("compiled {} into demo-out/", model.name());
}
