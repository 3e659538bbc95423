//! PUMA compiler CLI
//!
//! Builds one of the bundled networks and compiles it:
//!   pumac simple --size 5
//!   pumac lstm --in-size 1024 --hidden-size 1024 --out-size 1024
//!   pumac convmax --image-size 14 --channels 512 -o build/
//!   pumac fully-connected --gp kahip --debug

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use colored::Colorize;

use puma_compiler::{
    maxpool, sig, sig_stream, CompilerOptions, ConstantMatrix, ConvolutionalConstantMatrix,
    GraphPartitioningScheme, ImagePixelStream, InputImagePixelStream, InputVector, Model,
    OuterProduct, OutputImagePixelStream, OutputVector, TrainingMatrix, Vector,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Network {
    /// One small matrix-vector product
    Simple,
    /// A single fully connected layer with a sigmoid activation
    FullyConnected,
    /// A two-hidden-layer LSTM cell
    Lstm,
    /// Convolution, sigmoid, and max pooling over a pixel stream
    Convmax,
    /// Forward, backward, and outer-product update on one weight matrix
    Training,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Partitioning {
    RowMajor,
    ColMajor,
    Kahip,
    Random,
}

impl From<Partitioning> for GraphPartitioningScheme {
    fn from(value: Partitioning) -> Self {
        match value {
            Partitioning::RowMajor => GraphPartitioningScheme::RowMajor,
            Partitioning::ColMajor => GraphPartitioningScheme::ColMajor,
            Partitioning::Kahip => GraphPartitioningScheme::Kahip,
            Partitioning::Random => GraphPartitioningScheme::Random,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "pumac")]
#[command(version = "0.1.0")]
#[command(about = "Compiles bundled linear-algebra models to PUMA instruction streams")]
struct Args {
    /// Network to build and compile
    #[arg(value_enum)]
    network: Network,

    /// Size of the simple model's square matrix
    #[arg(long, default_value = "5")]
    size: usize,

    /// Input vector length
    #[arg(long, default_value = "1024")]
    in_size: usize,

    /// Hidden vector length
    #[arg(long, default_value = "1024")]
    hidden_size: usize,

    /// Output vector length
    #[arg(long, default_value = "1024")]
    out_size: usize,

    /// Image width and height for convolutional networks
    #[arg(long, default_value = "14")]
    image_size: usize,

    /// Channel count for convolutional networks
    #[arg(long, default_value = "512")]
    channels: usize,

    /// Convolution kernel width and height
    #[arg(long, default_value = "3")]
    kernel_size: usize,

    /// Max pooling span
    #[arg(long, default_value = "2")]
    pool_size: usize,

    /// Graph partitioning scheme
    #[arg(long, value_enum, default_value = "row-major")]
    gp: Partitioning,

    /// Skip MVM coalescing
    #[arg(long)]
    no_coalesce: bool,

    /// Emit graphviz snapshots after each pass
    #[arg(long)]
    debug: bool,

    /// Directory for emitted artifacts
    #[arg(short = 'o', long, default_value = ".")]
    output_dir: PathBuf,
}

fn build_simple(size: usize) -> Model {
    let model = Model::new("simple");
    let input = InputVector::new(&model, "in", size);
    let matrix = ConstantMatrix::new(&model, "constant_", size, size);
    let out = OutputVector::new(&model, "out_", size);
    let result = &matrix * &Vector::from(&input);
    out.assign(&result);
    model
}

fn build_fully_connected(in_size: usize, out_size: usize) -> Model {
    let model = Model::new("fully-connected-layer");
    let input = InputVector::new(&model, "in", in_size);
    let out = OutputVector::new(&model, "out", out_size);
    let weights = ConstantMatrix::new(&model, "W", in_size, out_size);
    let y = sig(&(&weights * &Vector::from(&input)));
    out.assign(&y);
    model
}

fn build_lstm(in_size: usize, h_size: usize, out_size: usize) -> Model {
    let model = Model::new("lstm-layer");
    let input = InputVector::new(&model, "in", in_size);
    let out = OutputVector::new(&model, "out", out_size);
    let y = lstm_layer(&model, "", in_size, h_size, out_size, &Vector::from(&input));
    out.assign(&y);
    model
}

/// Two stacked LSTM cells followed by a dense output layer. The
/// recurrent state flows through dedicated input and output vectors:
/// the state written at step t is fed back externally at step t+1.
fn lstm_layer(
    model: &Model,
    layer_name: &str,
    in_size: usize,
    h_size: usize,
    out_size: usize,
    input: &Vector,
) -> Vector {
    // Hidden layer 1 weights (input and recurrent connections)
    let m1: Vec<ConstantMatrix> = (0..4)
        .map(|i| ConstantMatrix::new(model, &format!("{}M1_{}", layer_name, i), in_size, h_size))
        .collect();
    let m2: Vec<ConstantMatrix> = (0..4)
        .map(|i| ConstantMatrix::new(model, &format!("{}M2_{}", layer_name, i), h_size, h_size))
        .collect();

    // Hidden layer 2 weights
    let m3: Vec<ConstantMatrix> = (0..4)
        .map(|i| ConstantMatrix::new(model, &format!("{}M3_{}", layer_name, i), h_size, h_size))
        .collect();
    let m4: Vec<ConstantMatrix> = (0..4)
        .map(|i| ConstantMatrix::new(model, &format!("{}M4_{}", layer_name, i), h_size, h_size))
        .collect();

    // Output layer weights
    let m5 = ConstantMatrix::new(model, &format!("{}M5", layer_name), h_size, out_size);

    // Self-modifying state vectors (step t-1 output feeds step t)
    let h1in = Vector::from(&InputVector::new(model, &format!("{}h1in", layer_name), h_size));
    let c1in = Vector::from(&InputVector::new(model, &format!("{}c1in", layer_name), h_size));
    let h2in = Vector::from(&InputVector::new(model, &format!("{}h2in", layer_name), h_size));
    let c2in = Vector::from(&InputVector::new(model, &format!("{}c2in", layer_name), h_size));
    let h1out = OutputVector::new(model, &format!("{}h1out", layer_name), h_size);
    let c1out = OutputVector::new(model, &format!("{}c1out", layer_name), h_size);
    let h2out = OutputVector::new(model, &format!("{}h2out", layer_name), h_size);
    let c2out = OutputVector::new(model, &format!("{}c2out", layer_name), h_size);

    // Hidden layer 1
    let preact1_1 = &(&m1[0] * input) + &(&m2[0] * &h1in);
    let preact1_2 = &(&m1[1] * input) + &(&m2[1] * &h1in);
    let preact1_3 = &(&m1[2] * input) + &(&m2[2] * &h1in);
    let preact1_4 = &(&m1[3] * input) + &(&m2[3] * &h1in);
    let i_gate1 = sig(&preact1_1);
    let f_gate1 = sig(&preact1_2);
    let o_gate1 = sig(&preact1_3);
    let c_int1 = puma_compiler::tanh(&preact1_4);
    let c1 = &(&f_gate1 * &c1in) + &(&i_gate1 * &c_int1);
    let h1 = &o_gate1 * &puma_compiler::tanh(&c1);
    h1out.assign(&h1);
    c1out.assign(&c1);

    // Hidden layer 2
    let preact2_1 = &(&m3[0] * &h1) + &(&m4[0] * &h2in);
    let preact2_2 = &(&m3[1] * &h1) + &(&m4[1] * &h2in);
    let preact2_3 = &(&m3[2] * &h1) + &(&m4[2] * &h2in);
    let preact2_4 = &(&m3[3] * &h1) + &(&m4[3] * &h2in);
    let i_gate2 = sig(&preact2_1);
    let f_gate2 = sig(&preact2_2);
    let o_gate2 = sig(&preact2_3);
    let c_int2 = puma_compiler::tanh(&preact2_4);
    let c2 = &(&f_gate2 * &c2in) + &(&i_gate2 * &c_int2);
    let h2 = &o_gate2 * &puma_compiler::tanh(&c2);
    h2out.assign(&h2);
    c2out.assign(&c2);

    // Output layer
    &m5 * &h2
}

fn build_convmax(
    image_size: usize,
    channels: usize,
    kernel_size: usize,
    pool_size: usize,
) -> Model {
    let model = Model::new("convmax-layer");
    let in_stream =
        InputImagePixelStream::new(&model, "in_stream", image_size, image_size, channels);
    let out_size = (image_size - 1) / pool_size + 1;
    let out_stream =
        OutputImagePixelStream::new(&model, "out_stream", out_size, out_size, channels);
    let kernel = ConvolutionalConstantMatrix::new(
        &model,
        "kernel",
        kernel_size,
        kernel_size,
        channels,
        channels,
    );
    let conv = &kernel * &ImagePixelStream::from(&in_stream);
    let pooled = maxpool(&sig_stream(&conv), pool_size, pool_size);
    out_stream.assign(&pooled);
    model
}

fn build_training(in_size: usize, out_size: usize) -> Model {
    let model = Model::new("training-layer");
    let input = InputVector::new(&model, "in", in_size);
    let grad = InputVector::new(&model, "grad", out_size);
    let out = OutputVector::new(&model, "out", out_size);
    let back = OutputVector::new(&model, "back", in_size);
    let mut weights = TrainingMatrix::new(&model, "W", in_size, out_size);
    let x = Vector::from(&input);
    let d = Vector::from(&grad);
    let y = &weights * &x;
    let e = &weights.t() * &d;
    out.assign(&y);
    back.assign(&e);
    weights -= OuterProduct::new(&d, &x);
    model
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let model = match args.network {
        Network::Simple => build_simple(args.size),
        Network::FullyConnected => build_fully_connected(args.in_size, args.out_size),
        Network::Lstm => build_lstm(args.in_size, args.hidden_size, args.out_size),
        Network::Convmax => build_convmax(
            args.image_size,
            args.channels,
            args.kernel_size,
            args.pool_size,
        ),
        Network::Training => build_training(args.in_size, args.out_size),
    };

    let options = CompilerOptions {
        gp: args.gp.into(),
        coalesce_mvm_operations: !args.no_coalesce,
        print_debug_info: args.debug,
        output_dir: args.output_dir.clone(),
    };

    println!(
        "{} {} ({:?} partitioning)",
        "Compiling".bold().blue(),
        model.name(),
        args.gp
    );
    if let Err(e) = model.compile(options) {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }

    let report = model.report().expect("compilation produced no report");
    println!("{}", "Compilation finished".bold().green());
    println!(
        "  {}: {}",
        "load + store bytes".cyan(),
        report.load_bytes + report.store_bytes
    );
    println!(
        "  {}: {}",
        "send + receive bytes".cyan(),
        report.send_bytes + report.receive_bytes
    );
    println!(
        "  {}: {}%",
        "spilled register accesses".cyan(),
        report.spilled_access_percent()
    );
    println!(
        "  {}: {}",
        "artifacts".cyan(),
        args.output_dir.display()
    );
}
