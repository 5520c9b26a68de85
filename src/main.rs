//! Утилита командной строки `diffgraph`: запуск сохраненных графов и импорт внешних.

use clap::{Parser, Subcommand};
use diffgraph::autograd::grad_name;
use diffgraph::import::{ExternalFormat, ExternalGraph, ImportRegistry};
use diffgraph::runtime::CpuBackend;
use diffgraph::serialization::{load_graph, save_graph};
use diffgraph::tensor::{Precision, TensorHandle};
use diffgraph::Graph;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Аргументы командной строки
#[derive(Parser, Debug)]
#[command(author, version, about = "diffgraph: differentiable computation graphs", long_about = None)]
struct Args {
    /// Логировать на уровне debug, если RUST_LOG не задает иное
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Выполнить сохраненный граф и напечатать вычисленные переменные
    Run {
        /// Каталог, записанный `import` или `save_graph`
        dir: PathBuf,
        /// Также построить и выполнить граф градиентов этой переменной с начальным градиентом из единиц
        #[arg(long)]
        backward: Option<String>,
    },
    /// Импортировать JSON-дамп внешних узлов и сохранить полученный граф
    Import {
        /// Исходный формат: tensorflow (tf) или onnx
        #[arg(long)]
        format: ExternalFormat,
        /// JSON-файл с `nodes` и необязательными `tensors`
        nodes: PathBuf,
        /// Каталог для результата
        out_dir: PathBuf,
        /// Вычислять с двойной точностью
        #[arg(long = "f64")]
        double: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match args.command {
        Command::Run { dir, backward } => run(&dir, backward.as_deref()),
        Command::Import {
            format,
            nodes,
            out_dir,
            double,
        } => import(format, &nodes, &out_dir, double),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn print_tensor(name: &str, tensor: &TensorHandle) {
    println!("{} {:?} = {:?}", name, tensor.shape(), tensor.to_vec());
}

fn run(dir: &Path, backward: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let mut graph = load_graph(dir)?;
    let kernels = CpuBackend::new();
    let values = graph.execute(&kernels)?;
    for var in graph.variables().filter(|v| !v.is_leaf()) {
        if let Some(t) = values.get(var.name()) {
            print_tensor(var.name(), t);
        }
    }

    if let Some(output) = backward {
        let id = graph.id_of(output)?;
        let shape = graph
            .tensor(output)
            .map(|t| t.shape().to_vec())
            .unwrap_or_default();
        let seed = TensorHandle::ones(&shape, graph.precision());
        let grads = graph.exec_backward(&kernels, id, seed)?;
        for var in graph.variables() {
            let name = grad_name(var.name());
            if let Some(t) = grads.get(&name) {
                print_tensor(&name, t);
            }
        }
    }
    Ok(())
}

fn import(format: ExternalFormat, nodes: &Path, out_dir: &Path, double: bool) -> Result<(), Box<dyn std::error::Error>> {
    let dump: ExternalGraph = serde_json::from_str(&std::fs::read_to_string(nodes)?)?;
    let precision = if double { Precision::F64 } else { Precision::F32 };
    let mut graph = Graph::with_precision(precision);
    let tensors = dump.tensor_handles(precision)?;
    graph.import_with(&ImportRegistry::default(), format, &dump.nodes, &tensors)?;
    save_graph(&graph, out_dir)?;
    tracing::info!(
        variables = graph.variable_count(),
        operations = graph.operation_count(),
        out = %out_dir.display(),
        "imported graph"
    );
    Ok(())
}
