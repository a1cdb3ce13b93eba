use clap::Parser as ClapParser;
use std::{fs, process, time::Duration};

use strand::{FiberOutcome, Runtime, RuntimeConfig, Value};
use strand_bytecode::Module;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serialized module to load
    #[arg(help = "The .strm module to run")]
    module: String,

    /// Function to run on the entry fiber
    #[arg(long, default_value = "main")]
    entry: String,

    /// Integer arguments for the entry function
    #[arg(long = "arg", allow_negative_numbers = true)]
    args: Vec<i64>,

    /// Upper bound of pool worker threads; 0 runs everything on this thread
    #[arg(long)]
    workers: Option<usize>,

    /// Instructions per scheduling slice
    #[arg(long)]
    quantum: Option<usize>,

    #[arg(long, help = "Maximum call depth before StackOverflow")]
    max_depth: Option<usize>,

    /// Seconds to wait for the entry fiber
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Print constants, classes and disassembly instead of executing
    #[arg(long, help = "Dump the module instead of running it")]
    dump: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let bytes = match fs::read(&cli.module) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("Error reading module '{}': {}", cli.module, err);
            process::exit(1);
        }
    };
    let module = match Module::decode(&bytes) {
        Ok(module) => module,
        Err(err) => {
            eprintln!("Error decoding {}: {}", cli.module, err);
            process::exit(1);
        }
    };

    if cli.dump {
        dump_module(&module);
        return;
    }

    let mut config = RuntimeConfig {
        timeout: Duration::from_secs(cli.timeout),
        ..Default::default()
    };
    if let Some(workers) = cli.workers {
        config.scale.max_pool_workers = workers;
    }
    if let Some(quantum) = cli.quantum {
        config.quantum = quantum;
    }
    if let Some(depth) = cli.max_depth {
        config.max_call_depth = depth;
    }

    let runtime = match Runtime::new(&module, config) {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error loading {}: {}", cli.module, err);
            process::exit(1);
        }
    };

    let args = cli.args.iter().copied().map(Value::Int).collect();
    let report = match runtime.run(&cli.entry, args) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("Error running {}: {}", cli.entry, err);
            process::exit(1);
        }
    };

    match &report.outcome {
        FiberOutcome::Returned(value) => println!("{}", value.value()),
        FiberOutcome::Faulted(exception) => {
            eprintln!("Unhandled {exception}");
            print_trace(report.trace());
            process::exit(1);
        }
        FiberOutcome::Host { error, trace } => {
            eprintln!("Internal error: {error}");
            print_trace(trace);
            process::exit(2);
        }
    }
}

fn print_trace(trace: &[String]) {
    for line in trace {
        eprintln!("    at {line}");
    }
}

fn dump_module(module: &Module) {
    println!("== {} ==", module.name);
    println!("constants:");
    for (i, constant) in module.constants.iter().enumerate() {
        println!("{i:>4}: {constant:?}");
    }
    println!("classes:");
    for class in &module.classes {
        let mut header = class.name.clone();
        if let Some(super_class) = &class.super_class {
            header.push_str(&format!(" : {super_class}"));
        }
        if !class.mixins.is_empty() {
            header.push_str(&format!(" + {}", class.mixins.join(", ")));
        }
        println!("  {header} ({} fields)", class.fields);
        for &index in &class.methods {
            if let Some(method) = module.methods.get(index as usize) {
                println!("    @{index} {}", method.name);
            }
        }
    }
    for (index, method) in module.methods.iter().enumerate() {
        let params: Vec<&str> = method
            .params
            .iter()
            .map(|p| p.as_deref().unwrap_or("_"))
            .collect();
        println!(
            "@{index} {}({}) [{} registers]",
            method.name,
            params.join(", "),
            method.registers
        );
        for (i, op) in method.code.iter().enumerate() {
            println!("{i:>4}: {op}");
        }
    }
}
