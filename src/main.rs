use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use lungo::vm::Vm;

#[derive(Parser)]
#[command(name = "lungo")]
#[command(about = "A miniature JVM bytecode interpreter", long_about = None)]
struct Cli {
    /// Directories searched for .class files.
    #[arg(short = 'c', long = "classpath", default_value = ".")]
    classpath: Vec<PathBuf>,

    /// Fully qualified main class, e.g. com/example/Main (dots accepted).
    main_class: String,

    /// Arguments passed to the guest program's main.
    args: Vec<String>,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let main_class = cli.main_class.replace('.', "/");
    let vm = Vm::new(cli.classpath, cli.args);
    vm.run(&main_class)
        .with_context(|| format!("failed to run '{main_class}'"))
}
