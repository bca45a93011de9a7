use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use minicil::{LoadedProgram, RuntimeConfig, Vm, VmError};

#[derive(Parser)]
#[command(name = "minicil")]
#[command(about = "A minimal CIL execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program image
    Run {
        /// Program image (.toml or .json)
        file: PathBuf,

        /// Arguments passed to the entry point
        #[arg(last = true)]
        program_args: Vec<String>,

        /// Runtime configuration file (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Print GC statistics
        #[arg(long)]
        gc_stats: bool,

        /// Disable collection at method return
        #[arg(long)]
        no_gc: bool,

        /// Verify every method body before running it
        #[arg(long)]
        verify: bool,

        /// Maximum managed call depth
        #[arg(long)]
        max_call_depth: Option<usize>,
    },
    /// Decode and verify every method body without running
    Check {
        /// Program image (.toml or .json)
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            program_args,
            config,
            gc_stats,
            no_gc,
            verify,
            max_call_depth,
        } => {
            let mut config = match config {
                Some(path) => match RuntimeConfig::load(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        eprintln!("error: {}", e);
                        return ExitCode::FAILURE;
                    }
                },
                None => RuntimeConfig::default(),
            };
            config.gc_stats |= gc_stats;
            config.gc_enabled &= !no_gc;
            config.verify_bodies |= verify;
            if let Some(depth) = max_call_depth {
                config.max_call_depth = depth;
            }

            match run_file(&file, config, &program_args) {
                // the process status keeps only the low byte: 256 exits 0, -1 exits 255
                Ok(code) => return ExitCode::from(code as u8),
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
        Commands::Check { file } => match check_file(&file) {
            Ok(count) => println!("{} method bodies verified.", count),
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
    }

    ExitCode::SUCCESS
}

fn run_file(path: &Path, config: RuntimeConfig, args: &[String]) -> Result<i32, VmError> {
    let mut program = LoadedProgram::from_path(path)?;
    let gc_stats = config.gc_stats;
    let mut vm = Vm::new_with_config(config, Box::new(std::io::stdout()));
    let result = vm.execute_entry_point_with_args(&mut program, args);

    if gc_stats {
        let stats = vm.gc_stats();
        eprintln!(
            "[GC] Allocated: {}, Minor: {}, Major: {}, Promoted: {}, Reclaimed: {}",
            stats.allocated,
            stats.minor_collections,
            stats.major_collections,
            stats.promoted,
            stats.reclaimed
        );
    }
    result
}

fn check_file(path: &Path) -> Result<usize, VmError> {
    LoadedProgram::from_path(path)?.check()
}
