use clap::{Parser, Subcommand};
use std::{
    fs,
    path::PathBuf,
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use vm::{Status, Vm, VmConfig, disasm};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a RITE image and execute it
    Run {
        /// The .mrb image to execute
        file: PathBuf,

        /// Register-file capacity
        #[arg(long, default_value_t = vm::MAX_REGS_SIZE)]
        max_regs: usize,

        /// Deepest call chain before SystemStackError
        #[arg(long, default_value_t = vm::MAX_CALLINFO_DEPTH)]
        max_depth: usize,

        /// Trace every instruction (needs RUST_LOG=trace)
        #[arg(long)]
        debug: bool,

        /// Preempt the VM at this interval and resume it
        #[arg(long, value_name = "MS")]
        preempt_ms: Option<u64>,
    },
    /// Print the IREP tree of a RITE image
    Dump {
        /// The .mrb image to list
        file: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            file,
            max_regs,
            max_depth,
            debug,
            preempt_ms,
        } => {
            let config = VmConfig::default()
                .with_max_regs(max_regs)
                .with_max_depth(max_depth)
                .with_debug(debug);
            let code = run_image(&read_image(&file), config, preempt_ms);
            process::exit(code);
        }
        Command::Dump { file } => {
            let irep = match vm::load(read_image(&file)) {
                Ok(irep) => irep,
                Err(err) => {
                    eprintln!("Error loading {}: {}", file.display(), err);
                    process::exit(1);
                }
            };
            print!("{}", disasm::disassemble(&irep));
        }
    }
}

fn read_image(file: &PathBuf) -> Vec<u8> {
    match fs::read(file) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("Error reading file '{}': {}", file.display(), err);
            process::exit(1);
        }
    }
}

/// Run the image to completion and return the process exit code.
fn run_image(image: &[u8], config: VmConfig, preempt_ms: Option<u64>) -> i32 {
    let mut vm = Vm::open(config);
    if let Err(err) = vm.load(image) {
        eprintln!("Error loading image: {err}");
        return 1;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let ticker = preempt_ms.map(|ms| {
        let handle = vm.preempt_handle();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(ms.max(1)));
                handle.preempt();
            }
        })
    });

    let mut slices = 0usize;
    let outcome = loop {
        match vm.run() {
            Ok(Status::Preempted) => slices += 1,
            other => break other,
        }
    };
    stop.store(true, Ordering::Release);
    if let Some(ticker) = ticker {
        let _ = ticker.join();
    }
    if slices > 0 {
        log::info!("vm {}: resumed {slices} times", vm.vm_id());
    }
    let _ = vm.system().flush_output();

    let code = match outcome {
        Ok(_) => 0,
        Err(err) => {
            eprintln!("Error executing image: {err}");
            1
        }
    };
    vm.close();
    code
}
