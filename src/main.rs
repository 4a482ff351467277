//! Vellum CLI: run, disassemble and link object files.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use colored::Colorize;
use tracing_subscriber::{fmt, EnvFilter};

use vellum::link::{resolve, DirectoryProvider, Program};
use vellum::object::{decode, disassemble, ImportId};
use vellum::{HostValue, Outcome, RuntimeConfig, VellumError};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// CLI command to execute.
enum Command {
    /// Invoke an exported function
    Run {
        file: String,
        entry: String,
        args: Vec<String>,
        json: bool,
    },
    /// Print an object's sections and code
    Disasm { file: String },
    /// Resolve an object's imports and print the bindings
    Link { file: String },
    Help,
    Version,
}

/// CLI options parsed from arguments.
struct Options {
    command: Command,
    paths: Vec<PathBuf>,
    config: Option<PathBuf>,
}

fn print_usage() {
    eprintln!("Vellum {} - bytecode object toolchain", VERSION);
    eprintln!();
    eprintln!("Usage: vellum run <object.vlo> [--entry NAME] [--path DIR]... [--config FILE] [--json] [ARGS...]");
    eprintln!("       vellum disasm <object.vlo>");
    eprintln!("       vellum link <object.vlo> [--path DIR]...");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  run <object>     Load, link and invoke an exported function");
    eprintln!("  disasm <object>  Print the object's tables and disassembled code");
    eprintln!("  link <object>    Resolve imports and show where each one is bound");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --entry NAME     Function to invoke (default: main)");
    eprintln!("  --path DIR       Search DIR for imported modules (repeatable;");
    eprintln!("                   default: the object's directory)");
    eprintln!("  --config FILE    Runtime configuration (YAML)");
    eprintln!("  --json           Print the result as JSON");
    eprintln!("  --help, -h       Show this help message");
    eprintln!("  --version, -V    Show the version");
    eprintln!();
    eprintln!("Arguments are parsed as Int, Float, true/false, nil, or else Str.");
    eprintln!("Set RUST_LOG (e.g. RUST_LOG=vellum=debug) to control logging.");
}

fn usage_error(message: &str) -> ! {
    eprintln!("{} {}", "error:".red().bold(), message);
    print_usage();
    process::exit(64);
}

fn take_value(args: &[String], i: &mut usize, flag: &str) -> String {
    *i += 1;
    match args.get(*i) {
        Some(value) => value.clone(),
        None => usage_error(&format!("{} requires a value", flag)),
    }
}

fn parse_args(args: &[String]) -> Options {
    let mut options = Options {
        command: Command::Help,
        paths: Vec::new(),
        config: None,
    };
    let Some(first) = args.first() else {
        return options;
    };

    let command = first.as_str();
    match command {
        "--help" | "-h" | "help" => return options,
        "--version" | "-V" => {
            options.command = Command::Version;
            return options;
        }
        "run" | "disasm" | "link" => {}
        other => usage_error(&format!("unknown command '{}'", other)),
    }

    let mut file = None;
    let mut entry = "main".to_string();
    let mut json = false;
    let mut rest = Vec::new();

    let mut i = 1;
    while i < args.len() {
        let arg = &args[i];
        match arg.as_str() {
            "--entry" if command == "run" => entry = take_value(args, &mut i, "--entry"),
            "--config" if command == "run" => {
                options.config = Some(PathBuf::from(take_value(args, &mut i, "--config")))
            }
            "--json" if command == "run" => json = true,
            "--path" if command != "disasm" => {
                options.paths.push(PathBuf::from(take_value(args, &mut i, "--path")))
            }
            "--help" | "-h" => {
                options.command = Command::Help;
                return options;
            }
            // Negative numbers are arguments, not flags.
            flag if flag.starts_with("--") => {
                usage_error(&format!("unknown option for {}: {}", command, flag))
            }
            _ if file.is_none() => file = Some(arg.clone()),
            _ if command == "run" => rest.push(arg.clone()),
            _ => usage_error(&format!("unexpected argument: {}", arg)),
        }
        i += 1;
    }

    let Some(file) = file else {
        usage_error(&format!("{} requires an object file", command));
    };
    options.command = match command {
        "run" => Command::Run {
            file,
            entry,
            args: rest,
            json,
        },
        "disasm" => Command::Disasm { file },
        _ => Command::Link { file },
    };
    options
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vellum=info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn fail(err: impl std::fmt::Display, code: i32) -> ! {
    eprintln!("{} {}", "error:".red().bold(), err);
    process::exit(code);
}

/// Search roots for imports: the given paths, or the object's directory.
fn provider_for(file: &Path, paths: &[PathBuf]) -> DirectoryProvider {
    if paths.is_empty() {
        let dir = file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        DirectoryProvider::new(dir)
    } else {
        DirectoryProvider::with_roots(paths.to_vec())
    }
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig, VellumError> {
    let config = match path {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn run(file: &str, entry: &str, args: &[String], json: bool, options: &Options) {
    let config = load_config(options.config.as_deref()).unwrap_or_else(|e| fail(e, 1));
    let path = Path::new(file);
    let args: Vec<HostValue> = args.iter().map(|a| HostValue::parse_arg(a)).collect();
    let provider = provider_for(path, &options.paths);

    match vellum::run_file(path, entry, &args, config, provider) {
        Ok(Outcome::Returned(value)) => {
            if json {
                match serde_json::to_string_pretty(&value) {
                    Ok(text) => println!("{}", text),
                    Err(e) => fail(e, 1),
                }
            } else {
                println!("{}", value);
            }
        }
        Ok(Outcome::Trapped(trap)) => {
            eprintln!("{} {}", "trap:".red().bold(), trap);
            process::exit(70);
        }
        Err(VellumError::Invoke(e)) => fail(e, 64),
        Err(e) => fail(e, 1),
    }
}

fn read_object(file: &str) -> vellum::object::ObjectFile {
    let bytes = fs::read(file).unwrap_or_else(|e| fail(format!("{}: {}", file, e), 1));
    decode(&bytes).unwrap_or_else(|e| fail(format!("{}: {}", file, e), 1))
}

fn disasm(file: &str) {
    let object = read_object(file);
    print!("{}", disassemble(&object));
}

fn link(file: &str, options: &Options) {
    let object = read_object(file);
    let provider = provider_for(Path::new(file), &options.paths);
    let set = resolve(std::sync::Arc::new(object), &provider).unwrap_or_else(|e| fail(e, 1));
    let program = Program::link(set);
    program.verify().unwrap_or_else(|e| fail(e, 1));

    for (o, object) in program.objects().iter().enumerate() {
        println!("{} {}", format!("[{}]", o).dimmed(), object.module_name().bold());
        for (i, import) in object.imports.iter().enumerate() {
            let name = object.import_name(ImportId(i as u32));
            match program.binding(o, i as u32) {
                Some(binding) => {
                    let target = &program.objects()[binding.object];
                    println!(
                        "    {} {} -> [{}] {} {} #{}",
                        import.kind,
                        name,
                        binding.object,
                        target.module_name(),
                        binding.kind,
                        binding.index
                    );
                }
                None => println!("    {} {} -> {}", import.kind, name, "unbound".red()),
            }
        }
    }
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let options = parse_args(&args);
    init_logging();

    match &options.command {
        Command::Run {
            file,
            entry,
            args,
            json,
        } => run(file, entry, args, *json, &options),
        Command::Disasm { file } => disasm(file),
        Command::Link { file } => link(file, &options),
        Command::Help => print_usage(),
        Command::Version => println!("vellum {}", VERSION),
    }
}
