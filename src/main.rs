use std::{env, fs};

use stacklift::unit::asm::Assembler;
use stacklift::unit::disasm::print_unit;
use stacklift::{Translator, TranslatorConfig, Unit};
use tracing::{error, info};

/// Log to stderr. `RUST_LOG` wins over the `-v`/`-vv` default.
fn init_logging(default: &str) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    let strict = args.contains(&"--strict".to_string());
    let bytecode = args.contains(&"--bc".to_string());
    let demo = args.contains(&"--demo".to_string());
    let level = if args.contains(&"-vv".to_string()) {
        "trace"
    } else if args.contains(&"-v".to_string()) {
        "debug"
    } else {
        "warn"
    };
    init_logging(level);

    let out = match args.iter().position(|a| a == "--out") {
        Some(pos) => match args.get(pos + 1) {
            Some(path) => Some(path.clone()),
            None => {
                eprintln!("Error: --out needs a file name");
                std::process::exit(1);
            }
        },
        None => None,
    };

    // first non-flag argument that is not the --out value
    let filename = args
        .iter()
        .enumerate()
        .skip(1)
        .find(|(i, a)| !a.starts_with('-') && args[i - 1] != "--out")
        .map(|(_, a)| a.clone());

    let unit = match (filename, demo) {
        (_, true) => demo_unit(),
        (Some(filename), false) => load_unit(&filename),
        (None, false) => {
            print_usage();
            std::process::exit(1);
        }
    };

    if bytecode {
        print_unit(&unit);
    }

    let config = TranslatorConfig {
        strict_opcodes: strict,
        module_name: module_name(&unit.filepath),
        ..TranslatorConfig::default()
    };
    let module = match Translator::with_config(config).translate_unit(&unit) {
        Ok(m) => m,
        Err(e) => {
            error!("translation failed: {}", e);
            std::process::exit(1);
        }
    };

    match out {
        Some(path) => {
            let bytes = match module.to_bytes() {
                Ok(b) => b,
                Err(e) => {
                    eprintln!("Failed to encode module: {}", e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = fs::write(&path, bytes) {
                eprintln!("Failed to write '{}': {}", path, e);
                std::process::exit(1);
            }
            info!("wrote {}", path);
        }
        None => print!("{}", module),
    }
}

fn print_usage() {
    println!("STACKLIFT - bytecode to IR translator");
    println!();
    println!("Usage:");
    println!("  stacklift <unit.bin>              Translate a unit and print the IR");
    println!("  stacklift <unit.bin> --out FILE   Write the encoded IR module to FILE");
    println!("  stacklift --demo                  Translate a built-in sample unit");
    println!();
    println!("Options:");
    println!("  --bc        Print the unit's disassembly first");
    println!("  --strict    Fail on opcodes the translator does not model");
    println!("  -v, -vv     Log translation progress to stderr");
    println!("  --help, -h  Show this help");
}

fn load_unit(filename: &str) -> Unit {
    let bytes = match fs::read(filename) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", filename, e);
            std::process::exit(1);
        }
    };
    match Unit::from_bytes(&bytes) {
        Ok(unit) => unit,
        Err(e) => {
            eprintln!("Failed to decode unit '{}': {}", filename, e);
            std::process::exit(1);
        }
    }
}

/// Module name derived from the unit's source path.
fn module_name(filepath: &str) -> String {
    std::path::Path::new(filepath)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("module")
        .to_string()
}

/// A small unit exercising calls, branches, locals and a protected region.
fn demo_unit() -> Unit {
    let mut unit = Unit::new("demo.php");

    let mut greet = Assembler::new(&mut unit, "greet");
    let who = greet.param("who");
    let loud = greet.param("loud");
    let quiet = greet.new_label();
    let done = greet.new_label();
    greet.cget_l(loud).jmp_z(quiet);
    greet.string("HELLO").print().pop_c().jmp(done);
    greet.bind(quiet).string("hello").print().pop_c();
    greet.bind(done).cget_l(who).print().pop_c();
    greet.null().ret_c();
    greet.finish();

    let mut main = Assembler::pseudo_main(&mut unit);
    let start = main.bound_label();
    let end = main.new_label();
    let handler = main.new_label();
    let exit = main.new_label();
    main.fpush_func_d(2, "greet");
    main.string("world").fpass_c(0).int(1).fpass_c(1).fcall(2).pop_c();
    main.bind(end).jmp(exit);
    main.bind(handler).catch().pop_c();
    main.bind(exit).int(1).ret_c();
    main.catch_region(start, end, &[("Exception", handler)]);
    main.finish();

    unit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_unit_translates() {
        let module = Translator::new().translate_unit(&demo_unit()).unwrap();
        assert_eq!(module.function_names(), vec!["greet", "main"]);
    }

    #[test]
    fn test_module_name_from_path() {
        assert_eq!(module_name("dir/demo.php"), "demo");
        assert_eq!(module_name("unit"), "unit");
        assert_eq!(module_name(""), "module");
    }
}
