//! Jitlayer - compile-layer demo driver
//!
//! Registers a small module whose exported `answer` calls a host function the
//! module leaves undefined, resolves it lazily, runs it, then tears the layer
//! down.

use std::sync::Arc;

use anyhow::{Context, Result};
use jitlayer_core::engine::module::{types, InstBuilder};
use jitlayer_core::resolver::resolver_fn;
use jitlayer_core::{
    init, CompileLayer, JitCompileLayer, JitSymbol, LayerConfig, MangledSymbol, Module, Visibility,
};
use tracing::info;

/// Host function the demo module imports.
extern "C" fn host_offset() -> i64 {
    2
}

fn print_help() {
    println!("jitlayer - JIT compile-layer manager v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  jitlayer [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help           Print this help message");
    println!("  -v, --version        Print version information");
    println!("  -c, --config PATH    Load layer configuration from a JSON file");
    println!("      --report         Print layer metrics before exiting");
    println!();
    println!("DESCRIPTION:");
    println!("  Registers a demo module set with a Cranelift JIT engine, resolves its");
    println!("  undefined host symbol lazily, calls the compiled code and disposes the layer.");
}

fn demo_module() -> Module {
    let mut module = Module::new("demo");
    module
        .import_function("host_offset", &[], &[types::I64])
        .define_function("answer", Visibility::Exported, &[], &[types::I64], |b, scope| {
            let offset = scope.func_ref("host_offset", b.func)?;
            let entry = b.create_block();
            b.switch_to_block(entry);
            b.seal_block(entry);
            let call = b.ins().call(offset, &[]);
            let base = b.ins().iconst(types::I64, 40);
            let offset_value = b.inst_results(call)[0];
            let sum = b.ins().iadd(base, offset_value);
            b.ins().return_(&[sum]);
            Ok(())
        });
    module
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path: Option<String> = None;
    let mut report = false;

    let mut rest = args[1..].iter();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("jitlayer {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "-c" | "--config" => match rest.next() {
                Some(path) => config_path = Some(path.clone()),
                None => {
                    eprintln!("error: '{}' requires a path", arg);
                    std::process::exit(1);
                }
            },
            "--report" => report = true,
            _ => {
                eprintln!("error: unrecognized argument '{}'", arg);
                eprintln!("Run 'jitlayer --help' for usage information.");
                std::process::exit(1);
            }
        }
    }

    init()?;

    let config = match &config_path {
        Some(path) => LayerConfig::load(path)?,
        None => LayerConfig::default(),
    };
    let layer = JitCompileLayer::from_config(&config).context("Failed to create compile layer")?;

    let host_name = layer.mangle("host_offset")?;
    let resolver = resolver_fn(move |name: &MangledSymbol| {
        if *name == host_name {
            JitSymbol::absolute(host_offset as *const () as usize as u64)
        } else {
            JitSymbol::NotFound
        }
    });

    let handle = layer.add_module_set(vec![demo_module()], Arc::new(resolver))?;
    let answer = layer.find_symbol(&layer.mangle("answer")?, true)?;
    let address = answer
        .address()
        .context("Compiled module does not export 'answer'")?;

    // SAFETY: `answer` was defined above with signature () -> i64 and its
    // module set stays registered until after the call.
    let answer_fn: extern "C" fn() -> i64 = unsafe { std::mem::transmute(address as usize) };
    info!(%handle, result = answer_fn(), "Called compiled 'answer'");

    layer.remove_module_set(handle)?;
    let snapshot = layer.metrics().snapshot();
    layer.dispose()?;

    if report {
        snapshot.print_report();
    }
    Ok(())
}
