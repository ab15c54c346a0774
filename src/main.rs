use std::collections::HashMap;
use std::env;
use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use pourover::pipeline::{emit_manifest, translate, DirectorySource};
use pourover::value::HeapObject;
use pourover::{Heap, Manifest, Runtime, RuntimeConfig, Value};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: pourover <dir> [Class.method:descriptor [int args...]]";
const PRINT_STREAM: &str = "java/io/PrintStream";
const DEFAULT_LOG: &str = "pourover=info";

fn main() -> Result<()> {
    install_tracing();

    let mut args = env::args().skip(1);
    let Some(dir) = args.next() else {
        bail!(USAGE);
    };
    // 1. Parse and normalize every listing in the directory.
    let classes = translate(&DirectorySource::new(&dir))
        .with_context(|| format!("failed to translate listings in {dir}"))?;

    // 2. Without a target the manifest is the output.
    let Some(target) = args.next() else {
        let mut stdout = io::stdout().lock();
        emit_manifest(&classes, &mut stdout)?;
        writeln!(stdout)?;
        return Ok(());
    };

    // 3. Otherwise load the runtime and run the target.
    let (class, method, descriptor) = parse_target(&target)?;
    let call_args = args
        .map(|arg| {
            arg.parse::<i32>()
                .map(Value::Int)
                .with_context(|| format!("argument `{arg}` is not an int"))
        })
        .collect::<Result<Vec<_>>>()?;

    let config = RuntimeConfig::from_env()?;
    let mut runtime = Runtime::with_config(Manifest::load(classes)?, config);
    install_console(&mut runtime);
    debug!(
        classes = runtime.manifest().len(),
        config = ?runtime.config(),
        "runtime ready"
    );

    match runtime.invoke_static(class, method, descriptor, &call_args)? {
        Some(value) => println!("{}", runtime.heap().render(value)),
        None => info!(method = %target, "returned void"),
    }
    let profiler = runtime.profiler();
    for header in profiler.hot_loops() {
        info!(
            method = header.method_id,
            header = header.instruction_index,
            entries = profiler.entries(&header),
            "hot loop"
        );
    }
    info!(executed = profiler.executed(), "done");
    Ok(())
}

fn install_tracing() {
    let filter = log_filter(env::var("RUST_LOG").ok().as_deref());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// `RUST_LOG` wins; the default only applies when it is unset or invalid.
fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG))
}

/// Split `Class.method:descriptor`.
fn parse_target(target: &str) -> Result<(&str, &str, &str)> {
    let Some((qualified, descriptor)) = target.split_once(':') else {
        bail!("target `{target}` has no descriptor\n{USAGE}");
    };
    let Some((class, method)) = qualified.rsplit_once('.') else {
        bail!("target `{target}` has no class\n{USAGE}");
    };
    Ok((class, method, descriptor))
}

/// Give `System.out` an object and route `print`/`println` to stdout.
fn install_console(runtime: &mut Runtime) {
    let out = runtime.heap_mut().alloc(HeapObject::Instance {
        class: PRINT_STREAM.to_string(),
        fields: HashMap::new(),
    });
    runtime.set_static("java/lang/System", "out", Value::Ref(out));

    for descriptor in [
        "(Ljava/lang/String;)V",
        "(Ljava/lang/Object;)V",
        "(I)V",
        "(Z)V",
        "(C)V",
    ] {
        runtime.register_bridge(PRINT_STREAM, "println", descriptor, move |call| {
            println!("{}", render(call.heap, descriptor, first_arg(call.args)));
            Ok(Value::Null)
        });
        runtime.register_bridge(PRINT_STREAM, "print", descriptor, move |call| {
            print!("{}", render(call.heap, descriptor, first_arg(call.args)));
            let _ = io::stdout().flush();
            Ok(Value::Null)
        });
    }
    runtime.register_bridge(PRINT_STREAM, "println", "()V", |_| {
        println!();
        Ok(Value::Null)
    });
}

fn first_arg(args: &[Value]) -> Value {
    args.first().copied().unwrap_or(Value::Null)
}

fn render(heap: &Heap, descriptor: &str, value: Value) -> String {
    match (descriptor, value) {
        ("(Z)V", Value::Int(v)) => (v != 0).to_string(),
        ("(C)V", Value::Int(v)) => char::from_u32(v as u32).map_or_else(|| v.to_string(), String::from),
        _ => heap.render(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_log_directives_are_kept() {
        assert_eq!(log_filter(Some("pourover=debug")).to_string(), "pourover=debug");
        assert_eq!(log_filter(None).to_string(), DEFAULT_LOG);
        assert_eq!(log_filter(Some("pourover=loud")).to_string(), DEFAULT_LOG);
    }

    #[test]
    fn splits_targets() {
        assert_eq!(
            parse_target("demo.Sample.add:(II)I").unwrap(),
            ("demo.Sample", "add", "(II)I")
        );
        assert!(parse_target("Sample.add").is_err());
        assert!(parse_target("add:(II)I").is_err());
    }
}
