use anyhow::Context as _;
use clap::{crate_version, Arg, ArgGroup, Command};
use inkwell::context::Context;
use kalc::{
    codegen::Generator,
    error::{Diagnostic, Diagnostics},
    lex::Lexer,
    parse::{Declaration, Parser},
    source::SourceMap,
};

use std::{
    fs::{self, OpenOptions},
    os::unix::fs::OpenOptionsExt,
    process,
    rc::Rc,
};

fn main() -> anyhow::Result<()> {
    let args = Command::new("Kaleidoscope compiler")
        .version(crate_version!())
        .arg(
            Arg::new("in")
                .long("in")
                .value_name("FILE")
                .help("Source file to compile"),
        )
        .arg(
            Arg::new("input")
                .value_name("FILE")
                .conflicts_with("in")
                .hide(true),
        )
        .arg(
            Arg::new("ll")
                .long("ll")
                .value_name("FILE")
                .help("Emit textual IR to this path"),
        )
        .arg(
            Arg::new("obj")
                .long("obj")
                .value_name("FILE")
                .help("Emit a relocatable object to this path"),
        )
        .arg(
            Arg::new("target")
                .long("target")
                .value_name("TRIPLE")
                .help("Target triple (defaults to the host)"),
        )
        .group(ArgGroup::new("source").args(["in", "input"]).required(true))
        .group(
            ArgGroup::new("emit")
                .args(["ll", "obj"])
                .required(true)
                .multiple(true),
        )
        .try_get_matches();

    let args = match args {
        Ok(args) => args,
        Err(error) => {
            error.print().context("failed to print usage")?;
            process::exit(1);
        }
    };

    let path = args
        .get_one::<String>("in")
        .or_else(|| args.get_one::<String>("input"))
        .expect("main.rs allowed a missing input file");

    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read source file: {}", path))?;
    let source = Rc::new(SourceMap::new(path.clone(), &text));

    let llvm = Context::create();
    let mut generator = Generator::new(
        &llvm,
        "kaleidoscope",
        args.get_one::<String>("target").map(String::as_str),
    )
    .context("failed to configure the target machine")?;

    let mut parser = Parser::new(Lexer::new(Rc::clone(&source), &text));
    let mut diagnostics = Diagnostics::default();

    while let Some(declaration) = parser.parse() {
        match declaration {
            Declaration::Error(error) => {
                diagnostics.push(Diagnostic::new("parse error", error));
            }

            declaration => {
                if let Err(error) = generator.declaration(&declaration) {
                    diagnostics.push(Diagnostic::new("codegen error", error));
                }
            }
        }
    }

    if !diagnostics.is_empty() {
        eprint!("{}", diagnostics);
    }

    if let Some(path) = args.get_one::<String>("ll") {
        let mut output = fs::File::create(path)
            .with_context(|| format!("failed to open for writing: {}", path))?;
        generator
            .emit_ir(&mut output)
            .with_context(|| format!("failed to emit IR to: {}", path))?;
    }

    if let Some(path) = args.get_one::<String>("obj") {
        // los mismos permisos con los que la mayoría de compiladores
        // crean archivos objeto
        let mut output = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o644)
            .open(path)
            .with_context(|| format!("failed to open for writing: {}", path))?;
        generator
            .emit_obj(&mut output)
            .with_context(|| format!("failed to emit object code to: {}", path))?;
    }

    Ok(())
}
