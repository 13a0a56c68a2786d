use std::fs::{self, File};
use std::io::{stdout, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::error::ErrorKind;
use clap::Parser;

use asm_bridge::postprocess::fixup_objfile;
use asm_bridge::preprocess::parse_source;
use asm_bridge::{Encoding, OptLevel, ProcOpts, SymbolVisibility};

#[derive(Clone, Debug, Parser)]
#[command(
    version,
    about = "Pre-process .c files and post-process .o files to enable embedding assembly into C",
    long_about = None
)]
struct AsmBridgeArgs {
    /// path to .c code
    filename: PathBuf,

    /// path to .o file to post-process
    #[clap(long)]
    post_process: Option<PathBuf>,

    /// assembler command (e.g. "mips-linux-gnu-as -march=vr4300 -mabi=32")
    #[clap(long)]
    assembler: Option<String>,

    /// path to a file containing a prelude to the assembly file (with .set and
    /// .macro directives, e.g.)
    #[clap(long)]
    asm_prelude: Option<PathBuf>,

    /// input encoding
    #[clap(long, default_value = "latin1")]
    input_enc: Encoding,

    /// output encoding
    #[clap(long, default_value = "latin1")]
    output_enc: Encoding,

    /// drop mdebug and gptab sections
    #[clap(long)]
    drop_mdebug_gptab: bool,

    /// change static symbol visibility
    #[clap(long, value_enum, default_value_t = SymbolVisibility::Local)]
    convert_statics: SymbolVisibility,

    /// force processing of files without GLOBAL_ASM blocks
    #[clap(long)]
    force: bool,

    /// replace floats with their encoded representation in CutsceneData arrays
    #[clap(long)]
    encode_cutscene_data_floats: bool,

    /// optimization level the compiler runs at (-O0, -O1, -O2)
    #[clap(short = 'O', value_name = "N")]
    opt: Option<u8>,

    /// debug codegen (-g)
    #[clap(short = 'g', long = "debug")]
    debug: bool,

    /// -O2 -g3 codegen (-g3)
    #[clap(long)]
    g3: bool,

    /// emit MIPS1-compatible stubs (-mips1)
    #[clap(long)]
    mips1: bool,

    /// compiler is invoked with -framepointer
    #[clap(long)]
    framepointer: bool,

    /// compiler is invoked with -KPIC
    #[clap(long)]
    kpic: bool,

    /// treat the input as Pascal regardless of its extension
    #[clap(long)]
    pascal: bool,
}

/// The legacy compiler drivers pass single-dash long flags; map them onto the
/// clap spellings so either form works.
fn normalize_args(args: impl Iterator<Item = String>) -> Vec<String> {
    args.map(|arg| {
        match arg.as_str() {
            "-g3" => "--g3",
            "-mips1" => "--mips1",
            "-framepointer" => "--framepointer",
            "-KPIC" => "--kpic",
            _ => return arg,
        }
        .to_string()
    })
    .collect()
}

fn resolve_opts(args: &AsmBridgeArgs) -> Result<ProcOpts> {
    let opt = match (args.opt, args.debug) {
        (Some(0), false) => OptLevel::O0,
        (Some(1), false) => OptLevel::O1,
        (Some(2), false) => OptLevel::O2,
        (None, true) => OptLevel::G,
        (None, false) => return Err(anyhow!("must pass one of -g, -O0, -O1, -O2")),
        (Some(_), true) => return Err(anyhow!("-g cannot be combined with -O")),
        (Some(_), false) => return Err(anyhow!("invalid optimization level (supported: -O0, -O1, -O2)")),
    };
    let opt = if args.g3 {
        if opt != OptLevel::O2 {
            return Err(anyhow!("-g3 is only supported together with -O2"));
        }
        OptLevel::G3
    } else {
        opt
    };

    if args.mips1 && (!matches!(opt, OptLevel::O1 | OptLevel::O2) || args.framepointer) {
        return Err(anyhow!("-mips1 is only supported together with -O1 or -O2"));
    }

    let filename_str = args.filename.to_string_lossy();
    let pascal = args.pascal
        || filename_str.ends_with(".p")
        || filename_str.ends_with(".pas")
        || filename_str.ends_with(".pp");
    if pascal && !matches!(opt, OptLevel::O1 | OptLevel::O2 | OptLevel::G3) {
        return Err(anyhow!(
            "Pascal is only supported together with -O1, -O2 or -O2 -g3"
        ));
    }

    Ok(ProcOpts {
        filename: args.filename.clone(),
        opt,
        framepointer: args.framepointer,
        mips1: args.mips1,
        kpic: args.kpic,
        pascal,
        input_enc: args.input_enc.clone(),
        output_enc: args.output_enc.clone(),
        encode_cutscene_data_floats: args.encode_cutscene_data_floats,
    })
}

fn run(args: &AsmBridgeArgs, opts: &ProcOpts) -> Result<()> {
    match &args.post_process {
        None => {
            let res = parse_source(&opts.filename, opts, true)
                .with_context(|| format!("failed to pre-process {}", opts.filename.display()))?;
            let mut out = stdout().lock();
            if res.functions.is_empty() && !args.force {
                // No GLOBAL_ASM blocks: pass the source through untouched
                // (re-encoded if the encodings differ).
                let raw = fs::read(&opts.filename)?;
                let text = opts.input_enc.decode(&raw)?;
                out.write_all(&opts.output_enc.encode(&text)?)?;
            } else {
                out.write_all(&res.output)?;
            }
            out.flush()?;
        }
        Some(objfile) => {
            let assembler = args
                .assembler
                .as_ref()
                .ok_or_else(|| anyhow!("must pass assembler command"))?;
            let res = parse_source(&opts.filename, opts, false)
                .with_context(|| format!("failed to pre-process {}", opts.filename.display()))?;
            if res.functions.is_empty() && !args.force {
                return Ok(());
            }

            let asm_prelude = match &args.asm_prelude {
                Some(path) => fs::read_to_string(path)
                    .with_context(|| format!("failed to read asm prelude {}", path.display()))?,
                None => include_str!("../prelude.inc").to_string(),
            };

            fixup_objfile(
                objfile,
                &res.functions,
                &asm_prelude,
                assembler,
                &opts.output_enc,
                args.drop_mdebug_gptab,
                &args.convert_statics,
            )
            .with_context(|| format!("failed to post-process {}", objfile.display()))?;

            if !res.deps.is_empty() {
                let deps_path = objfile.with_extension("asmproc.d");
                let mut deps_file = File::create(&deps_path)?;
                writeln!(
                    deps_file,
                    "{}: {}",
                    objfile.display(),
                    res.deps.join(" \\\n    ")
                )?;
                for dep in &res.deps {
                    writeln!(deps_file, "\n{}:", dep)?;
                }
            }
        }
    }
    Ok(())
}

fn main() {
    let argv = normalize_args(std::env::args());
    let args = match AsmBridgeArgs::try_parse_from(argv) {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Err(e) = resolve_opts(&args).and_then(|opts| run(&args, &opts)) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
