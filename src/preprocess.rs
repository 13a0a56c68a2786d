use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use crate::asm::{Function, GlobalAsmBlock, GlobalState};
use crate::error::{Error, Result};
use crate::{OptLevel, ProcOpts};

/// Bounds `#pragma asmproc recurse` nesting; also what breaks include cycles.
const MAX_INCLUDE_DEPTH: usize = 32;

lazy_static! {
    static ref CUTSCENE_DATA_RE: Regex = Regex::new(r"CutsceneData (.|\n)*\[\] = \{").unwrap();
    static ref FLOAT_RE: Regex =
        Regex::new(r"[-+]?[0-9]*\.?[0-9]+([eE][-+]?[0-9]+)?f").unwrap();
}

fn repl_float_hex(caps: &Captures) -> String {
    let float_str = caps[0].trim().trim_end_matches('f');
    match float_str.parse::<f32>() {
        Ok(f) => f.to_bits().to_string(),
        Err(_) => caps[0].to_string(),
    }
}

#[derive(Default, Debug)]
pub struct RunResult {
    pub functions: Vec<Function>,
    pub deps: Vec<String>,
    pub output: Vec<u8>,
}

/// Derives the per-opt-level instruction profile the IDO compiler exhibits:
/// how many instructions a function must at least have, how many of its first
/// instructions belong to the prologue and carry no statement, and whether
/// jump tables are usable for late rodata.
pub fn global_state_for(opts: &ProcOpts) -> GlobalState {
    let (mut min_instr_count, mut skip_instr_count) = match (opts.opt, opts.framepointer) {
        (OptLevel::O1 | OptLevel::O2, true) => (6, 5),
        (OptLevel::O1 | OptLevel::O2, false) => (2, 1),
        (OptLevel::O0, true) => (8, 8),
        (OptLevel::O0, false) => (4, 4),
        (OptLevel::G, true) => (7, 7),
        (OptLevel::G, false) => (4, 4),
        (OptLevel::G3, true) => (4, 4),
        (OptLevel::G3, false) => (2, 2),
    };

    let mut prelude_if_late_rodata = 0;
    if opts.kpic {
        // Without optimizations, the PIC prelude always takes up 3 instructions.
        // With optimizations, the prelude is optimized out if there's no late rodata.
        if matches!(opts.opt, OptLevel::O2 | OptLevel::G3) {
            prelude_if_late_rodata = 3;
        } else {
            min_instr_count += 3;
            skip_instr_count += 3;
        }
    }

    let use_jtbl_for_rodata =
        matches!(opts.opt, OptLevel::O2 | OptLevel::G3) && !opts.framepointer && !opts.kpic;

    GlobalState::new(
        min_instr_count,
        skip_instr_count,
        use_jtbl_for_rodata,
        prelude_if_late_rodata,
        opts.mips1,
        opts.pascal,
    )
}

/// Pre-processes one source file: every GLOBAL_ASM block is replaced by stub
/// declarations sized by the analyzer, everything else passes through with
/// one output line per input line so compiler diagnostics keep their line
/// numbers.
pub fn parse_source(filename: &Path, opts: &ProcOpts, encode_output: bool) -> Result<RunResult> {
    let raw = fs::read(filename)?;
    let text = opts.input_enc.decode(&raw)?.into_owned();

    let mut state = global_state_for(opts);
    let mut res = RunResult::default();
    let output_lines = process_text(
        &text,
        filename,
        opts,
        &mut state,
        &mut res.functions,
        &mut res.deps,
        0,
    )?;

    if encode_output {
        for line in &output_lines {
            res.output.extend_from_slice(&opts.output_enc.encode(line)?);
            res.output.push(b'\n');
        }
    }
    Ok(res)
}

#[allow(clippy::too_many_arguments)]
fn process_text(
    text: &str,
    filename: &Path,
    opts: &ProcOpts,
    state: &mut GlobalState,
    functions: &mut Vec<Function>,
    deps: &mut Vec<String>,
    depth: usize,
) -> Result<Vec<String>> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(Error::AsmSyntax(format!(
            "#pragma asmproc recurse nested deeper than {} includes (include cycle?)",
            MAX_INCLUDE_DEPTH
        )));
    }

    let mut output_lines = vec![format!("#line 1 \"{}\"", filename.display())];
    let mut global_asm: Option<(GlobalAsmBlock, usize)> = None;
    let mut is_cutscene_data = false;
    let mut is_early_include = false;

    for (i, source_line) in text.lines().enumerate() {
        let line_no = i + 1;
        let raw_line = source_line.trim_end();
        let line = raw_line.trim_start();

        // Print exactly one output line per source line, to make compiler
        // errors have correct line numbers. These will be overridden with
        // reasonable content further down.
        output_lines.push(String::new());
        let current = output_lines.len() - 1;

        if let Some((block, start_index)) = global_asm.as_mut() {
            if line.starts_with(')') {
                let (src, function) = block.finish(state)?;
                let start_index = *start_index;
                for (j, line2) in src.into_iter().enumerate() {
                    output_lines[start_index + j] = line2;
                }
                functions.push(function);
                global_asm = None;
            } else {
                block.process_line(raw_line, &opts.output_enc)?;
            }
        } else if line == "GLOBAL_ASM(" || line == "#pragma GLOBAL_ASM(" {
            let block = GlobalAsmBlock::new(format!("GLOBAL_ASM block at line {}", line_no));
            global_asm = Some((block, output_lines.len()));
        } else if let Some((fname, prologue)) = external_asm_reference(line) {
            let mut ext_global_asm = GlobalAsmBlock::new(fname.clone());
            for line2 in prologue {
                ext_global_asm.process_line(line2, &opts.output_enc)?;
            }
            let contents = match fs::read(&fname) {
                Ok(contents) => contents,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    // The GLOBAL_ASM block might be surrounded by an ifdef, so
                    // it's not clear whether a missing file actually represents
                    // a compile error. Pass the responsibility for determining
                    // that on to the compiler by emitting a bad include
                    // directive. (IDO treats #error as a warning for some
                    // reason.)
                    output_lines[current] = format!("#include \"GLOBAL_ASM:{}\"", fname);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let contents = opts.input_enc.decode(&contents)?;
            for line2 in contents.lines() {
                ext_global_asm.process_line(line2.trim_end(), &opts.output_enc)?;
            }
            let (src, function) = ext_global_asm.finish(state)?;
            output_lines[current] = src.join("");
            functions.push(function);
            deps.push(fname);
        } else if line == "#pragma asmproc recurse" {
            // C includes qualified as
            // #pragma asmproc recurse
            // #include "file.c"
            // will be processed recursively when encountered
            is_early_include = true;
        } else if is_early_include {
            is_early_include = false;
            let include_path = line
                .strip_prefix("#include \"")
                .and_then(|rest| rest.strip_suffix('"'))
                .ok_or_else(|| {
                    Error::AsmSyntax(
                        "#pragma asmproc recurse must be followed by an #include".to_string(),
                    )
                })?;
            let fpath = filename.parent().unwrap_or_else(|| Path::new(""));
            let fname = fpath.join(include_path);
            deps.push(fname.to_string_lossy().into_owned());

            let included = fs::read(&fname)?;
            let included = opts.input_enc.decode(&included)?;
            let mut include_lines = process_text(
                &included,
                &fname,
                opts,
                state,
                functions,
                deps,
                depth + 1,
            )?;
            include_lines.push(format!("#line {} \"{}\"", line_no + 1, filename.display()));
            output_lines[current] = include_lines.join("\n");
        } else {
            let mut out_line = raw_line.to_string();
            if opts.encode_cutscene_data_floats {
                // This is a hack to replace all floating-point numbers in an
                // array of a particular type (CutsceneData) with their
                // corresponding IEEE-754 representation rendered in decimal.
                if CUTSCENE_DATA_RE.is_match(line) {
                    is_cutscene_data = true;
                } else if line.ends_with("};") {
                    is_cutscene_data = false;
                }
                if is_cutscene_data {
                    out_line = FLOAT_RE.replace_all(raw_line, repl_float_hex).into_owned();
                }
            }
            output_lines[current] = out_line;
        }
    }

    Ok(output_lines)
}

/// Recognizes the one-line external-assembly forms and returns the referenced
/// file path plus any implicit prologue lines:
///   GLOBAL_ASM("dir/file.s")
///   #pragma GLOBAL_ASM("dir/file.s")
///   #pragma GLOBAL_ASM "dir/file.s"
///   INCLUDE_ASM("dir", name);
///   INCLUDE_RODATA("dir", name);
fn external_asm_reference(line: &str) -> Option<(String, Vec<&'static str>)> {
    if (line.starts_with("GLOBAL_ASM(\"") || line.starts_with("#pragma GLOBAL_ASM(\""))
        && line.ends_with("\")")
    {
        let open = line.find('(').unwrap();
        return Some((line[open + 2..line.len() - 2].to_string(), vec![]));
    }
    if line.starts_with("#pragma GLOBAL_ASM \"") && line.ends_with('"') {
        let open = line.find('"').unwrap();
        return Some((line[open + 1..line.len() - 1].to_string(), vec![]));
    }
    if (line.starts_with("INCLUDE_ASM(\"") || line.starts_with("INCLUDE_RODATA(\""))
        && line.contains("\",")
        && line.ends_with(");")
    {
        // INCLUDE_ASM("path/to", functionname);
        let (before, after) = line.split_once("\",").unwrap();
        let open = before.find('(').unwrap();
        let dir = &before[open + 2..];
        let after = after.trim();
        let name = &after[..after.len() - 2];
        let prologue = if line.starts_with("INCLUDE_RODATA") {
            vec![".section .rodata"]
        } else {
            vec![]
        };
        return Some((format!("{}/{}.s", dir, name), prologue));
    }
    None
}
