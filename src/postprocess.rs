use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::rc::Rc;

use enum_map::EnumMap;
use temp_dir::TempDir;

use crate::asm::{Function, OutputSection};
use crate::elf::{
    ElfFile, ElfFormat, Section, Symbol, SHN_ABS, SHN_UNDEF, SHT_REL, SHT_RELA, STB_GLOBAL,
    STB_LOCAL, STT_FUNC, STT_OBJECT,
};
use crate::error::{Error, Result};
use crate::{Encoding, SymbolVisibility};

/// Prefix of every compiler-visible name we invent; post-processing filters
/// these stub symbols back out of the final object.
pub const STUB_PREFIX: &str = "_asmbr_";

const LATE_RODATA_START: &str = "_asmbr_late_rodata_start";
const LATE_RODATA_END: &str = "_asmbr_late_rodata_end";

const MIPS_DEBUG_ST_STATIC: usize = 2;
const MIPS_DEBUG_ST_PROC: usize = 6;
const MIPS_DEBUG_ST_BLOCK: usize = 7;
const MIPS_DEBUG_ST_END: usize = 8;
const MIPS_DEBUG_ST_FILE: usize = 11;
const MIPS_DEBUG_ST_STATIC_PROC: usize = 14;
const MIPS_DEBUG_ST_STRUCT: usize = 26;
const MIPS_DEBUG_ST_UNION: usize = 27;
const MIPS_DEBUG_ST_ENUM: usize = 28;

const OUTPUT_SECTIONS: [OutputSection; 4] = [
    OutputSection::Data,
    OutputSection::Text,
    OutputSection::Rodata,
    OutputSection::Bss,
];
const INPUT_SECTION_NAMES: [&str; 5] = [".data", ".text", ".rodata", ".bss", ".late_rodata"];

/// One compiler-reserved stub, located in the compiler's object and scheduled
/// to be overwritten with the assembler's bytes at the same offset.
struct SpliceRegion {
    offset: usize,
    len: usize,
    stub_symbol: String,
    block_desc: String,
}

fn read_word(fmt: ElfFormat, data: &[u8], offset: usize) -> Result<usize> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or_else(|| Error::InvalidElf("truncated .mdebug data".to_string()))?;
    Ok(fmt.unpack_u32(bytes)? as usize)
}

/// Locates one block's stub symbols in the compiler object and schedules a
/// splice for each, padding the sidecar so assembled addresses match the
/// compiler's layout exactly (which is what lets symbol values and relocation
/// offsets carry over untranslated). Returns false when the stubs are absent,
/// i.e. the block was compiled out by an #ifdef.
fn schedule_block_splices(
    objfile: &ElfFile,
    function: &Function,
    cursors: &mut EnumMap<OutputSection, usize>,
    regions: &mut EnumMap<OutputSection, Vec<SpliceRegion>>,
    sidecar: &mut Vec<String>,
) -> Result<bool> {
    for (section, (stub, len)) in function.data.iter() {
        let Some(stub) = stub else {
            continue;
        };
        if *len == 0 {
            return Err(Error::AsmSizeMismatch(format!(
                "size of section {} is 0",
                stub
            )));
        }
        let Some((_, offset)) = objfile.symtab().find_symbol(stub) else {
            return Ok(false);
        };
        let cursor = cursors[section];
        if offset < cursor {
            // A stub that starts before the previous one ended means the
            // reserved sizes were too small; two adjacent blocks make that
            // visible here. (Reserving too much stays invisible: it looks
            // like an unrelated static placed after the block.)
            return Err(Error::AsmSizeMismatch(format!(
                "wrongly computed size for section {} (diff {}); this is an asm-bridge bug",
                section,
                cursor - offset
            )));
        }
        if offset > cursor {
            sidecar.push(format!(".section {}", section));
            if section == OutputSection::Text {
                for _ in 0..(offset - cursor) / 4 {
                    sidecar.push("nop".to_owned());
                }
            } else {
                sidecar.push(format!(".space {}", offset - cursor));
            }
        }
        regions[section].push(SpliceRegion {
            offset,
            len: *len,
            stub_symbol: stub.clone(),
            block_desc: function.fn_desc.clone(),
        });
        cursors[section] = offset + *len;
    }
    Ok(true)
}

/// Emits one block's assembly into the sidecar, bracketed per stub by
/// start/end marker labels so the resulting offsets and sizes can be checked
/// against the schedule after assembling.
fn append_block_asm(sidecar: &mut Vec<String>, function: &Function) {
    for (section, (stub, _)) in function.data.iter() {
        if let Some(stub) = stub {
            sidecar.push(format!(".section {}", section));
            sidecar.push(format!("glabel {}_asm_start", stub));
        }
    }
    sidecar.push(".text".to_owned());
    sidecar.extend(function.asm_conts.iter().cloned());
    for (section, (stub, _)) in function.data.iter() {
        if let Some(stub) = stub {
            sidecar.push(format!(".section {}", section));
            sidecar.push(format!("glabel {}_asm_end", stub));
        }
    }
}

/// Overwrites each dummy constant the stub made the compiler place in
/// .rodata with the real late-rodata bytes, then copies any jump table right
/// behind the constants that anchor it. The dummies have no symbols, so they
/// are located by searching for their bit patterns, left to right starting
/// after the last spliced rodata stub. Returns source offset -> target
/// offset for every moved word.
#[allow(clippy::too_many_arguments)]
fn transplant_late_rodata(
    target: &mut Section,
    source_data: &[u8],
    start: usize,
    dummy_lists: &[Vec<[u8; 4]>],
    jtbl_lens: &[usize],
    big_endian: bool,
    search_from: usize,
    jtbl_positions: &mut HashSet<usize>,
) -> Result<HashMap<usize, usize>> {
    let mut moved = HashMap::new();
    let mut patched = target.data.clone();
    let mut cursor = search_from;
    let mut src_off = start;

    for (dummies, &jtbl_len) in dummy_lists.iter().zip(jtbl_lens) {
        for (i, dummy) in dummies.iter().enumerate() {
            let needle: [u8; 4] = if big_endian {
                *dummy
            } else {
                let mut w = *dummy;
                w.reverse();
                w
            };
            let mut at = target.data[cursor..]
                .windows(4)
                .position(|w| w == needle)
                .ok_or_else(|| {
                    Error::AsmSizeMismatch(
                        "failed to find late rodata dummy constant in .rodata".to_string(),
                    )
                })?
                + cursor;

            if i == 0
                && dummies.len() > 1
                && target.data.get(at + 4..at + 8) == Some(&[0u8; 4][..])
            {
                // The stub assumed this block starts 4 mod 8, but the
                // compiler placed it 0 mod 8, so the paired double sits 4
                // bytes later than planned. Slide the leading float onto the
                // zero padding to keep the block contiguous; jump tables
                // depend on that.
                patched[at..at + 4].copy_from_slice(&[0; 4]);
                at += 4;
            }
            patched[at..at + 4].copy_from_slice(&source_data[src_off..src_off + 4]);
            moved.insert(src_off, at);
            cursor = at + 4;
            src_off += 4;
        }

        if jtbl_len > 0 {
            if dummies.is_empty() {
                return Err(Error::AsmSizeMismatch(
                    "jump table without a preceding late rodata constant".to_string(),
                ));
            }
            if cursor + jtbl_len > patched.len() || src_off + jtbl_len > source_data.len() {
                return Err(Error::AsmSizeMismatch(
                    ".rodata too small for the jump table".to_string(),
                ));
            }
            patched[cursor..cursor + jtbl_len]
                .copy_from_slice(&source_data[src_off..src_off + jtbl_len]);
            for k in (0..jtbl_len).step_by(4) {
                moved.insert(src_off + k, cursor + k);
                jtbl_positions.insert(cursor + k);
            }
            cursor += jtbl_len;
            src_off += jtbl_len;
        }
    }
    target.data = patched;
    Ok(moved)
}

/// Recovers static symbols from the .mdebug symbolic table so GLOBAL_ASM
/// blocks can refer to them, returning `(dedup name, emitted name, value,
/// section name, type, bind)` tuples in table order.
fn collect_mdebug_statics(
    objfile: &ElfFile,
    objfile_path: &Path,
    mdebug: &Section,
    convert_statics: &SymbolVisibility,
) -> Result<Vec<(String, String, usize, &'static str, u8, u8)>> {
    let fmt = objfile.fmt;
    let make_statics_global = matches!(
        convert_statics,
        SymbolVisibility::Global | SymbolVisibility::GlobalWithFilename
    );
    let mut statics = vec![];
    let mut static_name_count: HashMap<String, usize> = HashMap::new();

    let ifd_max = read_word(fmt, &mdebug.data, 18 * 4)?;
    let cb_fd_offset = read_word(fmt, &mdebug.data, 19 * 4)?;
    let cb_sym_offset = read_word(fmt, &mdebug.data, 9 * 4)?;
    let cb_ss_offset = read_word(fmt, &mdebug.data, 15 * 4)?;

    for i in 0..ifd_max {
        let offset = cb_fd_offset + 18 * 4 * i;
        let iss_base = read_word(fmt, &objfile.data, offset + 2 * 4)?;
        let isym_base = read_word(fmt, &objfile.data, offset + 4 * 4)?;
        let csym = read_word(fmt, &objfile.data, offset + 5 * 4)?;
        let mut scope_level: isize = 0;

        for j in 0..csym {
            let offset2 = cb_sym_offset + 12 * (isym_base + j);
            let iss = read_word(fmt, &objfile.data, offset2)?;
            let value = read_word(fmt, &objfile.data, offset2 + 4)?;
            let st_sc_index = read_word(fmt, &objfile.data, offset2 + 8)?;
            let st = st_sc_index >> 26;
            let sc = (st_sc_index >> 21) & 0x1f;

            if st == MIPS_DEBUG_ST_STATIC || st == MIPS_DEBUG_ST_STATIC_PROC {
                let name_offset = cb_ss_offset + iss_base + iss;
                let name_end = objfile
                    .data
                    .get(name_offset..)
                    .and_then(|tail| tail.iter().position(|&x| x == 0))
                    .ok_or_else(|| {
                        Error::InvalidElf("unterminated name in .mdebug".to_string())
                    })?
                    + name_offset;
                let mut symbol_name =
                    encoding_rs::mem::decode_latin1(&objfile.data[name_offset..name_end])
                        .into_owned();
                if scope_level > 1 {
                    // Function-scoped statics can repeat across functions; a
                    // counter suffix keeps their symbols distinct.
                    let count = static_name_count.get(&symbol_name).unwrap_or(&0) + 1;
                    static_name_count.insert(symbol_name.clone(), count);
                    symbol_name = format!("{}:{}", symbol_name, count);
                }
                let emitted_symbol_name =
                    if *convert_statics == SymbolVisibility::GlobalWithFilename {
                        // The filename prefix only goes into the string table
                        // entry; dedup keys on the bare name so GLOBAL_ASM
                        // blocks can still refer to the static.
                        format!("{}:{}", objfile_path.to_string_lossy(), symbol_name)
                    } else {
                        symbol_name.clone()
                    };
                let section_name = match sc {
                    1 => ".text",
                    2 => ".data",
                    3 => ".bss",
                    15 => ".rodata",
                    _ => {
                        return Err(Error::Unsupported(format!(
                            "MIPS_DEBUG_SC value {}",
                            sc
                        )))
                    }
                };
                let symtype = if sc == 1 { STT_FUNC } else { STT_OBJECT };
                let binding = if make_statics_global {
                    STB_GLOBAL
                } else {
                    STB_LOCAL
                };
                statics.push((
                    symbol_name,
                    emitted_symbol_name,
                    value,
                    section_name,
                    symtype,
                    binding,
                ));
            }
            match st {
                MIPS_DEBUG_ST_FILE | MIPS_DEBUG_ST_STRUCT | MIPS_DEBUG_ST_UNION
                | MIPS_DEBUG_ST_ENUM | MIPS_DEBUG_ST_BLOCK | MIPS_DEBUG_ST_PROC
                | MIPS_DEBUG_ST_STATIC_PROC => {
                    scope_level += 1;
                }
                MIPS_DEBUG_ST_END => {
                    scope_level -= 1;
                }
                _ => {}
            }
        }
        if scope_level != 0 {
            return Err(Error::InvalidElf(
                "unbalanced scopes in .mdebug symbol table".to_string(),
            ));
        }
    }
    Ok(statics)
}

/// Splices the assembler's output over the compiler's stubs: bytes, symbols
/// and relocations, producing the final object in place (atomically).
#[allow(clippy::too_many_arguments)]
pub fn fixup_objfile(
    objfile_path: &Path,
    functions: &[Function],
    asm_prelude: &str,
    assembler: &str,
    output_enc: &Encoding,
    drop_mdebug_gptab: bool,
    convert_statics: &SymbolVisibility,
) -> Result<()> {
    let objfile_data = fs::read(objfile_path)?;
    let mut objfile = ElfFile::new(&objfile_data)?;
    let fmt = objfile.fmt;

    // Schedule the splices and build the sidecar assembly for every block
    // that survived preprocessing.
    let mut cursors: EnumMap<OutputSection, usize> = EnumMap::default();
    let mut regions: EnumMap<OutputSection, Vec<SpliceRegion>> = EnumMap::default();
    let mut sidecar: Vec<String> = vec![];
    let mut dummy_lists: Vec<Vec<[u8; 4]>> = vec![];
    let mut jtbl_lens: Vec<usize> = vec![];
    let mut late_rodata_lines: Vec<String> = vec![];
    let mut glabel_names: HashSet<String> = HashSet::new();
    let mut glabel_sizes: HashMap<String, usize> = HashMap::new();

    for function in functions {
        let found = schedule_block_splices(
            &objfile,
            function,
            &mut cursors,
            &mut regions,
            &mut sidecar,
        )?;
        if !found {
            continue;
        }
        if let (Some(_), len) = &function.data[OutputSection::Text] {
            if let Some(entry) = function.text_glabels.first() {
                glabel_sizes.insert(entry.clone(), *len);
            }
        }
        glabel_names.extend(function.text_glabels.iter().cloned());
        dummy_lists.push(function.late_rodata_dummy_bytes.clone());
        jtbl_lens.push(function.jtbl_rodata_size);
        late_rodata_lines.extend(function.late_rodata_asm_conts.iter().cloned());
        append_block_asm(&mut sidecar, function);
    }

    if !late_rodata_lines.is_empty() {
        sidecar.push(".section .late_rodata".to_string());
        // Two guard words keep the start marker off address zero, which
        // whole-section relocations would otherwise collide with.
        sidecar.push(".word 0, 0".to_string());
        sidecar.push(format!("glabel {}", LATE_RODATA_START));
        sidecar.extend(late_rodata_lines.iter().cloned());
        sidecar.push(format!("glabel {}", LATE_RODATA_END));
    }

    // Assemble the sidecar.
    let temp_dir = TempDir::with_prefix("asm_bridge")?;
    let obj_stem = objfile_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("obj");
    let s_file_path = temp_dir.path().join(format!("asm_bridge_{}.s", obj_stem));
    let o_file_path = temp_dir.path().join(format!("asm_bridge_{}.o", obj_stem));
    {
        let mut s_file = File::create(&s_file_path)?;
        s_file.write_all(asm_prelude.as_bytes())?;
        s_file.write_all(b"\n")?;
        for line in &sidecar {
            s_file.write_all(&output_enc.encode(line)?)?;
            s_file.write_all(b"\n")?;
        }
    }

    let quote = |p: &Path| {
        shlex::try_quote(p.to_str().unwrap_or_default())
            .map(|s| s.into_owned())
            .unwrap_or_default()
    };
    let status = Command::new("sh")
        .arg("-c")
        .arg(format!(
            "{} {} -o {}",
            assembler,
            quote(&s_file_path),
            quote(&o_file_path)
        ))
        .status()?;
    if !status.success() {
        return Err(Error::AsmSyntax("failed to assemble".to_string()));
    }
    let asm_objfile = ElfFile::new(&fs::read(&o_file_path)?)?;
    if asm_objfile.fmt != fmt {
        return Err(Error::InvalidElf(
            "assembler output endianness differs from the compiler's".to_string(),
        ));
    }

    // .mdebug is read for statics below even when the section itself is
    // dropped; dropping keeps the output lean and avoids absolute paths in
    // objdump listings.
    let mdebug_section = objfile.find_section(".mdebug").cloned();
    if drop_mdebug_gptab {
        objfile.drop_mdebug_gptab()?;
    }

    // Unify reginfo masks
    if let Some(source_reginfo) = asm_objfile.find_section(".reginfo") {
        if let Some(target_reginfo) = objfile.find_section_mut(".reginfo") {
            for (d, s) in target_reginfo
                .data
                .iter_mut()
                .zip(source_reginfo.data.iter())
                .take(20)
            {
                *d |= *s;
            }
        }
    }

    // Check every scheduled region against the assembled markers, then copy
    // the real bytes over the stubs.
    let mut modified_text_positions = HashSet::new();
    let mut jtbl_rodata_positions: HashSet<usize> = HashSet::new();
    let mut last_rodata_pos = 0;
    for section in OUTPUT_SECTIONS {
        if regions[section].is_empty() {
            continue;
        }
        let source = asm_objfile.find_section(section.as_str()).ok_or_else(|| {
            Error::InvalidElf(format!("didn't find source section: {}", section))
        })?;
        let mut checked = vec![];
        for region in &regions[section] {
            let start = asm_objfile
                .symtab()
                .find_symbol_in_section(&format!("{}_asm_start", region.stub_symbol), source)?;
            let end = asm_objfile
                .symtab()
                .find_symbol_in_section(&format!("{}_asm_end", region.stub_symbol), source)?;
            if start != region.offset {
                return Err(Error::AsmSizeMismatch(format!(
                    "assembly and C files don't line up for section {}, {}",
                    section, region.block_desc
                )));
            }
            if end < start || end - start != region.len {
                return Err(Error::AsmSizeMismatch(format!(
                    "incorrectly computed size for section {}, {}. If using .double, make sure to provide explicit alignment padding.",
                    section, region.block_desc
                )));
            }
            checked.push((region.offset, region.len));
        }

        if section == OutputSection::Bss {
            continue;
        }

        let source_data = source.data.clone();
        let target = objfile.find_section_mut(section.as_str()).ok_or_else(|| {
            Error::InvalidElf(format!("objfile has no section {}", section))
        })?;
        for (offset, len) in checked {
            if offset + len > target.data.len() || offset + len > source_data.len() {
                return Err(Error::AsmSizeMismatch(format!(
                    "section {} too small for splice at {:#x}+{:#x}",
                    section, offset, len
                )));
            }
            target.data[offset..offset + len].copy_from_slice(&source_data[offset..offset + len]);

            if section == OutputSection::Text {
                if offset % 4 != 0 || len % 4 != 0 {
                    return Err(Error::AsmSizeMismatch(format!(
                        "misaligned .text splice at {:#x}+{:#x}",
                        offset, len
                    )));
                }
                for word in (offset..offset + len).step_by(4) {
                    modified_text_positions.insert(word);
                }
            } else if section == OutputSection::Rodata {
                last_rodata_pos = offset + len;
            }
        }
    }

    // Late rodata has no stub symbols to anchor it; find and replace the
    // dummy constants instead.
    let mut moved_late_rodata: HashMap<usize, usize> = HashMap::new();
    if dummy_lists.iter().any(|d| !d.is_empty()) || jtbl_lens.iter().any(|&n| n > 0) {
        let source = asm_objfile.find_section(".late_rodata").ok_or_else(|| {
            Error::InvalidElf("assembler output has no .late_rodata".to_string())
        })?;
        let start = asm_objfile
            .symtab()
            .find_symbol_in_section(LATE_RODATA_START, source)?;
        let end = asm_objfile
            .symtab()
            .find_symbol_in_section(LATE_RODATA_END, source)?;
        let expected: usize = dummy_lists.iter().map(|d| d.len() * 4).sum::<usize>()
            + jtbl_lens.iter().sum::<usize>();
        if end < start || end - start != expected || end > source.data.len() {
            return Err(Error::AsmSizeMismatch(
                "computed wrong size of .late_rodata".to_string(),
            ));
        }

        let source_data = source.data.clone();
        let big_endian = fmt.big_endian;
        let target = objfile
            .find_section_mut(".rodata")
            .ok_or_else(|| Error::InvalidElf("objfile has no .rodata".to_string()))?;
        moved_late_rodata = transplant_late_rodata(
            target,
            &source_data,
            start,
            &dummy_lists,
            &jtbl_lens,
            big_endian,
            last_rodata_pos,
            &mut jtbl_rodata_positions,
        )?;
    }

    // Merge strtab data.
    let strtab_idx = objfile
        .symtab()
        .strtab
        .ok_or_else(|| Error::InvalidElf("symbol table has no string table".to_string()))?;
    let asm_strtab_idx = asm_objfile
        .symtab()
        .strtab
        .ok_or_else(|| Error::InvalidElf("symbol table has no string table".to_string()))?;
    let strtab_adj = objfile.sections[strtab_idx].data.len();
    {
        let asm_strtab_data = asm_objfile.sections[asm_strtab_idx].data.clone();
        objfile.sections[strtab_idx]
            .data
            .extend_from_slice(&asm_strtab_data);
    }

    // Find relocated symbols
    let mut relocated_symbols: Vec<Rc<RefCell<Symbol>>> = vec![];
    for sectype in INPUT_SECTION_NAMES.iter() {
        if let Some(sec) = asm_objfile.find_section(sectype) {
            for &reltab_idx in &sec.relocated_by {
                for rel in &asm_objfile.sections[reltab_idx].relocations {
                    let sym = asm_objfile
                        .symtab()
                        .symbol_entries
                        .get(rel.sym_index)
                        .ok_or_else(|| {
                            Error::InvalidElf(format!(
                                "relocation refers to a bad symbol index {}",
                                rel.sym_index
                            ))
                        })?;
                    relocated_symbols.push(sym.clone());
                }
            }
        }
    }
    let is_relocated =
        |s: &Rc<RefCell<Symbol>>| relocated_symbols.iter().any(|r| Rc::ptr_eq(r, s));

    // Import the assembler's symbols: stub markers disappear, locals come
    // along only when a relocation needs them (anything else would risk
    // name clashes), and section indices/values are rewritten to their spots
    // in the output object.
    let empty_symbol = objfile
        .symtab()
        .symbol_entries
        .first()
        .cloned()
        .ok_or_else(|| Error::InvalidElf("empty symbol table".to_string()))?;
    let mut new_syms: Vec<Rc<RefCell<Symbol>>> = objfile
        .symtab()
        .symbol_entries
        .iter()
        .skip(1)
        .filter(|x| !x.borrow().name.starts_with(STUB_PREFIX))
        .cloned()
        .collect();

    let num_asm_locals = asm_objfile.symtab().sh_info as usize;
    for (i, s) in asm_objfile.symtab().symbol_entries.iter().enumerate() {
        let is_local = i < num_asm_locals;
        if is_local && !is_relocated(s) {
            continue;
        }
        if s.borrow().name.starts_with(STUB_PREFIX) {
            if is_relocated(s) {
                return Err(Error::InvalidElf(format!(
                    "relocation against stub symbol {}",
                    s.borrow().name
                )));
            }
            continue;
        }
        let st_shndx = s.borrow().st_shndx;
        if st_shndx != SHN_UNDEF && st_shndx != SHN_ABS {
            let section_name = asm_objfile
                .sections
                .get(st_shndx)
                .ok_or_else(|| {
                    Error::InvalidElf(format!(
                        "symbol {} has a bad section index",
                        s.borrow().name
                    ))
                })?
                .name
                .clone();
            let target_section_name = if section_name == ".late_rodata" {
                ".rodata".to_string()
            } else if !INPUT_SECTION_NAMES.contains(&section_name.as_str()) {
                return Err(Error::InvalidElf(format!(
                    "generated assembly .o must only have symbols for .text, .data, .rodata, .late_rodata, ABS and UNDEF, but found {}",
                    section_name
                )));
            } else {
                section_name.clone()
            };
            let objfile_section = objfile.find_section(&target_section_name).ok_or_else(|| {
                Error::InvalidElf(format!(
                    "generated assembly .o has section that real objfile lacks: {}",
                    target_section_name
                ))
            })?;
            s.borrow_mut().st_shndx = objfile_section.index;
            // A glabel comes out of the assembler untyped; give entry points
            // a function type and size so objdump shows them properly.
            let name = s.borrow().name.clone();
            if glabel_names.contains(&name) {
                s.borrow_mut().st_type = STT_FUNC;
                if let Some(&size) = glabel_sizes.get(&name) {
                    s.borrow_mut().st_size = size;
                }
            }
            if section_name == ".late_rodata" {
                if s.borrow().st_value == 0 {
                    // A value of zero means the whole-section symbol, which a
                    // relocation must be using. Relocating those needs
                    // hi16/lo16 rewrites to .late_rodata+<offset>; not worth
                    // supporting.
                    return Err(Error::Unsupported(
                        "local symbols in .late_rodata".to_string(),
                    ));
                }
                let st_value = s.borrow().st_value;
                let moved = *moved_late_rodata.get(&st_value).ok_or_else(|| {
                    Error::SymbolLookup(format!(
                        "late rodata symbol {} was not moved",
                        s.borrow().name
                    ))
                })?;
                s.borrow_mut().st_value = moved;
            }
        }
        s.borrow_mut().st_name += strtab_adj;
        new_syms.push(s.clone());
    }

    // Add static symbols from .mdebug, so they can be referred to from
    // GLOBAL_ASM blocks.
    if let Some(mdebug) = &mdebug_section {
        if *convert_statics != SymbolVisibility::No {
            let statics =
                collect_mdebug_statics(&objfile, objfile_path, mdebug, convert_statics)?;
            for (name, emitted_name, value, section_name, symtype, binding) in statics {
                let section_index = objfile
                    .find_section(section_name)
                    .ok_or_else(|| {
                        Error::InvalidElf(format!("objfile has no section {}", section_name))
                    })?
                    .index;
                let st_name = objfile.sections[strtab_idx].add_str(&emitted_name)? as usize;
                let sym = Symbol::from_parts(value, 0, binding, symtype, section_index, st_name, &name);
                new_syms.push(Rc::new(RefCell::new(sym)));
            }
        }
    }

    // Collapse duplicate names onto one canonical symbol each, preferring
    // defined over UNDEF (the sort puts defined ones first). Unnamed locals
    // are exempt; each stands alone.
    new_syms.sort_by_key(|s| s.borrow().st_shndx == SHN_UNDEF);
    let mut dropped_dups: Vec<(*const RefCell<Symbol>, Rc<RefCell<Symbol>>)> = vec![];
    let mut kept_syms = vec![];
    let mut by_name: HashMap<String, Rc<RefCell<Symbol>>> = HashMap::new();
    for s in &new_syms {
        let (name, bind, shndx, value) = {
            let b = s.borrow();
            (b.name.clone(), b.st_bind, b.st_shndx, b.st_value)
        };
        if name == "_gp_disp" {
            s.borrow_mut().st_type = STT_OBJECT;
        }
        if bind == STB_LOCAL && shndx == SHN_UNDEF {
            return Err(Error::InvalidElf(format!(
                "local symbol \"{}\" is undefined",
                name
            )));
        }
        if name.is_empty() {
            if bind != STB_LOCAL {
                return Err(Error::InvalidElf("global symbol with no name".to_string()));
            }
            kept_syms.push(s.clone());
        } else if let Some(canonical) = by_name.get(&name) {
            let (c_shndx, c_value) = {
                let c = canonical.borrow();
                (c.st_shndx, c.st_value)
            };
            if shndx != SHN_UNDEF && !(c_shndx == shndx && c_value == value) {
                return Err(Error::InvalidElf(format!(
                    "symbol \"{}\" defined twice",
                    name
                )));
            }
            dropped_dups.push((Rc::as_ptr(s), canonical.clone()));
        } else {
            by_name.insert(name, s.clone());
            kept_syms.push(s.clone());
        }
    }
    let mut new_syms = kept_syms;

    // LOCALs first behind the null entry; _gp_disp sorts to the very end.
    new_syms.insert(0, empty_symbol.clone());
    new_syms.sort_by_key(|s| {
        let b = s.borrow();
        (b.st_bind != STB_LOCAL, b.name == "_gp_disp")
    });

    let num_local_syms = new_syms
        .iter()
        .filter(|x| x.borrow().st_bind == STB_LOCAL)
        .count();
    let new_sym_data: Vec<u8> = new_syms
        .iter()
        .flat_map(|s| s.borrow().to_bin(fmt))
        .collect();

    // Identity-keyed index map: several distinct symbols may share a name
    // (unnamed locals in particular), so indices are tracked per object.
    // Dropped duplicates resolve to their canonical symbol's index.
    let mut new_index_of: HashMap<*const RefCell<Symbol>, usize> = HashMap::new();
    for (i, s) in new_syms.iter().enumerate() {
        new_index_of.insert(Rc::as_ptr(s), i);
    }
    for (dropped, canonical) in &dropped_dups {
        let idx = *new_index_of.get(&Rc::as_ptr(canonical)).ok_or_else(|| {
            Error::SymbolLookup(format!(
                "merged symbol \"{}\" lost during re-sort",
                canonical.borrow().name
            ))
        })?;
        new_index_of.insert(*dropped, idx);
    }
    let lookup_new_index = |s: &Rc<RefCell<Symbol>>| -> Result<usize> {
        new_index_of.get(&Rc::as_ptr(s)).copied().ok_or_else(|| {
            Error::SymbolLookup(format!(
                "relocation refers to removed symbol \"{}\"",
                s.borrow().name
            ))
        })
    };

    // Nothing may touch the merged string table from here on: the symbol
    // records just serialized cache offsets into it.
    objfile.sections[strtab_idx].freeze();

    let old_symbol_entries =
        std::mem::replace(&mut objfile.symtab_mut().symbol_entries, new_syms.clone());
    objfile.symtab_mut().data = new_sym_data;
    objfile.symtab_mut().sh_info = num_local_syms as u32;

    // Renumber the compiler object's own relocations through the rebuilt
    // table, dropping the ones that pointed into stub instructions or jump
    // table slots (the spliced bytes carry their own).
    for section in OUTPUT_SECTIONS {
        let Some(target) = objfile.find_section(section.as_str()) else {
            continue;
        };
        let relocated_by = target.relocated_by.clone();
        for reltab_idx in relocated_by {
            let reltab = &mut objfile.sections[reltab_idx];
            let mut surviving = vec![];
            for rel in &reltab.relocations {
                if (section == OutputSection::Text
                    && modified_text_positions.contains(&rel.r_offset))
                    || (section == OutputSection::Rodata
                        && jtbl_rodata_positions.contains(&rel.r_offset))
                {
                    continue;
                }
                let mut rel = rel.clone();
                let old_sym = old_symbol_entries.get(rel.sym_index).ok_or_else(|| {
                    Error::InvalidElf(format!(
                        "relocation refers to a bad symbol index {}",
                        rel.sym_index
                    ))
                })?;
                rel.sym_index = lookup_new_index(old_sym)?;
                surviving.push(rel);
            }
            reltab.data = surviving.iter().flat_map(|r| r.to_bin(fmt)).collect();
            reltab.relocations = surviving;
        }
    }

    // Carry the assembler object's relocations over into the output.
    for sectype in INPUT_SECTION_NAMES.iter() {
        let Some(source) = asm_objfile.find_section(sectype) else {
            continue;
        };
        if source.data.is_empty() {
            continue;
        }
        let target_sectype = if *sectype == ".late_rodata" {
            ".rodata"
        } else {
            *sectype
        };
        let target_index = objfile
            .find_section(target_sectype)
            .ok_or_else(|| {
                Error::InvalidElf(format!("objfile has no section {}", target_sectype))
            })?
            .index;
        for &reltab_idx in &source.relocated_by {
            let source_reltab = &asm_objfile.sections[reltab_idx];
            let mut new_rels = vec![];
            for rel in &source_reltab.relocations {
                let mut rel = rel.clone();
                let sym = asm_objfile
                    .symtab()
                    .symbol_entries
                    .get(rel.sym_index)
                    .ok_or_else(|| {
                        Error::InvalidElf(format!(
                            "relocation refers to a bad symbol index {}",
                            rel.sym_index
                        ))
                    })?;
                rel.sym_index = lookup_new_index(sym)?;
                if *sectype == ".late_rodata" {
                    rel.r_offset = *moved_late_rodata.get(&rel.r_offset).ok_or_else(|| {
                        Error::SymbolLookup(format!(
                            "late rodata relocation at {:#x} targets unmoved data",
                            rel.r_offset
                        ))
                    })?;
                }
                new_rels.push(rel);
            }
            let new_data: Vec<u8> = new_rels.iter().flat_map(|r| r.to_bin(fmt)).collect();

            // Preserve the source table's REL/RELA flavor.
            let (prefix, sh_type, entsize) = if source_reltab.sh_type == SHT_REL {
                (".rel", SHT_REL, 8)
            } else {
                (".rela", SHT_RELA, 12)
            };
            let reltab_name = format!("{}{}", prefix, target_sectype);
            if let Some(target_reltab) = objfile.find_section_mut(&reltab_name) {
                target_reltab.data.extend_from_slice(&new_data);
                target_reltab.relocations.extend(new_rels);
            } else {
                let symtab_index = objfile.symtab().index as u32;
                objfile.add_section(
                    &reltab_name,
                    sh_type,
                    0,
                    symtab_index,
                    target_index as u32,
                    4,
                    entsize,
                    &new_data,
                )?;
            }
        }
    }

    objfile.validate()?;
    objfile.write(objfile_path)?;
    Ok(())
}
