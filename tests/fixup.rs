//! End-to-end post-processing: a synthesized compiler object gets its stubs
//! overwritten by a canned "assembler" output, driven through fixup_objfile.

use std::fs;
use std::path::{Path, PathBuf};

use temp_dir::TempDir;

use asm_bridge::asm::OutputSection;
use asm_bridge::elf::{
    ElfFile, ElfFormat, SHT_PROGBITS, SHT_REL, SHT_STRTAB, SHT_SYMTAB, STB_GLOBAL, STB_LOCAL,
    STT_FUNC, STT_SECTION,
};
use asm_bridge::postprocess::fixup_objfile;
use asm_bridge::preprocess::parse_source;
use asm_bridge::{Encoding, OptLevel, ProcOpts, SymbolVisibility};

const EHDR_SIZE: usize = 52;
const SHDR_SIZE: usize = 40;

struct Sec {
    name: &'static str,
    sh_type: u32,
    sh_flags: u32,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u32,
    sh_entsize: u32,
    data: Vec<u8>,
}

/// Assembles a complete ELF image; a null section is prepended and .shstrtab
/// appended automatically, so `sh_link`/`sh_info` count from 1 for the first
/// spec entry.
fn build_elf(fmt: ElfFormat, specs: &[Sec]) -> Vec<u8> {
    let mut shstrtab = vec![0u8];
    let mut name_offsets = vec![0u32];
    for spec in specs {
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(spec.name.as_bytes());
        shstrtab.push(0);
    }
    let shstr_name = shstrtab.len() as u32;
    shstrtab.extend_from_slice(b".shstrtab\0");

    fn pad_to(buf: &mut Vec<u8>, align: usize) {
        if align > 0 && buf.len() % align != 0 {
            buf.resize(buf.len() + align - buf.len() % align, 0);
        }
    }

    let num_sections = specs.len() + 2;
    let mut buf = vec![0u8; EHDR_SIZE];
    let mut offsets = vec![0u32; num_sections];
    for (i, spec) in specs.iter().enumerate() {
        pad_to(&mut buf, spec.sh_addralign as usize);
        offsets[i + 1] = buf.len() as u32;
        buf.extend_from_slice(&spec.data);
    }
    offsets[num_sections - 1] = buf.len() as u32;
    buf.extend_from_slice(&shstrtab);
    pad_to(&mut buf, 4);
    let e_shoff = buf.len() as u32;

    let mut put_header = |buf: &mut Vec<u8>, fields: [u32; 10]| {
        for v in fields {
            buf.extend_from_slice(&fmt.pack_u32(v));
        }
    };
    put_header(&mut buf, [0; 10]);
    for (i, spec) in specs.iter().enumerate() {
        put_header(
            &mut buf,
            [
                name_offsets[i + 1],
                spec.sh_type,
                spec.sh_flags,
                0,
                offsets[i + 1],
                spec.data.len() as u32,
                spec.sh_link,
                spec.sh_info,
                spec.sh_addralign,
                spec.sh_entsize,
            ],
        );
    }
    put_header(
        &mut buf,
        [
            shstr_name,
            SHT_STRTAB,
            0,
            0,
            offsets[num_sections - 1],
            shstrtab.len() as u32,
            0,
            0,
            1,
            0,
        ],
    );

    buf[0..4].copy_from_slice(b"\x7fELF");
    buf[4] = 1; // ELFCLASS32
    buf[5] = if fmt.big_endian { 2 } else { 1 };
    buf[6] = 1; // EV_CURRENT
    let h = &mut buf[16..];
    h[0..2].copy_from_slice(&fmt.pack_u16(1)); // ET_REL
    h[2..4].copy_from_slice(&fmt.pack_u16(8)); // EM_MIPS
    h[4..8].copy_from_slice(&fmt.pack_u32(1));
    h[16..20].copy_from_slice(&fmt.pack_u32(e_shoff));
    h[24..26].copy_from_slice(&fmt.pack_u16(EHDR_SIZE as u16));
    h[30..32].copy_from_slice(&fmt.pack_u16(SHDR_SIZE as u16));
    h[32..34].copy_from_slice(&fmt.pack_u16(num_sections as u16));
    h[34..36].copy_from_slice(&fmt.pack_u16((num_sections - 1) as u16));
    buf
}

fn symtab_data(fmt: ElfFormat, syms: &[(u32, u32, u32, u8, u16)]) -> Vec<u8> {
    let mut data = vec![0u8; 16];
    for &(st_name, st_value, st_size, st_info, st_shndx) in syms {
        data.extend_from_slice(&fmt.pack_u32(st_name));
        data.extend_from_slice(&fmt.pack_u32(st_value));
        data.extend_from_slice(&fmt.pack_u32(st_size));
        data.push(st_info);
        data.push(0);
        data.extend_from_slice(&fmt.pack_u16(st_shndx));
    }
    data
}

fn strtab_data(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
    let mut data = vec![0u8];
    let mut offsets = vec![];
    for name in names {
        offsets.push(data.len() as u32);
        data.extend_from_slice(name.as_bytes());
        data.push(0);
    }
    (data, offsets)
}

fn rel_entry(fmt: ElfFormat, r_offset: u32, sym_index: u32, rel_type: u32) -> Vec<u8> {
    let mut data = vec![];
    data.extend_from_slice(&fmt.pack_u32(r_offset));
    data.extend_from_slice(&fmt.pack_u32(sym_index << 8 | rel_type));
    data
}

fn test_opts(filename: &Path) -> ProcOpts {
    ProcOpts {
        filename: filename.to_path_buf(),
        opt: OptLevel::O1,
        framepointer: false,
        mips1: false,
        kpic: false,
        pascal: false,
        input_enc: Encoding::Latin1,
        output_enc: Encoding::Latin1,
        encode_cutscene_data_floats: false,
    }
}

/// Writes a shell script that ignores the generated .s and copies a canned
/// object to the -o target, standing in for the MIPS assembler.
fn fake_assembler(dir: &TempDir, canned_obj: &PathBuf) -> String {
    let script = dir.path().join("fake-as.sh");
    fs::write(
        &script,
        "#!/bin/sh\nsrc=\"$1\"\nshift\nout=\"\"\nwhile [ \"$#\" -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then out=\"$2\"; fi\n  shift\ndone\ncp \"$src\" \"$out\"\n",
    )
    .unwrap();
    format!("sh {} {}", script.display(), canned_obj.display())
}

#[test]
fn splices_text_symbols_and_relocations() {
    let fmt = ElfFormat::new(true);
    let dir = TempDir::new().unwrap();

    let c_path = dir.path().join("input.c");
    fs::write(
        &c_path,
        "GLOBAL_ASM(\nglabel my_func\nlui $a0, 2\njr $ra\nnop\n)\n",
    )
    .unwrap();
    let opts = test_opts(&c_path);
    let res = parse_source(&c_path, &opts, false).unwrap();
    assert_eq!(res.functions.len(), 1);
    let stub_name = res.functions[0].data[OutputSection::Text]
        .0
        .clone()
        .unwrap();
    assert_eq!(res.functions[0].data[OutputSection::Text].1, 12);

    // The compiler's object: a 12-byte stub plus an unrelated UNDEF symbol.
    let (strtab, offs) = strtab_data(&[&stub_name, "helper"]);
    let compiler_obj = build_elf(
        fmt,
        &[
            Sec {
                name: ".text",
                sh_type: SHT_PROGBITS,
                sh_flags: 0x6,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 4,
                sh_entsize: 0,
                data: vec![0xaa; 12],
            },
            Sec {
                name: ".symtab",
                sh_type: SHT_SYMTAB,
                sh_flags: 0,
                sh_link: 3,
                sh_info: 1,
                sh_addralign: 4,
                sh_entsize: 16,
                data: symtab_data(
                    fmt,
                    &[
                        (offs[0], 0, 12, STB_GLOBAL << 4 | STT_FUNC, 1),
                        (offs[1], 0, 0, STB_GLOBAL << 4, 0),
                    ],
                ),
            },
            Sec {
                name: ".strtab",
                sh_type: SHT_STRTAB,
                sh_flags: 0,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
                data: strtab,
            },
        ],
    );
    let obj_path = dir.path().join("input.o");
    fs::write(&obj_path, &compiler_obj).unwrap();

    // The assembler's object: the real instructions, the _asm_start/_asm_end
    // markers, and one relocation against my_func.
    let real_text = vec![
        0x3c, 0x04, 0x00, 0x02, // lui $a0, 2
        0x03, 0xe0, 0x00, 0x08, // jr $ra
        0x00, 0x00, 0x00, 0x00, // nop
    ];
    let (asm_strtab, aoffs) = strtab_data(&[
        "my_func",
        &format!("{}_asm_start", stub_name),
        &format!("{}_asm_end", stub_name),
    ]);
    let asm_obj = build_elf(
        fmt,
        &[
            Sec {
                name: ".text",
                sh_type: SHT_PROGBITS,
                sh_flags: 0x6,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 4,
                sh_entsize: 0,
                data: real_text.clone(),
            },
            Sec {
                name: ".rel.text",
                sh_type: SHT_REL,
                sh_flags: 0,
                sh_link: 3,
                sh_info: 1,
                sh_addralign: 4,
                sh_entsize: 8,
                data: rel_entry(fmt, 4, 2, 4), // R_MIPS_26 against my_func
            },
            Sec {
                name: ".symtab",
                sh_type: SHT_SYMTAB,
                sh_flags: 0,
                sh_link: 4,
                sh_info: 2,
                sh_addralign: 4,
                sh_entsize: 16,
                data: symtab_data(
                    fmt,
                    &[
                        (0, 0, 0, STB_LOCAL << 4 | STT_SECTION, 1),
                        (aoffs[0], 0, 0, STB_GLOBAL << 4, 1),
                        (aoffs[1], 0, 0, STB_GLOBAL << 4, 1),
                        (aoffs[2], 12, 0, STB_GLOBAL << 4, 1),
                    ],
                ),
            },
            Sec {
                name: ".strtab",
                sh_type: SHT_STRTAB,
                sh_flags: 0,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
                data: asm_strtab,
            },
        ],
    );
    let asm_obj_path = dir.path().join("canned.o");
    fs::write(&asm_obj_path, &asm_obj).unwrap();

    let assembler = fake_assembler(&dir, &asm_obj_path);
    fixup_objfile(
        &obj_path,
        &res.functions,
        "",
        &assembler,
        &Encoding::Latin1,
        false,
        &SymbolVisibility::Local,
    )
    .unwrap();

    let out = ElfFile::new(&fs::read(&obj_path).unwrap()).unwrap();
    out.validate().unwrap();

    // Splice exactness: the stub bytes were replaced by the real instructions.
    let text = out.find_section(".text").unwrap();
    assert_eq!(text.data, real_text);

    // Stub symbols are gone, my_func came over as a sized function symbol.
    let symtab = out.symtab();
    assert!(symtab
        .symbol_entries
        .iter()
        .all(|s| !s.borrow().name.starts_with("_asmbr_")));
    let my_func = symtab
        .symbol_entries
        .iter()
        .find(|s| s.borrow().name == "my_func")
        .expect("my_func missing from output");
    {
        let sym = my_func.borrow();
        assert_eq!(sym.st_shndx, text.index);
        assert_eq!(sym.st_type, STT_FUNC);
        assert_eq!(sym.st_size, 12);
        assert_eq!(sym.st_bind, STB_GLOBAL);
    }
    let num_locals = symtab
        .symbol_entries
        .iter()
        .filter(|s| s.borrow().st_bind == STB_LOCAL)
        .count();
    assert_eq!(symtab.sh_info as usize, num_locals);

    // The relocation was carried over and renumbered.
    let rel_text = out.find_section(".rel.text").expect(".rel.text missing");
    assert_eq!(rel_text.relocations.len(), 1);
    let rel = &rel_text.relocations[0];
    assert_eq!(rel.r_offset, 4);
    assert_eq!(rel.rel_type, 4);
    assert_eq!(
        symtab.symbol_entries[rel.sym_index].borrow().name,
        "my_func"
    );
}

#[test]
fn late_rodata_floats_are_spliced_over_dummies() {
    let fmt = ElfFormat::new(true);
    let dir = TempDir::new().unwrap();

    let c_path = dir.path().join("input.c");
    fs::write(
        &c_path,
        "GLOBAL_ASM(\n.late_rodata\nglabel values\n.float 1.0, 2.0\n.text\nglabel my_func2\nnop\nnop\nnop\nnop\nnop\nnop\nnop\nnop\n)\n",
    )
    .unwrap();
    let opts = test_opts(&c_path);
    let res = parse_source(&c_path, &opts, false).unwrap();
    assert_eq!(res.functions.len(), 1);
    let stub_name = res.functions[0].data[OutputSection::Text]
        .0
        .clone()
        .unwrap();
    assert_eq!(res.functions[0].data[OutputSection::Text].1, 32);
    assert_eq!(res.functions[0].late_rodata_dummy_bytes.len(), 2);

    // The compiler's object: a 32-byte text stub and the two dummy float
    // constants the stub's float stores made the compiler reserve.
    let dummy_rodata = vec![0xe0, 0x12, 0x34, 0x56, 0xe0, 0x12, 0x34, 0x57];
    let (strtab, offs) = strtab_data(&[&stub_name]);
    let compiler_obj = build_elf(
        fmt,
        &[
            Sec {
                name: ".text",
                sh_type: SHT_PROGBITS,
                sh_flags: 0x6,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 4,
                sh_entsize: 0,
                data: vec![0xaa; 32],
            },
            Sec {
                name: ".rodata",
                sh_type: SHT_PROGBITS,
                sh_flags: 0x2,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 4,
                sh_entsize: 0,
                data: dummy_rodata,
            },
            Sec {
                name: ".symtab",
                sh_type: SHT_SYMTAB,
                sh_flags: 0,
                sh_link: 4,
                sh_info: 1,
                sh_addralign: 4,
                sh_entsize: 16,
                data: symtab_data(fmt, &[(offs[0], 0, 32, STB_GLOBAL << 4 | STT_FUNC, 1)]),
            },
            Sec {
                name: ".strtab",
                sh_type: SHT_STRTAB,
                sh_flags: 0,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
                data: strtab,
            },
        ],
    );
    let obj_path = dir.path().join("input.o");
    fs::write(&obj_path, &compiler_obj).unwrap();

    // The assembler's object: real text, and .late_rodata holding the two
    // real float bit patterns after the 8-byte guard padding.
    let real_text: Vec<u8> = (0..32u8).collect();
    let mut late_rodata = vec![0u8; 8];
    late_rodata.extend_from_slice(&[0x3f, 0x80, 0x00, 0x00]); // 1.0f
    late_rodata.extend_from_slice(&[0x40, 0x00, 0x00, 0x00]); // 2.0f
    let (asm_strtab, aoffs) = strtab_data(&[
        "my_func2",
        "values",
        &format!("{}_asm_start", stub_name),
        &format!("{}_asm_end", stub_name),
        "_asmbr_late_rodata_start",
        "_asmbr_late_rodata_end",
    ]);
    let asm_obj = build_elf(
        fmt,
        &[
            Sec {
                name: ".text",
                sh_type: SHT_PROGBITS,
                sh_flags: 0x6,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 4,
                sh_entsize: 0,
                data: real_text.clone(),
            },
            Sec {
                name: ".late_rodata",
                sh_type: SHT_PROGBITS,
                sh_flags: 0x2,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 4,
                sh_entsize: 0,
                data: late_rodata,
            },
            Sec {
                name: ".symtab",
                sh_type: SHT_SYMTAB,
                sh_flags: 0,
                sh_link: 4,
                sh_info: 1,
                sh_addralign: 4,
                sh_entsize: 16,
                data: symtab_data(
                    fmt,
                    &[
                        (aoffs[0], 0, 0, STB_GLOBAL << 4, 1),
                        (aoffs[1], 8, 0, STB_GLOBAL << 4, 2),
                        (aoffs[2], 0, 0, STB_GLOBAL << 4, 1),
                        (aoffs[3], 32, 0, STB_GLOBAL << 4, 1),
                        (aoffs[4], 8, 0, STB_GLOBAL << 4, 2),
                        (aoffs[5], 16, 0, STB_GLOBAL << 4, 2),
                    ],
                ),
            },
            Sec {
                name: ".strtab",
                sh_type: SHT_STRTAB,
                sh_flags: 0,
                sh_link: 0,
                sh_info: 0,
                sh_addralign: 1,
                sh_entsize: 0,
                data: asm_strtab,
            },
        ],
    );
    let asm_obj_path = dir.path().join("canned.o");
    fs::write(&asm_obj_path, &asm_obj).unwrap();

    let assembler = fake_assembler(&dir, &asm_obj_path);
    fixup_objfile(
        &obj_path,
        &res.functions,
        "",
        &assembler,
        &Encoding::Latin1,
        false,
        &SymbolVisibility::Local,
    )
    .unwrap();

    let out = ElfFile::new(&fs::read(&obj_path).unwrap()).unwrap();
    out.validate().unwrap();

    assert_eq!(out.find_section(".text").unwrap().data, real_text);
    // The dummy constants were overwritten with the real float bit patterns.
    let rodata = out.find_section(".rodata").unwrap();
    assert_eq!(
        rodata.data,
        vec![0x3f, 0x80, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00]
    );

    // The late rodata label moved to where the compiler put the dummies.
    let symtab = out.symtab();
    let values = symtab
        .symbol_entries
        .iter()
        .find(|s| s.borrow().name == "values")
        .expect("values missing from output");
    {
        let sym = values.borrow();
        assert_eq!(sym.st_shndx, rodata.index);
        assert_eq!(sym.st_value, 0);
    }
    let my_func2 = symtab
        .symbol_entries
        .iter()
        .find(|s| s.borrow().name == "my_func2")
        .unwrap();
    assert_eq!(my_func2.borrow().st_size, 32);
    assert_eq!(my_func2.borrow().st_type, STT_FUNC);
}
