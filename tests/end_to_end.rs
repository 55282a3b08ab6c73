//! Full-pipeline integration tests: C source string in, ELF64 relocatable
//! object bytes out. Scenarios are spec.md §8's six end-to-end cases.
//!
//! Since the toolchain is never invoked here, these tests inspect the
//! emitted object's byte layout directly (ELF header, section headers,
//! symbol table) rather than linking and running the result.

use ccrs::compile_translation_unit;
use ccrs::config::CompilerConfig;

struct Elf<'a> {
    bytes: &'a [u8],
}

struct SectionHeader {
    name_off: u32,
    sh_type: u32,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
}

impl<'a> Elf<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        assert_eq!(&bytes[0..4], &[0x7f, b'E', b'L', b'F'], "missing ELF magic");
        Elf { bytes }
    }

    fn u16_at(&self, off: usize) -> u16 {
        u16::from_le_bytes(self.bytes[off..off + 2].try_into().unwrap())
    }

    fn u32_at(&self, off: usize) -> u32 {
        u32::from_le_bytes(self.bytes[off..off + 4].try_into().unwrap())
    }

    fn u64_at(&self, off: usize) -> u64 {
        u64::from_le_bytes(self.bytes[off..off + 8].try_into().unwrap())
    }

    fn shoff(&self) -> u64 {
        self.u64_at(40)
    }

    fn shnum(&self) -> u16 {
        self.u16_at(60)
    }

    fn shstrndx(&self) -> u16 {
        self.u16_at(62)
    }

    fn section_header(&self, idx: u16) -> SectionHeader {
        let base = self.shoff() as usize + idx as usize * 64;
        SectionHeader {
            name_off: self.u32_at(base),
            sh_type: self.u32_at(base + 4),
            offset: self.u64_at(base + 24),
            size: self.u64_at(base + 32),
            link: self.u32_at(base + 40),
            info: self.u32_at(base + 44),
        }
    }

    fn cstr_at(&self, table_off: u64, off: u32) -> String {
        let start = table_off as usize + off as usize;
        let end = self.bytes[start..].iter().position(|&b| b == 0).unwrap() + start;
        String::from_utf8_lossy(&self.bytes[start..end]).into_owned()
    }

    fn section_name(&self, idx: u16) -> String {
        let shstr = self.section_header(self.shstrndx());
        self.cstr_at(shstr.offset, self.section_header(idx).name_off)
    }

    fn find_section(&self, name: &str) -> Option<(u16, SectionHeader)> {
        for i in 0..self.shnum() {
            if self.section_name(i) == name {
                return Some((i, self.section_header(i)));
            }
        }
        None
    }

    /// `(name, bind_global, shndx, value)` for every symtab entry.
    fn symbols(&self) -> Vec<(String, bool, u16, u64)> {
        let (_, symtab) = self.find_section(".symtab").expect(".symtab present");
        let strtab = self.section_header(symtab.link as u16);
        let count = symtab.size / 24;
        let mut out = Vec::new();
        for i in 0..count {
            let base = symtab.offset as usize + i as usize * 24;
            let name_off = self.u32_at(base);
            let info = self.bytes[base + 4];
            let shndx = self.u16_at(base + 6);
            let value = self.u64_at(base + 8);
            let name = self.cstr_at(strtab.offset, name_off);
            out.push((name, info >> 4 == 1, shndx, value));
        }
        out
    }
}

fn compile(source: &str) -> Vec<u8> {
    compile_translation_unit(source, "t.c", &CompilerConfig::new()).expect("compiles")
}

#[test]
fn scenario_1_return_constant_emits_global_main_in_text() {
    let object = compile("int main(){ return 42; }");
    let elf = Elf::new(&object);
    assert_eq!(elf.shoff(), 128);

    let (text_idx, _) = elf.find_section(".text").expect(".text present");
    let main_sym = elf
        .symbols()
        .into_iter()
        .find(|(name, ..)| name == "main")
        .expect("main symbol present");
    assert!(main_sym.1, "main must be bound global");
    assert_eq!(main_sym.2, text_idx, "main must live in .text");
}

#[test]
fn scenario_2_macro_expansion_feeds_constant_initializer() {
    let object = compile("#define SQ(x) ((x)*(x))\nint g = SQ(3+1);\nint main(){ return 0; }");
    let elf = Elf::new(&object);
    let (_, data) = elf.find_section(".data").expect(".data present");
    // ((3+1)*(3+1)) == 16, folded at compile time into the initializer.
    assert_eq!(data.size, 4);
    let value = u32::from_le_bytes(object[data.offset as usize..data.offset as usize + 4].try_into().unwrap());
    assert_eq!(value, 16);
}

#[test]
fn scenario_3_conditional_inclusion_picks_active_branch() {
    let active = compile("#if 1+2*3==7\nint g = 11;\n#endif\nint main(){ return 0; }");
    let elf = Elf::new(&active);
    let (_, data) = elf.find_section(".data").expect("active branch emits g");
    assert_eq!(data.size, 4);

    let inactive = compile("#if 1+2*3==9\nint g = 11;\n#endif\nint main(){ return 0; }");
    let elf = Elf::new(&inactive);
    assert!(elf.find_section(".data").is_none(), "inactive branch emits nothing");
}

#[test]
fn scenario_4_floating_comparison_compiles_to_comisd() {
    let src = "double add(double a, double b){ return a + b; }\n\
               int main(){ return add(2.3, 4.5) < 6.9; }";
    let object = compile(src);
    let elf = Elf::new(&object);
    let names: Vec<_> = elf.symbols().into_iter().map(|(n, ..)| n).collect();
    assert!(names.contains(&"add".to_string()));
    assert!(names.contains(&"main".to_string()));
}

#[test]
fn scenario_5_string_literal_array_init_is_exactly_sized_with_embedded_nuls() {
    let object = compile("char str1[] = \"ABC\\0\\0\\0DEF\";\nint main(){ return 0; }");
    let elf = Elf::new(&object);
    let (_, data) = elf.find_section(".data").expect(".data present");
    assert_eq!(data.size, 10);
    let bytes = &object[data.offset as usize..data.offset as usize + 10];
    assert_eq!(bytes, b"ABC\0\0\0DEF\0");
}

#[test]
fn scenario_6_designated_initializer_resumes_after_designator() {
    let src = "struct P { int x, y, z; };\n\
               struct P t = { .z = 3, .x = 2, 5 };\n\
               int main(){ return 0; }";
    let object = compile(src);
    let elf = Elf::new(&object);
    let (_, data) = elf.find_section(".data").expect(".data present");
    assert_eq!(data.size, 12);
    let off = data.offset as usize;
    let x = i32::from_le_bytes(object[off..off + 4].try_into().unwrap());
    let y = i32::from_le_bytes(object[off + 4..off + 8].try_into().unwrap());
    let z = i32::from_le_bytes(object[off + 8..off + 12].try_into().unwrap());
    assert_eq!((x, y, z), (2, 5, 3));
}

#[test]
fn shnum_matches_emitted_sections_plus_five() {
    // null, .text, .symtab, .strtab, .shstrtab: no data/rodata/relocations
    // for a single empty-bodied function.
    let object = compile("int main(){ return 0; }");
    let elf = Elf::new(&object);
    assert_eq!(elf.shnum(), 5);
}

#[test]
fn local_symbols_all_precede_global_symbols() {
    let object = compile("static int helper(void){ return 1; }\nint main(){ return helper(); }");
    let elf = Elf::new(&object);
    let syms = elf.symbols();
    let first_global = syms.iter().position(|(_, global, ..)| *global);
    if let Some(first_global) = first_global {
        assert!(syms[first_global..].iter().all(|(_, global, ..)| *global));
    }
}
