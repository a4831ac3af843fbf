use std::fs;
use std::path::Path;

use msdebug::LoadStatus;
use msdebug::codeview::types::{parse_type_table, StructKind, TypeParseContext, TypeRecord};
use msdebug::error::TypeTableError;
use msdebug::image::ImageSource;
use msdebug::locator::{dbg_file_name, locate_and_map, SearchPathConfig};
use msdebug::module::{load_module_debug_info, DebugModule};
use msdebug::pe::PeImage;
use msdebug::sink::{SymbolKind, SymbolTable};


const IMAGE_TIMESTAMP: u32 = 0x1234_5678;


fn counted(name: &str) -> Vec<u8> {
    let mut ret = vec![name.len() as u8];
    ret.extend_from_slice(name.as_bytes());
    ret
}

fn record(body: &[u8]) -> Vec<u8> {
    let mut ret = (body.len() as u16).to_le_bytes().to_vec();
    ret.extend_from_slice(body);
    ret
}

fn global_procedure32(name: &str, segment: u16, offset: u32, length: u32) -> Vec<u8> {
    let mut body = 0x100Bu16.to_le_bytes().to_vec();
    for v in [0u32, 0, 0, length, 0, length, 0, offset] {
        body.extend_from_slice(&v.to_le_bytes());
    }
    body.extend_from_slice(&segment.to_le_bytes());
    body.push(0);
    body.extend(counted(name));
    record(&body)
}

fn global_data32(name: &str, segment: u16, offset: u32, type_index: u32) -> Vec<u8> {
    let mut body = 0x1008u16.to_le_bytes().to_vec();
    body.extend_from_slice(&type_index.to_le_bytes());
    body.extend_from_slice(&offset.to_le_bytes());
    body.extend_from_slice(&segment.to_le_bytes());
    body.extend(counted(name));
    record(&body)
}

fn member32(type_index: u32, offset: u16, name: &str) -> Vec<u8> {
    let mut ret = 0x1405u16.to_le_bytes().to_vec();
    ret.extend_from_slice(&3u16.to_le_bytes());
    ret.extend_from_slice(&type_index.to_le_bytes());
    ret.extend_from_slice(&offset.to_le_bytes());
    ret.extend(counted(name));
    ret
}

fn field_list32(members: &[Vec<u8>]) -> Vec<u8> {
    let mut body = 0x1203u16.to_le_bytes().to_vec();
    for member in members {
        body.extend_from_slice(member);
        while body.len() % 4 != 0 {
            body.push(0xF0 | (4 - body.len() % 4) as u8);
        }
    }
    record(&body)
}

fn structure32(member_count: u16, field_list: u32, size: u16, name: &str) -> Vec<u8> {
    let mut body = 0x1005u16.to_le_bytes().to_vec();
    body.extend_from_slice(&member_count.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&field_list.to_le_bytes());
    body.extend_from_slice(&[0u8; 8]);
    body.extend_from_slice(&size.to_le_bytes());
    body.extend(counted(name));
    record(&body)
}

/// Field list 0x1000 with two 32-bit ints at offsets 0 and 4; struct "Point" 0x1001.
fn point_types() -> Vec<u8> {
    let mut table = field_list32(&[member32(0x74, 0, "x"), member32(0x74, 4, "y")]);
    table.extend(structure32(2, 0x1000, 8, "Point"));
    table
}

/// A source-module line blob with one file covering one range of segment 1.
fn line_blob(file_name: &str, start: u32, end: u32, entries: &[(u32, u16)]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&8u32.to_le_bytes());
    let block_offset = 8 + 4 + 4 + 8 + 1 + file_name.len();
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    bytes.extend_from_slice(&(block_offset as u32).to_le_bytes());
    bytes.extend_from_slice(&start.to_le_bytes());
    bytes.extend_from_slice(&end.to_le_bytes());
    bytes.extend(counted(file_name));
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for (offset, _) in entries {
        bytes.extend_from_slice(&offset.to_le_bytes());
    }
    for (_, line) in entries {
        bytes.extend_from_slice(&line.to_le_bytes());
    }
    bytes
}

/// A PE32 image based at 0x400000 with one `.text` section at RVA 0x1000 holding the debug
/// directory; the debug data is appended to the file.
fn build_pe(debug_entries: &[(u32, Vec<u8>)], characteristics: u16) -> Vec<u8> {
    let mut image = vec![0u8; 0x400];
    image[0..2].copy_from_slice(b"MZ");
    image[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
    image[0x80..0x84].copy_from_slice(b"PE\0\0");
    image[0x84..0x86].copy_from_slice(&0x014Cu16.to_le_bytes());
    image[0x86..0x88].copy_from_slice(&1u16.to_le_bytes());
    image[0x88..0x8C].copy_from_slice(&IMAGE_TIMESTAMP.to_le_bytes());
    image[0x94..0x96].copy_from_slice(&(96u16 + 16 * 8).to_le_bytes());
    image[0x96..0x98].copy_from_slice(&characteristics.to_le_bytes());

    let oh = 0x98;
    image[oh..oh+2].copy_from_slice(&0x010Bu16.to_le_bytes());
    image[oh+28..oh+32].copy_from_slice(&0x0040_0000u32.to_le_bytes());
    image[oh+92..oh+96].copy_from_slice(&16u32.to_le_bytes());
    let debug_dd = oh + 96 + 6 * 8;
    image[debug_dd..debug_dd+4].copy_from_slice(&0x1000u32.to_le_bytes());
    image[debug_dd+4..debug_dd+8].copy_from_slice(&((debug_entries.len() * 28) as u32).to_le_bytes());

    let st = oh + 96 + 16 * 8;
    image[st..st+8].copy_from_slice(b".text\0\0\0");
    image[st+8..st+12].copy_from_slice(&0x200u32.to_le_bytes());
    image[st+12..st+16].copy_from_slice(&0x1000u32.to_le_bytes());
    image[st+16..st+20].copy_from_slice(&0x200u32.to_le_bytes());
    image[st+20..st+24].copy_from_slice(&0x200u32.to_le_bytes());
    image[st+36..st+40].copy_from_slice(&0x6000_0020u32.to_le_bytes());

    for (i, (kind, data)) in debug_entries.iter().enumerate() {
        let data_offset = image.len() as u32;
        image.extend_from_slice(data);
        let entry = 0x200 + i * 28;
        image[entry+12..entry+16].copy_from_slice(&kind.to_le_bytes());
        image[entry+16..entry+20].copy_from_slice(&(data.len() as u32).to_le_bytes());
        image[entry+24..entry+28].copy_from_slice(&data_offset.to_le_bytes());
    }
    image
}

/// An NB09 block with a single directory of `(subsection type, module index, data)` entries.
fn build_nb09(subsections: &[(u16, u16, Vec<u8>)]) -> Vec<u8> {
    let mut root = b"NB09\0\0\0\0".to_vec();
    let mut placed = Vec::new();
    for (kind, module_index, data) in subsections {
        placed.push((*kind, *module_index, root.len() as u32, data.len() as u32));
        root.extend_from_slice(data);
    }
    let directory_offset = root.len() as u32;
    root[4..8].copy_from_slice(&directory_offset.to_le_bytes());
    root.extend_from_slice(&16u16.to_le_bytes());
    root.extend_from_slice(&12u16.to_le_bytes());
    root.extend_from_slice(&(placed.len() as u32).to_le_bytes());
    root.extend_from_slice(&[0u8; 8]);
    for (kind, module_index, offset, size) in placed {
        root.extend_from_slice(&kind.to_le_bytes());
        root.extend_from_slice(&module_index.to_le_bytes());
        root.extend_from_slice(&offset.to_le_bytes());
        root.extend_from_slice(&size.to_le_bytes());
    }
    root
}

/// A program database with the given block size; `None` streams are stored as absent.
fn build_pdb(block_size: usize, streams: &[Option<Vec<u8>>]) -> Vec<u8> {
    fn place(data: &[u8], block_size: usize, blocks: &mut Vec<Vec<u8>>) -> Vec<u16> {
        let mut list = Vec::new();
        for chunk in data.chunks(block_size) {
            let mut block = chunk.to_vec();
            block.resize(block_size, 0);
            list.push(blocks.len() as u16);
            blocks.push(block);
        }
        list
    }

    let mut blocks = vec![vec![0u8; block_size]];
    let mut toc = (streams.len() as u32).to_le_bytes().to_vec();
    for stream in streams {
        let size = stream.as_ref().map(|s| s.len() as u32).unwrap_or(0xFFFF_FFFF);
        toc.extend_from_slice(&size.to_le_bytes());
        toc.extend_from_slice(&0u32.to_le_bytes());
    }
    for data in streams.iter().flatten() {
        for block in place(data, block_size, &mut blocks) {
            toc.extend_from_slice(&block.to_le_bytes());
        }
    }
    let toc_blocks = place(&toc, block_size, &mut blocks);

    let header = &mut blocks[0];
    header[0..40].copy_from_slice(b"Microsoft C/C++ program database 2.00\r\n\x1a");
    header[40..44].copy_from_slice(b"JG\0\0");
    header[44..48].copy_from_slice(&(block_size as u32).to_le_bytes());
    header[52..56].copy_from_slice(&(toc.len() as u32).to_le_bytes());
    for (i, block) in toc_blocks.iter().enumerate() {
        header[60+2*i..62+2*i].copy_from_slice(&block.to_le_bytes());
    }
    blocks.concat()
}

fn nb10(pdb_name: &str, timestamp: u32) -> Vec<u8> {
    let mut root = b"NB10\0\0\0\0".to_vec();
    root.extend_from_slice(&timestamp.to_le_bytes());
    root.extend_from_slice(&1u32.to_le_bytes());
    root.extend_from_slice(pdb_name.as_bytes());
    root.push(0);
    root
}

fn coff_symbol(name: &[u8], value: u32, section: i16, symbol_type: u16, storage_class: u8, aux_count: u8) -> Vec<u8> {
    let mut bytes = vec![0u8; 8];
    bytes[..name.len()].copy_from_slice(name);
    bytes.extend_from_slice(&value.to_le_bytes());
    bytes.extend_from_slice(&section.to_le_bytes());
    bytes.extend_from_slice(&symbol_type.to_le_bytes());
    bytes.push(storage_class);
    bytes.push(aux_count);
    bytes
}

fn search_path_with(dir: &Path) -> SearchPathConfig {
    SearchPathConfig::new(Vec::new(), vec![dir.to_owned()], Vec::new())
}


#[test]
fn single_procedure_from_nb09() {
    let mut symbols = 1u32.to_le_bytes().to_vec();
    symbols.extend(global_procedure32("main", 1, 0, 16));
    let bytes = build_pe(&[(2, build_nb09(&[(0x125, 1, symbols)]))], 0x0102);
    let image = PeImage::parse("a.exe", &bytes).expect("failed to parse image");

    let mut module = DebugModule::from_image(&image, SearchPathConfig::default());
    let mut sink = SymbolTable::new();
    assert_eq!(load_module_debug_info(&mut module, &image, &mut sink), LoadStatus::Loaded);

    assert_eq!(sink.symbols().len(), 1);
    let main = &sink.symbols()[0];
    assert_eq!(main.name, "main");
    assert_eq!(main.kind, SymbolKind::Function);
    assert_eq!(main.address, image.load_base() + u64::from(image.section_headers()[0].virtual_address));
    assert_eq!(main.size, Some(16));
}

#[test]
fn types_symbols_and_lines_from_pdb() {
    let dir = tempfile::tempdir().unwrap();

    let mut root = Vec::new();
    for v in [19970604u32, IMAGE_TIMESTAMP, 1, 0] {
        root.extend_from_slice(&v.to_le_bytes());
    }

    let type_records = point_types();
    let mut types = Vec::new();
    for v in [19961031u32, 56, 0x1000, 0x1002, type_records.len() as u32] {
        types.extend_from_slice(&v.to_le_bytes());
    }
    types.extend_from_slice(&[0xFF, 0xFF, 0, 0]);
    types.extend_from_slice(&[0u8; 32]);
    types.extend_from_slice(&type_records);

    let global_symbols = global_data32("origin", 1, 0x40, 0x1001);

    let mut module_stream = 4u32.to_le_bytes().to_vec();
    module_stream.extend(global_procedure32("main", 1, 0x10, 0x20));
    let symbol_size = module_stream.len() as u32;
    let lines = line_blob("main.c", 0x10, 0x30, &[(0x10, 5), (0x18, 6)]);
    let line_size = lines.len() as u32;
    module_stream.extend(lines);

    let mut module_info = vec![0u8; 64];
    module_info[34..36].copy_from_slice(&5u16.to_le_bytes());
    module_info[36..40].copy_from_slice(&symbol_size.to_le_bytes());
    module_info[40..44].copy_from_slice(&line_size.to_le_bytes());
    module_info.extend_from_slice(b"main.obj\0main.obj\0");
    while module_info.len() % 4 != 0 {
        module_info.push(0);
    }
    let mut symbols = Vec::new();
    for v in [0xFFFF_FFFFu32, 19970606, 1, 0xFFFF, 0xFFFF, 4, module_info.len() as u32, 0, 0, 0, 0] {
        symbols.extend_from_slice(&v.to_le_bytes());
    }
    symbols.extend_from_slice(&[0u8; 20]);
    symbols.extend(module_info);

    // enough absent streams that the table of contents needs two blocks
    let mut streams = vec![None, Some(root), Some(types), Some(symbols), Some(global_symbols), Some(module_stream)];
    streams.resize(70, None);
    let pdb = build_pdb(512, &streams);
    assert_eq!(u32::from_le_bytes(pdb[44..48].try_into().unwrap()), 512);
    assert!(u32::from_le_bytes(pdb[52..56].try_into().unwrap()) > 512);
    fs::write(dir.path().join("app.pdb"), pdb).unwrap();

    let bytes = build_pe(&[(2, nb10(r"C:\build\app.pdb", IMAGE_TIMESTAMP))], 0x0102);
    let image = PeImage::parse("app.exe", &bytes).expect("failed to parse image");
    let mut module = DebugModule::from_image(&image, search_path_with(dir.path()));
    let mut sink = SymbolTable::new();
    assert_eq!(load_module_debug_info(&mut module, &image, &mut sink), LoadStatus::Loaded);

    let Some(TypeRecord::Struct { kind, name, size, members }) = sink.type_by_index(0x1001) else {
        panic!("Point is not a struct");
    };
    assert_eq!(*kind, StructKind::Struct);
    assert_eq!(name.as_deref(), Some("Point"));
    assert_eq!(*size, 8);
    assert_eq!(members.len(), 2);
    assert!(members.iter().all(|m| m.bit_width == 32));
    assert_eq!(members[1].bit_offset, 32);

    let origin = sink.find_by_name("origin").expect("origin missing");
    assert_eq!(origin.address, 0x40_1040);
    assert_eq!(origin.type_record.as_ref().and_then(|t| t.name()), Some("Point"));

    let main = sink.find_by_name("main").expect("main missing");
    assert_eq!(main.address, 0x40_1010);
    assert_eq!(main.source_file.as_deref(), Some("main.c"));
    assert_eq!(sink.line_for_address(0x40_101A).map(|(_, line)| line), Some(6));
}

#[test]
fn dbg_file_found_on_primary_path() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("foo.dbg"), b"DI").unwrap();

    let config = SearchPathConfig::from_vars(dir.path().to_str(), None);
    assert!(config.alternate.is_empty());
    let mapped = locate_and_map(&dbg_file_name("foo.exe"), None, &config).expect("foo.dbg not found");
    assert_eq!(mapped.path(), dir.path().join("foo.dbg"));
    assert_eq!(mapped.bytes(), b"DI");
}

#[test]
fn stripped_image_loads_coff_from_dbg() {
    let dir = tempfile::tempdir().unwrap();

    // COFF: .file main.c, its text section with two lines, and external function _start
    let mut file_aux = b"main.c".to_vec();
    file_aux.resize(18, 0);
    let mut section_aux = 0x40u32.to_le_bytes().to_vec();
    section_aux.extend_from_slice(&0u16.to_le_bytes());
    section_aux.extend_from_slice(&2u16.to_le_bytes());
    section_aux.resize(18, 0);
    let symbols = [
        coff_symbol(b".file", 0, -2, 0, 103, 1),
        file_aux,
        coff_symbol(b".text", 0, 1, 0, 3, 1),
        section_aux,
        coff_symbol(b"_start", 0x8, 1, 0x20, 2, 0),
    ].concat();
    let symbol_count = (symbols.len() / 18) as u32;
    let line_offset = 32 + symbols.len() as u32 + 4;
    let mut coff = Vec::new();
    for v in [symbol_count, 32, 2, line_offset, 0, 0, 0, 0] {
        coff.extend_from_slice(&v.to_le_bytes());
    }
    coff.extend_from_slice(&symbols);
    coff.extend_from_slice(&4u32.to_le_bytes());
    for (address, line) in [(0x1008u32, 3u16), (0x100Cu32, 4u16)] {
        coff.extend_from_slice(&address.to_le_bytes());
        coff.extend_from_slice(&line.to_le_bytes());
    }

    // .DBG file without sections whose directory holds the COFF entry
    let mut dbg = Vec::new();
    dbg.extend_from_slice(&0x4944u16.to_le_bytes());
    dbg.extend_from_slice(&[0u8; 6]);
    dbg.extend_from_slice(&IMAGE_TIMESTAMP.to_le_bytes());
    dbg.extend_from_slice(&[0u8; 12]);
    dbg.extend_from_slice(&0u32.to_le_bytes());
    dbg.extend_from_slice(&0u32.to_le_bytes());
    dbg.extend_from_slice(&28u32.to_le_bytes());
    dbg.extend_from_slice(&[0u8; 12]);
    let entry = dbg.len();
    dbg.resize(entry + 28, 0);
    let data_offset = dbg.len() as u32;
    dbg[entry+12..entry+16].copy_from_slice(&1u32.to_le_bytes());
    dbg[entry+16..entry+20].copy_from_slice(&(coff.len() as u32).to_le_bytes());
    dbg[entry+24..entry+28].copy_from_slice(&data_offset.to_le_bytes());
    dbg.extend(coff);
    fs::write(dir.path().join("app.dbg"), dbg).unwrap();

    let mut misc = 1u32.to_le_bytes().to_vec();
    misc.extend_from_slice(&(12u32 + 8).to_le_bytes());
    misc.extend_from_slice(&[0u8; 4]);
    misc.extend_from_slice(b"app.dbg\0");
    let bytes = build_pe(&[(4, misc)], 0x0302);
    let image = PeImage::parse("app.exe", &bytes).expect("failed to parse image");

    let mut module = DebugModule::from_image(&image, search_path_with(dir.path()));
    let mut sink = SymbolTable::new();
    assert_eq!(load_module_debug_info(&mut module, &image, &mut sink), LoadStatus::Loaded);

    let start = sink.find_by_name("start").expect("start missing");
    assert_eq!(start.address, 0x40_1008);
    assert_eq!(start.source_file.as_deref(), Some("main.c"));
    let lines: Vec<(u32, u32)> = start.lines.iter().map(|l| (l.line, l.offset)).collect();
    assert_eq!(lines, vec![(3, 0), (4, 4)]);
}

#[test]
fn unknown_member_fails_pass_but_keeps_earlier_types() {
    let mut table = point_types();
    // 0x1002: field list whose only member has the unknown kind 0x0999
    table.extend(record(&[0x03, 0x12, 0x99, 0x09, 0x00, 0x00]));
    table.extend(structure32(1, 0x1002, 4, "Broken"));

    let mut ctx = TypeParseContext::new();
    let mut sink = SymbolTable::new();
    let result = parse_type_table(&mut ctx, &table, &mut sink);
    assert!(matches!(result, Err(TypeTableError::UnknownFieldListMember { kind: 0x0999, .. })));

    assert_eq!(ctx.registry.lookup(0x1001).and_then(|t| t.name()), Some("Point"));
    assert_eq!(ctx.registry.size_of(0x1001), Some(8));
    assert!(ctx.registry.find_member(0x1001, "y").is_some());
    assert_eq!(sink.type_by_index(0x1001).and_then(|t| t.name()), Some("Point"));
    assert!(ctx.registry.lookup(0x1003).is_none());
}
