use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use msdebug::LoadStatus;
use msdebug::codeview::types::TypeParseContext;
use msdebug::image::{DebugDirectoryEntry, DebugType, ImageSource};
use msdebug::locator::{split_search_path, MappedFile, SearchPathConfig};
use msdebug::module::{load_module_debug_info, process_dbg_file, DebugModule};
use msdebug::nt4dbg::DbgFile;
use msdebug::omap::OmapTable;
use msdebug::pdb::{read_module_infos, PdbFile, RootHeader, SymbolsHeader, TypesHeader, ROOT_STREAM, SYMBOLS_STREAM, TYPES_STREAM};
use msdebug::pe::PeImage;
use msdebug::sink::SymbolTable;
use tracing::debug;
use tracing_subscriber::EnvFilter;


#[derive(Parser)]
struct Opts {
    /// Directories searched for .DBG and .PDB files; replaces `_NT_SYMBOL_PATH`.
    #[arg(long, global = true)]
    pub symbol_path: Option<String>,

    /// Directories searched before the symbol path; replaces `_NT_ALT_SYMBOL_PATH`.
    #[arg(long, global = true)]
    pub alt_symbol_path: Option<String>,

    /// Output JSON instead of a listing.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub mode: ProgMode,
}

#[derive(Subcommand)]
enum ProgMode {
    /// Load the debug information of a PE image.
    Image(ImageArgs),

    /// Load a .DBG file on its own.
    Dbg(DbgArgs),

    /// List the streams of a program database.
    Pdb(InputFileOnlyArgs),

    /// Translate an address through the OMAP table of an image or .DBG file.
    Omap(OmapArgs),
}

#[derive(Parser)]
struct ImageArgs {
    pub input_file: PathBuf,

    #[arg(long, value_parser = parse_u64)]
    pub load_base: Option<u64>,
}

#[derive(Parser)]
struct DbgArgs {
    pub input_file: PathBuf,

    /// The timestamp of the image the file belongs to; defaults to the file's own.
    #[arg(long, value_parser = parse_u32)]
    pub timestamp: Option<u32>,

    #[arg(long, value_parser = parse_u64, default_value = "0")]
    pub load_base: u64,
}

#[derive(Parser)]
struct InputFileOnlyArgs {
    pub input_file: PathBuf,
}

#[derive(Parser)]
struct OmapArgs {
    pub input_file: PathBuf,

    #[arg(value_parser = parse_u32)]
    pub address: u32,
}


fn parse_u64(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn parse_u32(text: &str) -> Result<u32, String> {
    let value = parse_u64(text)?;
    u32::try_from(value).map_err(|e| e.to_string())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn search_path_config(opts: &Opts) -> SearchPathConfig {
    let mut config = SearchPathConfig::from_env();
    if let Some(symbol_path) = &opts.symbol_path {
        config.primary = split_search_path(symbol_path);
    }
    if let Some(alt_symbol_path) = &opts.alt_symbol_path {
        config.alternate = split_search_path(alt_symbol_path);
    }
    config
}

fn output_symbols(status: LoadStatus, table: &SymbolTable, json: bool) {
    if json {
        let output = serde_json::json!({
            "status": status,
            "table": table,
        });
        let text = serde_json::to_string_pretty(&output)
            .expect("failed to serialize symbol table");
        println!("{}", text);
        return;
    }

    println!("status: {:?}", status);
    for symbol in table.symbols() {
        let size = symbol.size.map(|s| format!("{:#X}", s)).unwrap_or_else(|| "?".to_owned());
        print!("{:#010X} {:>6} {:?} {}", symbol.address, size, symbol.kind, symbol.name);
        if let Some(type_name) = symbol.type_record.as_ref().and_then(|t| t.name()) {
            print!(" : {}", type_name);
        }
        if let Some(source_file) = &symbol.source_file {
            match symbol.lines.first() {
                Some(first) => print!(" [{}:{}]", source_file, first.line),
                None => print!(" [{}]", source_file),
            }
        }
        println!();
        for local in &symbol.locals {
            println!("    {:?} {} at frame offset {}", local.kind, local.name, local.frame_offset);
        }
    }
    println!("{} types", table.types().len());
}

fn omap_of(bytes: &[u8], entries: &[DebugDirectoryEntry]) -> Option<OmapTable> {
    let entry = entries.iter().find(|e| e.kind == DebugType::OmapFromSource)?;
    let data = entry.data(bytes)
        .expect("OMAP entry lies outside the file");
    Some(OmapTable::from_bytes(data))
}


fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();
    let config = search_path_config(&opts);
    debug!("searching {:?}", config.directories().collect::<Vec<_>>());
    match &opts.mode {
        ProgMode::Image(args) => {
            let bytes = std::fs::read(&args.input_file)
                .expect("failed to read input file");
            let mut image = PeImage::parse(&file_name_of(&args.input_file), &bytes)
                .expect("failed to parse image");
            if let Some(load_base) = args.load_base {
                image = image.with_load_base(load_base);
            }

            let mut module = DebugModule::from_image(&image, config);
            let mut table = SymbolTable::new();
            let status = load_module_debug_info(&mut module, &image, &mut table);
            output_symbols(status, &table, opts.json);
        },
        ProgMode::Dbg(args) => {
            let mapped = MappedFile::open(&args.input_file)
                .expect("failed to map input file");
            let dbg = DbgFile::read(mapped.bytes())
                .expect("failed to read DBG file");
            let timestamp = args.timestamp.unwrap_or(dbg.header.time_date_stamp);

            // make sure the file given is the one found
            let mut config = config;
            if let Some(parent) = args.input_file.parent() {
                config.alternate.insert(0, parent.to_owned());
            }
            let name = file_name_of(&args.input_file);
            let mut module = DebugModule::new(name.clone(), args.load_base, timestamp, Vec::new(), config);
            let mut ctx = TypeParseContext::new();
            let mut table = SymbolTable::new();
            let status = process_dbg_file(&mut module, &name, timestamp, &mut ctx, &mut table);
            output_symbols(status, &table, opts.json);
        },
        ProgMode::Pdb(args) => {
            let mapped = MappedFile::open(&args.input_file)
                .expect("failed to map input file");
            let pdb = PdbFile::parse(mapped.bytes())
                .expect("failed to parse program database");

            let root = pdb.stream(ROOT_STREAM)
                .expect("failed to read root stream")
                .map(|s| RootHeader::read(&s).expect("failed to read root header"));
            let types = pdb.stream(TYPES_STREAM)
                .expect("failed to read types stream")
                .map(|s| TypesHeader::read(&s).expect("failed to read types header"));
            let symbols_stream = pdb.stream(SYMBOLS_STREAM)
                .expect("failed to read symbols stream");
            let symbols = symbols_stream.as_deref()
                .map(|s| SymbolsHeader::read(s).expect("failed to read symbols header"));
            let modules = match (&symbols_stream, &symbols) {
                (Some(stream), Some(header)) => read_module_infos(stream, header)
                    .expect("failed to read module descriptors"),
                _ => Vec::new(),
            };

            if opts.json {
                let output = serde_json::json!({
                    "header": pdb.header(),
                    "streams": pdb.streams(),
                    "root": root,
                    "types": types,
                    "symbols": symbols,
                    "modules": modules,
                });
                let text = serde_json::to_string_pretty(&output)
                    .expect("failed to serialize program database summary");
                println!("{}", text);
            } else {
                println!("block size {}, {} streams", pdb.header().block_size, pdb.streams().len());
                for (i, stream) in pdb.streams().iter().enumerate() {
                    if stream.is_present() {
                        println!("  stream {:4}: {} bytes", i, stream.size);
                    }
                }
                println!("{:#?}", root);
                println!("{:#?}", types);
                println!("{:#?}", symbols);
                for module in &modules {
                    println!(
                        "module {:?} ({:?}): stream {}, {} bytes of symbols, {} bytes of lines",
                        module.module_name, module.object_name, module.stream, module.symbol_size, module.line_size,
                    );
                }
            }
        },
        ProgMode::Omap(args) => {
            let bytes = std::fs::read(&args.input_file)
                .expect("failed to read input file");
            let omap = if bytes.starts_with(b"MZ") {
                let image = PeImage::parse(&file_name_of(&args.input_file), &bytes)
                    .expect("failed to parse image");
                omap_of(&bytes, image.debug_directory())
            } else {
                let dbg = DbgFile::read(&bytes)
                    .expect("failed to read DBG file");
                omap_of(&bytes, &dbg.debug_directories)
            };

            let Some(omap) = omap else {
                println!("no OMAP table; {:#010X} stays {:#010X}", args.address, args.address);
                return;
            };
            let translated = omap.translate(args.address);
            if opts.json {
                let output = serde_json::json!({
                    "address": args.address,
                    "translated": translated,
                    "entries": omap.entries().len(),
                });
                println!("{}", output);
            } else {
                match translated {
                    Some(to) => println!("{:#010X} -> {:#010X}", args.address, to),
                    None => println!("{:#010X} was discarded", args.address),
                }
            }
        },
    }
}
