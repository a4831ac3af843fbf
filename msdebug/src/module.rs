//! Per-module loading of Microsoft debug information: the debug directory of an image or .DBG file
//! is examined and the best source of symbols within it is processed.


use tracing::{debug, error, info, instrument, warn};

use crate::LoadStatus;
use crate::codeview::process_codeview;
use crate::codeview::symbols::SymbolBuilder;
use crate::codeview::types::{TypeParseContext, TypeRegistry};
use crate::coff::process_coff;
use crate::error::Error;
use crate::image::{DebugDirectoryEntry, DebugType, ImageCharacteristics, ImageSource, MiscDebugInfo, SectionHeader};
use crate::locator::{dbg_file_name, locate_and_map, SearchPathConfig};
use crate::nt4dbg::DbgFile;
use crate::omap::OmapTable;
use crate::sink::SymbolSink;


/// What the loaders need to know about the module whose debug information they are reading.
#[derive(Clone, Debug)]
pub struct DebugModule {
    name: String,
    load_base: u64,
    timestamp: u32,
    sections: Vec<SectionHeader>,
    omap: Option<OmapTable>,
    search_path: SearchPathConfig,
}
impl DebugModule {
    pub fn new(name: String, load_base: u64, timestamp: u32, sections: Vec<SectionHeader>, search_path: SearchPathConfig) -> Self {
        Self {
            name,
            load_base,
            timestamp,
            sections,
            omap: None,
            search_path,
        }
    }

    pub fn from_image(image: &dyn ImageSource, search_path: SearchPathConfig) -> Self {
        Self::new(
            image.name().to_owned(),
            image.load_base(),
            image.timestamp(),
            image.section_headers().to_vec(),
            search_path,
        )
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn load_base(&self) -> u64 { self.load_base }
    pub fn timestamp(&self) -> u32 { self.timestamp }
    pub fn sections(&self) -> &[SectionHeader] { &self.sections }
    pub fn omap(&self) -> Option<&OmapTable> { self.omap.as_ref() }
    pub fn search_path(&self) -> &SearchPathConfig { &self.search_path }

    pub fn set_omap(&mut self, omap: OmapTable) {
        self.omap = Some(omap);
    }

    /// Maps a link-time RVA to the RVA in the loaded image; `None` if the code was discarded.
    pub fn translate(&self, rva: u32) -> Option<u32> {
        match &self.omap {
            Some(omap) => omap.translate(rva),
            None => Some(rva),
        }
    }

    pub(crate) fn symbol_builder<'a>(&'a self, registry: &'a TypeRegistry, sink: &'a mut dyn SymbolSink) -> SymbolBuilder<'a> {
        SymbolBuilder::new(registry, &self.sections, self.load_base, self.omap.as_ref(), sink)
    }
}


/// Processes the entries of a debug directory whose data lives in `file_bytes`.
///
/// OMAP information is installed first; then CodeView entries are tried until one loads, and COFF
/// entries only if none did.
#[instrument(skip_all, fields(module = module.name()))]
pub fn process_debug_directory(module: &mut DebugModule, file_bytes: &[u8], entries: &[DebugDirectoryEntry], ctx: &mut TypeParseContext, sink: &mut dyn SymbolSink) -> LoadStatus {
    if let Some(entry) = entries.iter().find(|e| e.kind == DebugType::OmapFromSource) {
        match entry.data(file_bytes) {
            Ok(data) => {
                let omap = OmapTable::from_bytes(data);
                debug!("{} OMAP entries", omap.entries().len());
                module.set_omap(omap);
            },
            Err(e) => debug!("skipping OMAP entry: {}", e),
        }
    }
    let module: &DebugModule = module;

    let mut status = LoadStatus::NoInfo;
    for entry in entries.iter().filter(|e| e.kind == DebugType::CodeView) {
        let root = match entry.data(file_bytes) {
            Ok(root) => root,
            Err(e) => {
                debug!("skipping CodeView entry: {}", e);
                continue;
            },
        };
        status = process_codeview(module, root, ctx, sink);
        if status == LoadStatus::Loaded {
            return status;
        }
    }

    for entry in entries.iter().filter(|e| e.kind == DebugType::Coff) {
        let root = match entry.data(file_bytes) {
            Ok(root) => root,
            Err(e) => {
                debug!("skipping COFF entry: {}", e);
                continue;
            },
        };
        status = process_coff(module, root, sink);
        if status == LoadStatus::Loaded {
            return status;
        }
    }

    status
}


/// Processes the .DBG file `name`, which is expected to belong to an image with the given
/// timestamp.
///
/// If the module has no section table yet, the one in the .DBG file is used.
#[instrument(skip_all, fields(dbg = name))]
pub fn process_dbg_file(module: &mut DebugModule, name: &str, timestamp: u32, ctx: &mut TypeParseContext, sink: &mut dyn SymbolSink) -> LoadStatus {
    let mapped = match locate_and_map(name, None, module.search_path()) {
        Ok(mapped) => mapped,
        Err(e) => return LoadStatus::from_result(Err(e), module.name()),
    };

    let dbg = match DbgFile::read(mapped.bytes()) {
        Ok(dbg) => dbg,
        Err(e) => {
            error!("failed to read {}: {}", mapped.path().display(), e);
            return LoadStatus::Error;
        },
    };
    if dbg.header.time_date_stamp != timestamp {
        // such files are often still usable
        warn!(
            "{} has timestamp {:#010X} but {:#010X} was expected",
            name, dbg.header.time_date_stamp, timestamp,
        );
    }
    if module.sections.is_empty() {
        module.sections = dbg.section_table.clone();
    }

    process_debug_directory(module, mapped.bytes(), &dbg.debug_directories, ctx, sink)
}


/// Loads the debug information of `image` into `sink`, following it into a .DBG file if it has
/// been stripped from the image.
#[instrument(skip_all, fields(module = module.name()))]
pub fn register_msc_debug_info(module: &mut DebugModule, image: &dyn ImageSource, ctx: &mut TypeParseContext, sink: &mut dyn SymbolSink) -> LoadStatus {
    let entries = image.debug_directory();
    if entries.is_empty() {
        info!("{} has no debug directory", module.name());
        return LoadStatus::NoInfo;
    }

    if !image.characteristics().contains(ImageCharacteristics::DEBUG_STRIPPED) {
        return process_debug_directory(module, image.file_bytes(), entries, ctx, sink);
    }

    let dbg_name = match stripped_dbg_name(image) {
        Ok(dbg_name) => dbg_name,
        Err(e) => {
            error!("debug information of {} stripped, but no .DBG file named: {}", module.name(), e);
            return LoadStatus::Error;
        },
    };
    debug!("debug information lives in {:?}", dbg_name);
    process_dbg_file(module, &dbg_name, image.timestamp(), ctx, sink)
}

/// The name of the .DBG file given in the only (MISC) entry of a stripped image's debug directory.
fn stripped_dbg_name(image: &dyn ImageSource) -> Result<String, Error> {
    let entries = image.debug_directory();
    if entries.len() != 1 || entries[0].kind != DebugType::Misc {
        return Err(Error::BadImage { reason: "debug directory of stripped image is not a single MISC entry" });
    }
    let misc = MiscDebugInfo::read(entries[0].data(image.file_bytes())?)?;
    if misc.data_type != MiscDebugInfo::DATA_TYPE_EXE_NAME {
        return Err(Error::BadImage { reason: "MISC entry does not name an executable" });
    }

    if misc.data.to_ascii_lowercase().ends_with(".dbg") {
        Ok(misc.data)
    } else {
        Ok(dbg_file_name(&misc.data))
    }
}


/// Loads the debug information of one module with a fresh type context.
pub fn load_module_debug_info(module: &mut DebugModule, image: &dyn ImageSource, sink: &mut dyn SymbolSink) -> LoadStatus {
    let mut ctx = TypeParseContext::new();
    let status = register_msc_debug_info(module, image, &mut ctx, sink);
    debug!("{} types defined while loading {}", ctx.registry.defined_count(), module.name());
    status
}
