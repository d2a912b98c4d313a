use crate::error::Error;
use std::{
    collections::HashMap,
    ffi::CStr,
    path::{Path, PathBuf},
};

/// A module (executable or shared library) mapped into the process
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleRecord {
    /// The file name of the module
    pub name: String,
    pub path: PathBuf,
    /// The lowest address of the module's loaded segments
    pub base: u64,
    /// The size of the address range covered by the loaded segments
    pub size: u64,
    /// What was added to the addresses in the module's file when it was
    /// loaded
    pub load_bias: u64,
    /// Separate debug information found on the search path, if any
    pub debug_file: Option<PathBuf>,
}

impl ModuleRecord {
    pub fn new(path: impl Into<PathBuf>, base: u64, size: u64) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Self {
            name,
            path,
            base,
            size,
            load_bias: 0,
            debug_file: None,
        }
    }

    pub fn with_load_bias(mut self, load_bias: u64) -> Self {
        self.load_bias = load_bias;
        self
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolInfo {
    /// The name as it appears in the symbol table
    pub raw: String,
    pub demangled: String,
    /// Offset of the address from the start of the symbol
    pub offset: u64,
}

impl SymbolInfo {
    /// Creates the info for a raw symbol name, demangling it if it is a Rust
    /// symbol
    pub fn new(raw: impl Into<String>, offset: u64) -> Self {
        let raw = raw.into();
        let demangled = rustc_demangle::try_demangle(&raw)
            .map(|demangled| format!("{demangled:#}"))
            .unwrap_or_else(|_| raw.clone());

        Self {
            raw,
            demangled,
            offset,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineInfo {
    pub file: PathBuf,
    pub line: Option<u32>,
}

/// The result of resolving a single address, each part may independently be
/// missing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub symbol: Option<SymbolInfo>,
    pub line: Option<LineInfo>,
}

/// The platform's debug information query
pub trait DebugInfo: Send {
    /// Lists the modules currently loaded in the process
    fn enumerate_modules(&mut self) -> Result<Vec<ModuleRecord>, Error>;

    /// Resolves a code address to its symbol and source line. `module` is the
    /// module containing the address, if it is known.
    fn resolve(&mut self, addr: u64, module: Option<&ModuleRecord>) -> Resolution;
}

/// Debug information of the calling process, modules are enumerated with
/// `dl_iterate_phdr`.
///
/// Addresses in a module that has a [`ModuleRecord::debug_file`] are looked up
/// in that file first. Anything still missing is resolved via [`backtrace`],
/// which only knows about the debug information of the loaded files.
#[derive(Default)]
pub struct NativeDebugInfo {
    /// Debug files are only opened once, even if they fail to load
    loaders: HashMap<PathBuf, Option<addr2line::Loader>>,
}

impl NativeDebugInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `file_addr`, an address relative to the file, in a separate debug
    /// file
    fn resolve_in_debug_file(&mut self, debug_file: &Path, file_addr: u64) -> Resolution {
        let loader = self
            .loaders
            .entry(debug_file.to_owned())
            .or_insert_with(|| match addr2line::Loader::new(debug_file) {
                Ok(loader) => {
                    log::debug!("loaded debug file {}", debug_file.display());
                    Some(loader)
                }
                Err(err) => {
                    log::warn!("failed to load debug file {}: {err}", debug_file.display());
                    None
                }
            });

        let Some(loader) = loader else {
            return Resolution::default();
        };

        let symbol = loader
            .find_symbol_info(file_addr)
            .map(|symbol| SymbolInfo::new(symbol.name(), file_addr.saturating_sub(symbol.address())));

        let line = loader
            .find_location(file_addr)
            .ok()
            .flatten()
            .and_then(|location| {
                location.file.map(|file| LineInfo {
                    file: PathBuf::from(file),
                    line: location.line,
                })
            });

        Resolution { symbol, line }
    }
}

/// Resolves an address with the debug information of the loaded files
fn resolve_loaded(addr: u64) -> Resolution {
    let mut resolution = Resolution::default();

    // Inlined functions are reported first, the innermost one is the most
    // useful so the first symbol wins
    backtrace::resolve(addr as usize as *mut libc::c_void, |symbol| {
        if resolution.symbol.is_none() {
            resolution.symbol = symbol
                .name()
                .map(|name| String::from_utf8_lossy(name.as_bytes()).into_owned())
                .map(|raw| {
                    let start = symbol.addr().map_or(addr, |start| start as usize as u64);
                    SymbolInfo::new(raw, addr.saturating_sub(start))
                });
        }

        if resolution.line.is_none() {
            resolution.line = symbol.filename().map(|file| LineInfo {
                file: file.to_owned(),
                line: symbol.lineno(),
            });
        }
    });

    resolution
}

impl DebugInfo for NativeDebugInfo {
    fn enumerate_modules(&mut self) -> Result<Vec<ModuleRecord>, Error> {
        unsafe extern "C" fn callback(
            info: *mut libc::dl_phdr_info,
            _size: usize,
            data: *mut libc::c_void,
        ) -> libc::c_int {
            unsafe {
                let modules = &mut *data.cast::<Vec<ModuleRecord>>();
                let info = &*info;

                let phdrs = if info.dlpi_phdr.is_null() {
                    &[][..]
                } else {
                    std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize)
                };

                let mut low = u64::MAX;
                let mut high = 0;
                for phdr in phdrs.iter().filter(|phdr| phdr.p_type == libc::PT_LOAD) {
                    low = low.min(phdr.p_vaddr);
                    high = high.max(phdr.p_vaddr + phdr.p_memsz);
                }

                if low >= high {
                    return 0;
                }

                let name = if info.dlpi_name.is_null() {
                    None
                } else {
                    Some(CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned())
                };

                // The main executable is reported without a name
                let path = match name.filter(|name| !name.is_empty()) {
                    Some(name) => PathBuf::from(name),
                    None => std::env::current_exe().unwrap_or_default(),
                };

                modules.push(
                    ModuleRecord::new(path, info.dlpi_addr + low, high - low)
                        .with_load_bias(info.dlpi_addr),
                );
                0
            }
        }

        let mut modules = Vec::new();

        // SAFETY: the callback only runs during the call
        unsafe {
            libc::dl_iterate_phdr(
                Some(callback),
                (&mut modules as *mut Vec<ModuleRecord>).cast(),
            );
        }

        if modules.is_empty() {
            Err(Error::NoModules)
        } else {
            Ok(modules)
        }
    }

    fn resolve(&mut self, addr: u64, module: Option<&ModuleRecord>) -> Resolution {
        let mut resolution = match module {
            Some(ModuleRecord {
                debug_file: Some(debug_file),
                load_bias,
                ..
            }) => self.resolve_in_debug_file(debug_file, addr.wrapping_sub(*load_bias)),
            _ => Resolution::default(),
        };

        if resolution.symbol.is_none() || resolution.line.is_none() {
            let loaded = resolve_loaded(addr);
            resolution.symbol = resolution.symbol.or(loaded.symbol);
            resolution.line = resolution.line.or(loaded.line);
        }

        resolution
    }
}

/// Looks for `<module>.debug` in each directory of the search path
pub(crate) fn find_debug_file(module: &ModuleRecord, search: &[PathBuf]) -> Option<PathBuf> {
    let file_name = format!("{}.debug", module.name);

    search
        .iter()
        .map(|dir| dir.join(&file_name))
        .find(|candidate| Path::is_file(candidate))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn demangles_rust_symbols() {
        let sym = SymbolInfo::new("_ZN4core9panicking5panic17h0123456789abcdefE", 4);
        assert_eq!(sym.demangled, "core::panicking::panic");
        assert_eq!(sym.offset, 4);

        let sym = SymbolInfo::new("memcpy", 0);
        assert_eq!(sym.demangled, "memcpy");
    }

    #[test]
    fn enumerates_own_modules() {
        let modules = NativeDebugInfo::new().enumerate_modules().unwrap();

        let this_fn = enumerates_own_modules as usize as u64;
        let exe = modules
            .iter()
            .find(|module| module.contains(this_fn))
            .expect("the test executable should be a module");

        assert_eq!(exe.path, std::env::current_exe().unwrap());
    }

    #[test]
    fn resolves_own_functions() {
        #[inline(never)]
        fn findable() -> u32 {
            std::hint::black_box(12)
        }

        let addr = findable as usize as u64;
        let resolution = NativeDebugInfo::new().resolve(addr, None);

        let symbol = resolution.symbol.expect("failed to resolve symbol");
        assert!(symbol.demangled.contains("findable"), "{}", symbol.demangled);
        assert_eq!(symbol.offset, 0);
    }

    /// A scratch directory holding a copy of the test executable named like a
    /// separate debug file of it
    fn debug_copy_of_exe() -> (PathBuf, ModuleRecord) {
        let dir = std::env::temp_dir()
            .join("stack-symbols")
            .join(uuid::Uuid::new_v4().simple().to_string());
        std::fs::create_dir_all(&dir).unwrap();

        let this_fn = debug_copy_of_exe as usize as u64;
        let exe = NativeDebugInfo::new()
            .enumerate_modules()
            .unwrap()
            .into_iter()
            .find(|module| module.contains(this_fn))
            .expect("the test executable should be a module");

        std::fs::copy(&exe.path, dir.join(format!("{}.debug", exe.name))).unwrap();
        (dir, exe)
    }

    #[test]
    fn finds_debug_files_in_order() {
        let (dir, exe) = debug_copy_of_exe();

        // Directories named like a debug file don't count
        let shadow = dir.join("shadow");
        std::fs::create_dir_all(shadow.join(format!("{}.debug", exe.name))).unwrap();

        let missing = dir.join("missing");
        let found = find_debug_file(&exe, &[missing.clone(), shadow, dir.clone()]);
        assert_eq!(found, Some(dir.join(format!("{}.debug", exe.name))));

        assert!(find_debug_file(&exe, &[missing]).is_none());
        assert!(find_debug_file(&ModuleRecord::new("/opt/host/plugin.so", 0, 1), &[dir.clone()]).is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn resolves_through_debug_file() {
        #[inline(never)]
        fn only_in_debug_file() -> u32 {
            std::hint::black_box(7)
        }

        let (dir, mut exe) = debug_copy_of_exe();
        let debug_file = find_debug_file(&exe, &[dir.clone()]).expect("debug file not found");

        let addr = only_in_debug_file as usize as u64;
        let mut native = NativeDebugInfo::new();

        let resolution = native.resolve_in_debug_file(&debug_file, addr - exe.load_bias);
        let symbol = resolution.symbol.expect("no symbol in the debug file");
        assert!(symbol.demangled.contains("only_in_debug_file"), "{}", symbol.demangled);
        assert_eq!(symbol.offset, 0);

        let line = resolution.line.expect("no line in the debug file");
        assert!(line.file.ends_with("debug_info.rs"), "{}", line.file.display());
        assert!(native.loaders.contains_key(&debug_file));

        // Through the trait, with the module pointing at the debug file
        exe.debug_file = Some(debug_file);
        let resolution = native.resolve(addr, Some(&exe));
        assert!(
            resolution
                .symbol
                .is_some_and(|symbol| symbol.demangled.contains("only_in_debug_file"))
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unloadable_debug_files_fall_back() {
        let mut module = ModuleRecord::new("/opt/host/plugin.so", 0, u64::MAX);
        module.debug_file = Some(PathBuf::from("/definitely/not/a/plugin.so.debug"));

        let addr = unloadable_debug_files_fall_back as usize as u64;
        let mut native = NativeDebugInfo::new();
        let resolution = native.resolve(addr, Some(&module));

        assert!(
            resolution
                .symbol
                .is_some_and(|symbol| symbol.demangled.contains("unloadable_debug_files_fall_back"))
        );
        // Only tried once
        assert!(matches!(
            native.loaders.get(module.debug_file.as_ref().unwrap()),
            Some(None)
        ));
    }
}
