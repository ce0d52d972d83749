/// Dynamic-unit loader
///
/// Two halves. [`Loader::inspect`] reads the artifact as data in the harness
/// process and decides every link failure before anything is loaded.
/// [`Loader::load`] opens the unit and binds the entry point; it runs the
/// unit's initializers, so it is only ever called inside the isolated
/// candidate process.
use super::contract::{Candidate, CandidateContract};
use crate::config::types::WordWidth;
use object::{Architecture, BinaryFormat, Object, ObjectKind, ObjectSection, ObjectSymbol, SectionKind};
use serde::{Deserialize, Serialize};
use std::ffi::{CStr, CString};
use std::os::raw::c_void;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Contract violations detected before invocation
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkError {
    #[error("artifact {path} does not exist or is not a regular file")]
    ArtifactMissing { path: PathBuf },

    #[error("cannot load {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("entry point '{symbol}' not found: {reason}")]
    SymbolMissing { symbol: String, reason: String },

    #[error("entry point '{symbol}' resolves into {provider}, not the candidate artifact")]
    ForeignSymbol { symbol: String, provider: String },

    #[error("entry point '{symbol}' is not in an executable mapping")]
    NotExecutable { symbol: String },
}

enum EntryFn {
    W32(extern "C" fn() -> u32),
    W64(extern "C" fn() -> u64),
}

/// A dynamic unit bound to its entry point. Dropping it unloads the unit.
pub struct LoadedCandidate {
    handle: *mut c_void,
    entry: EntryFn,
}

impl Candidate for LoadedCandidate {
    fn invoke(&mut self) -> u64 {
        match self.entry {
            EntryFn::W32(f) => f() as u64,
            EntryFn::W64(f) => f(),
        }
    }
}

impl Drop for LoadedCandidate {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe {
                libc::dlclose(self.handle);
            }
            self.handle = std::ptr::null_mut();
        }
    }
}

/// Resolves artifacts against a fixed contract
#[derive(Clone, Debug)]
pub struct Loader {
    contract: CandidateContract,
}

impl Loader {
    pub fn new(contract: CandidateContract) -> Self {
        Self { contract }
    }

    pub fn contract(&self) -> &CandidateContract {
        &self.contract
    }

    /// Cheap checks that need no code execution; safe in the harness process.
    pub fn preflight(&self, artifact: &Path) -> Result<(), LinkError> {
        match std::fs::metadata(artifact) {
            Ok(meta) if meta.is_file() => Ok(()),
            _ => Err(LinkError::ArtifactMissing {
                path: artifact.to_path_buf(),
            }),
        }
    }

    /// Check `artifact` against the contract without executing any of it.
    ///
    /// The artifact must be an ELF shared object for the host architecture
    /// whose dynamic symbol table defines the entry point in a code section.
    /// A name that is only imported (left for a dependency to supply) is a
    /// foreign symbol.
    pub fn inspect(&self, artifact: &Path) -> Result<(), LinkError> {
        self.preflight(artifact)?;
        let open_error = |reason: String| LinkError::Open {
            path: artifact.to_path_buf(),
            reason,
        };

        let data = std::fs::read(artifact).map_err(|e| open_error(e.to_string()))?;
        let file = object::File::parse(&*data).map_err(|e| open_error(format!("not an object file: {e}")))?;
        if file.format() != BinaryFormat::Elf || file.kind() != ObjectKind::Dynamic {
            return Err(open_error(format!(
                "expected an ELF shared object, found {:?} {:?}",
                file.format(),
                file.kind()
            )));
        }
        if let Some(host) = host_architecture() {
            if file.architecture() != host {
                return Err(open_error(format!(
                    "built for {:?}, harness runs on {:?}",
                    file.architecture(),
                    host
                )));
            }
        }

        let symbol = self.contract.entry_point.as_str();
        let mut imported = false;
        for sym in file.dynamic_symbols() {
            if sym.name().ok() != Some(symbol) {
                continue;
            }
            if sym.is_undefined() {
                imported = true;
                continue;
            }
            let in_code = sym
                .section_index()
                .and_then(|index| file.section_by_index(index).ok())
                .map_or(false, |section| section.kind() == SectionKind::Text);
            return if in_code {
                Ok(())
            } else {
                Err(LinkError::NotExecutable {
                    symbol: symbol.to_string(),
                })
            };
        }

        if imported {
            Err(LinkError::ForeignSymbol {
                symbol: symbol.to_string(),
                provider: "a dependency (imported, not defined by the artifact)".to_string(),
            })
        } else {
            Err(LinkError::SymbolMissing {
                symbol: symbol.to_string(),
                reason: "no dynamic symbol with that name".to_string(),
            })
        }
    }

    /// Load `artifact` and bind the contract entry point.
    pub fn load(&self, artifact: &Path) -> Result<LoadedCandidate, LinkError> {
        self.preflight(artifact)?;

        let path_c = CString::new(artifact.as_os_str().as_bytes()).map_err(|_| LinkError::Open {
            path: artifact.to_path_buf(),
            reason: "path contains NUL byte".to_string(),
        })?;
        let symbol = self.contract.entry_point.as_str();
        // EntryPoint is validated as a C identifier, so it has no NUL bytes.
        let symbol_c = CString::new(symbol).map_err(|_| LinkError::SymbolMissing {
            symbol: symbol.to_string(),
            reason: "symbol contains NUL byte".to_string(),
        })?;

        let handle = unsafe { libc::dlopen(path_c.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(LinkError::Open {
                path: artifact.to_path_buf(),
                reason: last_dl_error(),
            });
        }

        // Own the handle from here so every error path unloads it.
        let mut loaded = LoadedCandidate {
            handle,
            entry: EntryFn::W32(unresolved),
        };

        unsafe {
            libc::dlerror();
        }
        let addr = unsafe { libc::dlsym(handle, symbol_c.as_ptr()) };
        if addr.is_null() {
            return Err(LinkError::SymbolMissing {
                symbol: symbol.to_string(),
                reason: last_dl_error(),
            });
        }

        if let Some(provider) = symbol_provider(addr) {
            if !same_file(Path::new(&provider), artifact) {
                return Err(LinkError::ForeignSymbol {
                    symbol: symbol.to_string(),
                    provider,
                });
            }
        }

        if mapping_is_executable(addr as usize) == Some(false) {
            return Err(LinkError::NotExecutable {
                symbol: symbol.to_string(),
            });
        }

        loaded.entry = match self.contract.word_width {
            WordWidth::W32 => EntryFn::W32(unsafe {
                std::mem::transmute::<*mut c_void, extern "C" fn() -> u32>(addr)
            }),
            WordWidth::W64 => EntryFn::W64(unsafe {
                std::mem::transmute::<*mut c_void, extern "C" fn() -> u64>(addr)
            }),
        };
        Ok(loaded)
    }
}

extern "C" fn unresolved() -> u32 {
    0
}

fn host_architecture() -> Option<Architecture> {
    match std::env::consts::ARCH {
        "x86_64" => Some(Architecture::X86_64),
        "x86" => Some(Architecture::I386),
        "aarch64" => Some(Architecture::Aarch64),
        "arm" => Some(Architecture::Arm),
        "riscv64" => Some(Architecture::Riscv64),
        "powerpc64" => Some(Architecture::PowerPc64),
        "s390x" => Some(Architecture::S390x),
        _ => None,
    }
}

fn last_dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown dynamic loader error".to_string()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

/// File name of the object that defines `addr`, per dladdr.
fn symbol_provider(addr: *mut c_void) -> Option<String> {
    let mut info = std::mem::MaybeUninit::<libc::Dl_info>::zeroed();
    let rc = unsafe { libc::dladdr(addr as *const c_void, info.as_mut_ptr()) };
    if rc == 0 {
        return None;
    }
    let info = unsafe { info.assume_init() };
    if info.dli_fname.is_null() {
        return None;
    }
    Some(
        unsafe { CStr::from_ptr(info.dli_fname) }
            .to_string_lossy()
            .into_owned(),
    )
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Whether `addr` lies in an executable mapping of this process.
/// `None` when /proc/self/maps cannot be read or no mapping contains it.
pub(crate) fn mapping_is_executable(addr: usize) -> Option<bool> {
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
    find_mapping_perms(&maps, addr).map(|perms| perms.as_bytes().get(2) == Some(&b'x'))
}

fn find_mapping_perms(maps: &str, addr: usize) -> Option<&str> {
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?;
        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if (start..end).contains(&addr) {
            return Some(perms);
        }
    }
    None
}
