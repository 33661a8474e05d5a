//! Native symbol resolution
//!
//! Functions and variables named in metadata are found in explicitly
//! registered addresses first, then in opened libraries, then in the
//! process image.

use std::ffi::{c_void, CStr, CString};
use std::path::Path;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::LoadError;

/// Dynamic library handle
pub struct Library {
    handle: *mut c_void,
    path: String,
}

impl Library {
    /// Load a dynamic library from the given path.
    ///
    /// Uses `dlopen(RTLD_NOW | RTLD_GLOBAL)` so the library's symbols are
    /// visible to the process-wide lookup as well.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path_ref = path.as_ref();
        let path_str = path_ref
            .to_str()
            .ok_or_else(|| LoadError::InvalidPath(format!("{:?}", path_ref)))?;

        let c_path = CString::new(path_str)
            .map_err(|e| LoadError::PlatformError(format!("Invalid path: {}", e)))?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            return Err(LoadError::NotFound {
                path: format!("{}: {}", path_str, last_error()),
            });
        }

        log::debug!("opened library {}", path_str);
        Ok(Library {
            handle,
            path: path_str.to_string(),
        })
    }

    /// The running process image
    pub fn process() -> Result<Self, LoadError> {
        let handle = unsafe { libc::dlopen(std::ptr::null(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(LoadError::PlatformError(last_error()));
        }
        Ok(Library {
            handle,
            path: "<process>".to_string(),
        })
    }

    /// Address of `symbol`
    pub fn symbol(&self, symbol: &str) -> Result<*mut c_void, LoadError> {
        let c_name = CString::new(symbol)
            .map_err(|e| LoadError::PlatformError(format!("Invalid symbol name: {}", e)))?;

        let address = unsafe {
            // Clear any previous error
            libc::dlerror();
            libc::dlsym(self.handle, c_name.as_ptr())
        };
        if address.is_null() {
            return Err(LoadError::SymbolNotFound {
                symbol: symbol.to_string(),
                library: self.path.clone(),
            });
        }
        Ok(address)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

unsafe impl Send for Library {}
unsafe impl Sync for Library {}

fn last_error() -> String {
    unsafe {
        let err_ptr = libc::dlerror();
        if err_ptr.is_null() {
            "Unknown error".to_string()
        } else {
            CStr::from_ptr(err_ptr).to_string_lossy().into_owned()
        }
    }
}

/// Symbol lookup across registered addresses and libraries
#[derive(Default)]
pub struct SymbolResolver {
    overrides: RwLock<FxHashMap<String, usize>>,
    libraries: RwLock<Vec<Library>>,
    process: Option<Library>,
}

impl SymbolResolver {
    pub fn new() -> Self {
        let process = match Library::process() {
            Ok(library) => Some(library),
            Err(e) => {
                log::warn!("process image unavailable for symbol lookup: {}", e);
                None
            }
        };
        Self {
            process,
            ..Self::default()
        }
    }

    /// Make `name` resolve to `address`
    pub fn register(&self, name: impl Into<String>, address: *const c_void) {
        self.overrides.write().insert(name.into(), address as usize);
    }

    pub fn add_library(&self, library: Library) {
        self.libraries.write().push(library);
    }

    pub fn resolve(&self, name: &str) -> Result<*mut c_void, LoadError> {
        if let Some(&address) = self.overrides.read().get(name) {
            return Ok(address as *mut c_void);
        }
        for library in self.libraries.read().iter() {
            if let Ok(address) = library.symbol(name) {
                return Ok(address);
            }
        }
        if let Some(process) = &self.process {
            if let Ok(address) = process.symbol(name) {
                return Ok(address);
            }
        }
        log::debug!("unresolved symbol {}", name);
        Err(LoadError::SymbolNotFound {
            symbol: name.to_string(),
            library: "<process>".to_string(),
        })
    }
}

impl std::fmt::Debug for SymbolResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolResolver")
            .field("overrides", &self.overrides.read().len())
            .field("libraries", &self.libraries.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn answer() -> i32 {
        42
    }

    #[test]
    fn test_override_wins() {
        let resolver = SymbolResolver::new();
        resolver.register("answer", answer as *const c_void);
        assert_eq!(resolver.resolve("answer").unwrap() as usize, answer as usize);
    }

    #[test]
    fn test_process_lookup() {
        let resolver = SymbolResolver::new();
        assert!(resolver.resolve("malloc").is_ok());
        assert!(matches!(
            resolver.resolve("tether_no_such_symbol"),
            Err(LoadError::SymbolNotFound { .. })
        ));
    }

    #[test]
    fn test_added_library() {
        let resolver = SymbolResolver::new();
        resolver.add_library(Library::process().unwrap());
        assert!(resolver.resolve("strlen").is_ok());
    }

    #[test]
    fn test_missing_library() {
        assert!(matches!(
            Library::open("/nonexistent/libtether.so"),
            Err(LoadError::NotFound { .. })
        ));
    }
}
