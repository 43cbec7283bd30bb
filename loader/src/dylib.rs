//! Dynamic Library Snapshots
//!
//! Thin wrapper over the OS dynamic loader for snapshots shipped as
//! ordinary shared libraries. The handle owns the `dlopen` result and
//! closes it on drop; resolved symbol addresses are only valid while the
//! handle lives.

use std::ffi::{CStr, CString};
use std::path::Path;

use crate::error::Error;

#[derive(Debug)]
pub struct DynamicLibrary {
    handle: *mut libc::c_void,
}

// The handle is only ever used for dlsym/dlclose, both thread-safe.
unsafe impl Send for DynamicLibrary {}

impl DynamicLibrary {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let c_path = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| Error::Library("path contains a NUL byte".into()))?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_LAZY | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(Error::Library(last_dl_error()));
        }
        Ok(DynamicLibrary { handle })
    }

    /// Look up `name`; `None` when the library does not export it.
    pub fn lookup(&self, name: &str) -> Option<*const u8> {
        let c_name = CString::new(name).ok()?;
        let address = unsafe { libc::dlsym(self.handle, c_name.as_ptr()) };
        if address.is_null() {
            None
        } else {
            Some(address as *const u8)
        }
    }
}

impl Drop for DynamicLibrary {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

fn last_dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        "unknown dynamic loader error".into()
    } else {
        unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonexistent_library_reports_loader_error() {
        let err = DynamicLibrary::open(Path::new("/definitely/not/a/library.so")).unwrap_err();
        assert!(matches!(err, Error::Library(_)));
    }

    #[test]
    fn missing_symbol_is_none() {
        // libc is always loadable and will not export this name.
        let lib = DynamicLibrary::open(Path::new("libc.so.6"));
        if let Ok(lib) = lib {
            assert!(lib.lookup("kDefinitelyNotASnapshotSymbol").is_none());
        }
    }
}
