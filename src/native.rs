//! Runtime binding to an accelerated native journal engine.
//!
//! The engine is a shared library exporting a small C ABI (`mdc_*`). It is
//! bound with `libloading` once at startup; every symbol is resolved up front
//! and its ABI tag must equal [`NATIVE_ABI_VERSION`] or loading fails. There
//! is no silent fallback to the pure backend.
//!
//! Native writers pre-size a mapped file (`writer_capacity` bytes) and do not
//! assign sequence numbers; the sink numbers records itself so callers see
//! the same 1-based sequences as with the pure backend.
use crate::backend::{JournalBackend, JournalSink};
use crate::error::{JournalError, Result};
use crate::journal::RecordMeta;
use crate::record::{HEADER_SIZE, L2Payload, RECORD_SIZE, encode_into};
use libloading::{Library, Symbol};
use std::ffi::{CString, c_char, c_void};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// ABI tag the native library must report.
pub const NATIVE_ABI_VERSION: u32 = 0xDEAD_1701;
/// `mdc_seek` result meaning "no record at or after the timestamp".
pub const NATIVE_SEEK_NONE: u64 = u64::MAX;

type AbiVersionFn = unsafe extern "C" fn() -> u32;
type InitWriterFn = unsafe extern "C" fn(*const c_char, u64) -> *mut c_void;
type AppendFn = unsafe extern "C" fn(*mut c_void, u32, u64, u64, u16, *const u8, u32);
type CloseFn = unsafe extern "C" fn(*mut c_void);
type InitReplayFn = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type SeekFn = unsafe extern "C" fn(*mut c_void, u64) -> u64;

/// Fail unless `found` is the ABI tag this crate was built against.
pub fn check_abi(found: u32) -> Result<()> {
    if found != NATIVE_ABI_VERSION {
        return Err(JournalError::AbiMismatch {
            expected: NATIVE_ABI_VERSION,
            found,
        });
    }
    Ok(())
}

struct NativeApi {
    init_writer: InitWriterFn,
    append: AppendFn,
    close_writer: CloseFn,
    init_replay: InitReplayFn,
    seek: SeekFn,
    close_replay: CloseFn,
    // Keeps the function pointers above valid.
    _lib: Library,
}

unsafe fn symbol<T: Copy>(lib: &Library, name: &'static str) -> Result<T> {
    let sym: Symbol<T> = unsafe { lib.get(name.as_bytes()) }.map_err(|e| JournalError::NativeSymbol {
        name,
        message: e.to_string(),
    })?;
    Ok(*sym)
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.to_string_lossy().into_owned()).map_err(|e| {
        JournalError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        )
    })
}

/// Backend that forwards appends and seeks to the native engine.
pub struct NativeBackend {
    api: Arc<NativeApi>,
    library: PathBuf,
    writer_capacity: u64,
}

impl NativeBackend {
    /// Load `library`, resolve all `mdc_*` symbols and verify the ABI tag.
    pub fn load(library: impl AsRef<Path>, writer_capacity: u64) -> Result<Self> {
        let library = library.as_ref().to_path_buf();
        // SAFETY: loading runs the library's initializers; the library is
        // operator-supplied and trusted to implement the mdc ABI.
        let lib = unsafe { Library::new(&library) }.map_err(|e| JournalError::NativeLoad {
            path: library.clone(),
            message: e.to_string(),
        })?;
        // SAFETY: each symbol is typed with the signature the mdc ABI defines.
        let api = unsafe {
            let abi_version: AbiVersionFn = symbol(&lib, "mdc_abi_version")?;
            check_abi(abi_version())?;
            NativeApi {
                init_writer: symbol(&lib, "mdc_init_writer")?,
                append: symbol(&lib, "mdc_append")?,
                close_writer: symbol(&lib, "mdc_close_writer")?,
                init_replay: symbol(&lib, "mdc_init_replay")?,
                seek: symbol(&lib, "mdc_seek")?,
                close_replay: symbol(&lib, "mdc_close_replay")?,
                _lib: lib,
            }
        };
        info!(library = %library.display(), abi = NATIVE_ABI_VERSION, "native journal backend bound");
        Ok(Self {
            api: Arc::new(api),
            library,
            writer_capacity,
        })
    }

    pub fn library(&self) -> &Path {
        &self.library
    }
}

impl JournalBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn open_sink(&self, path: &Path) -> Result<Box<dyn JournalSink>> {
        let c = c_path(path)?;
        // SAFETY: `c` outlives the call; the engine copies the path.
        let handle = unsafe { (self.api.init_writer)(c.as_ptr(), self.writer_capacity) };
        if handle.is_null() {
            return Err(JournalError::NativeCall { op: "mdc_init_writer" });
        }
        Ok(Box::new(NativeSink {
            api: Arc::clone(&self.api),
            handle,
            path: path.to_path_buf(),
            sequence: 0,
            scratch: Box::new([0u8; RECORD_SIZE]),
        }))
    }

    fn seek(&self, path: &Path, target_ts: u64) -> Result<Option<u64>> {
        let c = c_path(path)?;
        // SAFETY: the replay handle is used only within this call and closed
        // before returning.
        unsafe {
            let handle = (self.api.init_replay)(c.as_ptr());
            if handle.is_null() {
                return Err(JournalError::NativeCall { op: "mdc_init_replay" });
            }
            let offset = (self.api.seek)(handle, target_ts);
            (self.api.close_replay)(handle);
            Ok((offset != NATIVE_SEEK_NONE).then_some(offset))
        }
    }
}

impl std::fmt::Debug for NativeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBackend")
            .field("library", &self.library)
            .field("writer_capacity", &self.writer_capacity)
            .finish()
    }
}

struct NativeSink {
    api: Arc<NativeApi>,
    handle: *mut c_void,
    path: PathBuf,
    sequence: u64,
    scratch: Box<[u8; RECORD_SIZE]>,
}

// SAFETY: the handle is owned exclusively by this sink and the engine's
// writer objects are not tied to the creating thread. The directory guards
// each sink with a mutex.
unsafe impl Send for NativeSink {}

impl JournalSink for NativeSink {
    fn append(&mut self, meta: &RecordMeta, payload: &L2Payload) -> Result<u64> {
        if self.handle.is_null() {
            return Err(JournalError::NativeCall { op: "mdc_append" });
        }
        self.sequence += 1;
        encode_into(&meta.header(self.sequence), payload, &mut self.scratch);
        let body = &self.scratch[HEADER_SIZE..];
        // SAFETY: `body` is valid for `body.len()` bytes for the whole call.
        unsafe {
            (self.api.append)(
                self.handle,
                meta.instrument_id,
                meta.exchange_ts,
                meta.receive_ts,
                meta.event_type,
                body.as_ptr(),
                body.len() as u32,
            );
        }
        Ok(self.sequence)
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn path(&self) -> &Path {
        &self.path
    }

    // The engine writes through its own mapping; there is nothing to flush
    // from this side.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl NativeSink {
    fn release(&mut self) {
        if !self.handle.is_null() {
            // SAFETY: handle came from `mdc_init_writer` and is closed once.
            unsafe { (self.api.close_writer)(self.handle) };
            self.handle = std::ptr::null_mut();
        }
    }
}

impl Drop for NativeSink {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            warn!(path = %self.path.display(), "native writer dropped without close");
            self.release();
        }
    }
}
