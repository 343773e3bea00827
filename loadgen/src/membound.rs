//! Memory-bound pointer-chase traversal
//!
//! The data file starts with a header of `W` native-endian 32-bit integers,
//! where `W` is the host cache line size in bytes divided by 4. It is followed
//! by a row-major array of 32-bit node indices whose row stride is `W`, so
//! that each row fills exactly one cache line. Header entry `g` gives the size
//! in bytes of the array region that "graph index" `g` traverses, and column
//! `g` of the array holds the successor of every node of that graph.
//!
//! The structure of the graphs, and therefore the cache and TLB behavior of
//! the traversal, is entirely determined by the data file.

use std::{
    fs::{self, File},
    io::{self, Read},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    ptr::NonNull,
    slice,
};
use thiserror::Error;

/// Location where Linux exposes the L1 cache line size
pub const CACHE_LINE_SIZE_PATH: &str =
    "/sys/devices/system/cpu/cpu0/cache/index0/coherency_line_size";

/// Size of a data file word in bytes
const WORD_SIZE: usize = std::mem::size_of::<u32>();

/// Number of 32-bit words in a cache line of this host
pub fn words_per_cache_line() -> Result<usize, MemboundError> {
    let raw = fs::read_to_string(CACHE_LINE_SIZE_PATH).map_err(MemboundError::CacheLineQuery)?;
    let raw = raw.trim();
    match raw.parse::<usize>() {
        Ok(bytes) if bytes >= WORD_SIZE => Ok(bytes / WORD_SIZE),
        _ => Err(MemboundError::BadCacheLineSize(raw.into())),
    }
}

/// Follow successor links through column `column` of a row-major array
///
/// Starting from node 1, this performs `iterations` steps of
/// `node = array[stride * node + column]` and returns the final node.
///
/// # Panics
///
/// If a successor link points outside of `array`. The traversal trusts its
/// input, so this is a precondition violation rather than a runtime error.
#[inline]
pub fn chase(array: &[u32], stride: usize, column: usize, iterations: u64) -> u32 {
    let mut node = 1u32;
    for _ in 0..iterations {
        node = array[stride * node as usize + column];
    }
    node
}

/// Pointer-chase traversal over a page-locked mapping of a data file
#[derive(Debug)]
pub struct PointerChase {
    /// Mapping of the header and array region, unmapped before the file closes
    region: MappedRegion,

    /// Data file backing the mapping
    _file: File,

    /// Row stride of the array, also the header length, in words
    stride: usize,

    /// Array column (and header entry) used by this traversal
    graph_index: usize,

    /// Number of successor links followed by each traversal
    iterations: u64,
}
//
impl PointerChase {
    /// Map a data file for traversal, using the host cache line size as stride
    pub fn open(
        path: impl AsRef<Path>,
        graph_index: usize,
        iterations: u64,
    ) -> Result<Self, MemboundError> {
        Self::open_with_stride(path, words_per_cache_line()?, graph_index, iterations)
    }

    /// Map a data file for traversal, with an explicit header length/stride
    pub fn open_with_stride(
        path: impl AsRef<Path>,
        stride: usize,
        graph_index: usize,
        iterations: u64,
    ) -> Result<Self, MemboundError> {
        if graph_index >= stride {
            return Err(MemboundError::GraphIndexOutOfRange {
                graph_index,
                stride,
            });
        }

        // Open the data file and read its header
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|source| MemboundError::Open {
            path: path.to_owned(),
            source,
        })?;
        let header_size = stride * WORD_SIZE;
        let mut header = vec![0u8; header_size];
        file.read_exact(&mut header).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => MemboundError::TruncatedHeader {
                expected: header_size,
            },
            _ => MemboundError::Io(e),
        })?;

        // Look up the size of the region associated with our graph index
        let mut entry = [0u8; WORD_SIZE];
        entry.copy_from_slice(&header[graph_index * WORD_SIZE..][..WORD_SIZE]);
        let raw_size = i32::from_ne_bytes(entry);
        let region_size = usize::try_from(raw_size)
            .ok()
            .filter(|&size| size > 0)
            .ok_or(MemboundError::InvalidRegionSize {
                graph_index,
                size: raw_size,
            })?;

        // Make sure the region does not extend past the end of the file,
        // accessing such a mapping would kill the process with SIGBUS
        let file_len = file.metadata()?.len();
        let mapped_len = header_size + region_size;
        if mapped_len as u64 > file_len {
            return Err(MemboundError::RegionBeyondEof {
                graph_index,
                region_size,
                file_len,
            });
        }

        // Map the header and region, populated and locked in RAM. Mappings
        // must start at a page boundary, so the header is mapped as well and
        // skipped when accessing the array.
        let region = MappedRegion::map(&file, mapped_len).map_err(MemboundError::Map)?;
        log::debug!(
            "Mapped {region_size} bytes of {} for graph index {graph_index}",
            path.display()
        );
        Ok(Self {
            region,
            _file: file,
            stride,
            graph_index,
            iterations,
        })
    }

    /// Run one traversal, returning the node where it ended
    pub fn run(&self) -> u32 {
        chase(self.array(), self.stride, self.graph_index, self.iterations)
    }

    /// Node array, as a flat sequence of rows of `stride()` words
    pub fn array(&self) -> &[u32] {
        let words = self.region.len / WORD_SIZE;
        let header_words = self.stride;
        // SAFETY: The mapping is page-aligned, so the word right after the
        //         header is suitably aligned for u32, and it contains at least
        //         header_words words by construction. It is read-only and
        //         lives as long as self.
        unsafe {
            slice::from_raw_parts(
                self.region.ptr.as_ptr().cast::<u32>().add(header_words),
                words - header_words,
            )
        }
    }

    /// Row stride of the array in words
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Array column used by this traversal
    pub fn graph_index(&self) -> usize {
        self.graph_index
    }

    /// Number of successor links followed by each traversal
    pub fn iterations(&self) -> u64 {
        self.iterations
    }
}

/// Read-only, populated and page-locked mapping of the start of a file
#[derive(Debug)]
struct MappedRegion {
    /// Start of the mapping
    ptr: NonNull<u8>,

    /// Length of the mapping in bytes
    len: usize,
}
//
impl MappedRegion {
    /// Map the first `len` bytes of `file`
    fn map(file: &File, len: usize) -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        let flags = libc::MAP_PRIVATE | libc::MAP_POPULATE | libc::MAP_LOCKED;
        #[cfg(not(target_os = "linux"))]
        let flags = libc::MAP_PRIVATE;

        // SAFETY: The kernel picks the address, so no existing Rust memory is
        //         affected, and the result is checked before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                flags,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let Some(ptr) = NonNull::new(ptr.cast::<u8>()) else {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "mmap returned a null mapping",
            ));
        };
        Ok(Self { ptr, len })
    }
}
//
impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and len come from a successful mmap that is unmapped
        //         exactly once, here.
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if ret == -1 {
            log::error!(
                "Failed to unmap pointer-chase region ({})",
                io::Error::last_os_error()
            );
        }
    }
}

/// Failure to set up a pointer-chase traversal
#[derive(Debug, Error)]
pub enum MemboundError {
    /// Cache line size could not be queried
    #[error("failed to query the cache line size ({0})")]
    CacheLineQuery(#[source] io::Error),

    /// Cache line size query returned nonsense
    #[error("unexpected cache line size {0:?}")]
    BadCacheLineSize(Box<str>),

    /// Graph index does not match any header entry
    #[error("graph index {graph_index} is out of range (header has {stride} entries)")]
    GraphIndexOutOfRange {
        /// Requested graph index
        graph_index: usize,

        /// Number of header entries
        stride: usize,
    },

    /// Data file could not be opened
    #[error("failed to open data file {} ({source})", path.display())]
    Open {
        /// Location of the data file
        path: PathBuf,

        /// Underlying I/O error
        source: io::Error,
    },

    /// Data file is too short to contain a header
    #[error("data file is shorter than its {expected}-byte header")]
    TruncatedHeader {
        /// Expected header size in bytes
        expected: usize,
    },

    /// Other I/O error while reading the data file
    #[error("failed to read data file ({0})")]
    Io(#[from] io::Error),

    /// Header entry for the graph index is not a positive size
    #[error("header entry {graph_index} holds invalid region size {size}")]
    InvalidRegionSize {
        /// Requested graph index
        graph_index: usize,

        /// Raw header entry
        size: i32,
    },

    /// Header entry for the graph index points past the end of the file
    #[error("{region_size}-byte region of graph index {graph_index} extends past the end of the {file_len}-byte data file")]
    RegionBeyondEof {
        /// Requested graph index
        graph_index: usize,

        /// Region size from the header
        region_size: usize,

        /// Size of the data file
        file_len: u64,
    },

    /// Memory mapping failed
    #[error("failed to map the data file ({0})")]
    Map(#[source] io::Error),
}
