//! Error types for the FerriteOS kernel
//!
//! One central `KernelError` enum carries structured context for every
//! kernel-internal failure, with subsystem-specific enums for the pipe and
//! filesystem families whose numeric codes are part of the user-visible
//! contract. Errors are surfaced to the caller; nothing is retried inside
//! the kernel.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical frame allocator is exhausted
    OutOfMemory {
        requested: usize,
        available: usize,
    },
    /// Address is not page-aligned where alignment is required
    MisalignedAddress {
        addr: u64,
    },
    /// Frame freed twice
    DoubleFree {
        addr: u64,
    },
    /// Virtual page already has a mapping
    AlreadyMapped {
        addr: u64,
    },
    /// No mapping exists for the address
    UnmappedMemory {
        addr: u64,
    },
    /// Address is outside the range valid for the operation
    InvalidAddress {
        addr: u64,
    },

    /// Process-related errors
    ProcessNotFound {
        pid: u64,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    PermissionDenied {
        operation: &'static str,
    },
    NotInitialized {
        subsystem: &'static str,
    },

    /// A blocking operation was interrupted by a signal
    Interrupted,

    /// Filesystem errors (user-visible codes, see [`FsError::code`])
    Fs(FsError),

    /// Pipe errors (user-visible codes, see [`PipeError::code`])
    Pipe(PipeError),
}

/// Filesystem-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File or directory not found
    NotFound,
    /// No volume is mounted
    NotMounted,
    /// I/O error from the block device
    IoError,
    /// Invalid path format
    InvalidPath,
    /// Target is not a directory
    NotADirectory,
    /// Target is a directory (when a file was expected)
    IsADirectory,
    /// Directory is not empty
    DirectoryNotEmpty,
    /// Path already exists
    AlreadyExists,
    /// Volume is full (no free cluster)
    VolumeFull,
    /// Open file table or descriptor table is full
    TooManyOpenFiles,
    /// Invalid file descriptor
    BadFileDescriptor,
    /// Boot sector or directory entry failed validation
    InvalidFormat,
}

impl FsError {
    /// User-visible error code: `FS_ERROR = -1`, `FS_NOT_FOUND = -2`,
    /// `FS_NOT_MOUNTED = -3`.
    pub fn code(&self) -> isize {
        match self {
            FsError::NotFound => -2,
            FsError::NotMounted => -3,
            _ => -1,
        }
    }
}

/// Pipe-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeError {
    /// Ring buffer is full (non-blocking write)
    Full,
    /// Ring buffer is empty (non-blocking read)
    Empty,
    /// Slot is gone, the descriptor lacks the required mode, or the peer
    /// end has been closed
    Closed,
}

impl PipeError {
    /// User-visible error code: `PIPE_ERROR_FULL = -1`,
    /// `PIPE_ERROR_EMPTY = -2`, `PIPE_ERROR_CLOSED = -3`.
    pub fn code(&self) -> isize {
        match self {
            PipeError::Full => -1,
            PipeError::Empty => -2,
            PipeError::Closed => -3,
        }
    }
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of memory: requested {} bytes, {} available",
                requested, available
            ),
            Self::MisalignedAddress { addr } => {
                write!(f, "misaligned address: {:#x}", addr)
            }
            Self::DoubleFree { addr } => write!(f, "double free of frame {:#x}", addr),
            Self::AlreadyMapped { addr } => write!(f, "page {:#x} is already mapped", addr),
            Self::UnmappedMemory { addr } => write!(f, "no mapping for {:#x}", addr),
            Self::InvalidAddress { addr } => write!(f, "invalid address: {:#x}", addr),
            Self::ProcessNotFound { pid } => write!(f, "process {} not found", pid),
            Self::InvalidState { expected, actual } => {
                write!(f, "invalid state: expected {}, got {}", expected, actual)
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {}", name, value)
            }
            Self::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {}", resource)
            }
            Self::PermissionDenied { operation } => {
                write!(f, "permission denied: {}", operation)
            }
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::Interrupted => write!(f, "interrupted by signal"),
            Self::Fs(e) => write!(f, "filesystem error: {:?}", e),
            Self::Pipe(e) => write!(f, "pipe error: {:?}", e),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

impl From<PipeError> for KernelError {
    fn from(err: PipeError) -> Self {
        Self::Pipe(err)
    }
}

impl KernelError {
    /// Map a kernel error to the POSIX-like negative return value user
    /// mode sees. The pipe and filesystem families keep their specific
    /// sentinel codes; everything else collapses to -1.
    pub fn code(&self) -> isize {
        match self {
            Self::Fs(e) => e.code(),
            Self::Pipe(e) => e.code(),
            _ => -1,
        }
    }
}
