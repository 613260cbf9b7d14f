//! Error descriptors with stable codes and cause chains.

use std::fmt;
use std::io;

use thiserror::Error;

/// Classifies an error with a stable integer code.
///
/// Codes are part of the client protocol and never change meaning
/// between releases.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorKind {
    /// Out of memory.
    #[error("out of memory")]
    NoMem = 1,
    /// Invalid argument or state.
    #[error("invalid")]
    Invalid = 2,
    /// A bounded resource is exhausted.
    #[error("no resource")]
    NoResource = 3,
    /// The object is closed or otherwise unavailable.
    #[error("busy")]
    Busy = 4,
    /// A size limit was exceeded.
    #[error("too big")]
    TooBig = 5,
    /// Acquiring a lock failed.
    #[error("cannot lock")]
    Lock = 6,
    /// Releasing a lock failed.
    #[error("cannot unlock")]
    Unlock = 7,
    /// End of data. Readers return this to terminate a scan.
    #[error("end of file")]
    Eof = 8,
    /// The operation is not supported.
    #[error("not supported")]
    NotSupp = 9,
    /// Memory-mapping a file failed.
    #[error("cannot map")]
    Map = 12,
    /// Unmapping a file failed.
    #[error("cannot unmap")]
    Unmap = 13,
    /// Reading from a file failed.
    #[error("cannot read")]
    Read = 14,
    /// Writing to a file failed.
    #[error("cannot write")]
    Write = 15,
    /// Opening a file failed.
    #[error("cannot open")]
    Open = 16,
    /// Closing a file failed.
    #[error("cannot close")]
    Close = 17,
    /// Removing a file failed.
    #[error("cannot remove")]
    Remove = 18,
    /// Seeking in a file failed.
    #[error("cannot seek")]
    Seek = 19,
    /// Internal invariant violated; the store goes read-only.
    #[error("panic")]
    Panic = 20,
    /// The catalog is corrupt or cannot be written.
    #[error("catalog error")]
    Catalog = 21,
    /// Time conversion failed.
    #[error("time error")]
    Time = 22,
    /// No scope with that name.
    #[error("no such scope")]
    NoSuchScope = 23,
    /// No context with that name.
    #[error("no such context")]
    NoSuchContext = 24,
    /// No index with that name.
    #[error("no such index")]
    NoSuchIndex = 25,
    /// A key lookup found nothing.
    #[error("key not found")]
    KeyNotFound = 26,
    /// A unique key already exists.
    #[error("duplicate key")]
    DupKey = 27,
    /// A unique name already exists.
    #[error("duplicate name")]
    DupName = 28,
    /// A generated key collided.
    #[error("collision")]
    Collision = 29,
    /// Synchronizing a file to disk failed.
    #[error("cannot sync")]
    Sync = 30,
    /// Spawning or joining a thread failed.
    #[error("thread error")]
    Thread = 31,
    /// Sleeping was interrupted.
    #[error("cannot sleep")]
    Sleep = 32,
    /// A queue operation failed.
    #[error("queue error")]
    Queue = 33,
    /// Enqueueing a message failed.
    #[error("cannot enqueue")]
    Enqueue = 34,
    /// A worker failed.
    #[error("worker error")]
    Worker = 35,
    /// A timed wait expired.
    #[error("timeout")]
    Timeout = 36,
    /// Reserving space failed.
    #[error("cannot reserve")]
    Reserve = 37,
    /// A block does not obey the page layout.
    #[error("bad block")]
    BadBlock = 38,
    /// A file size is not a multiple of the record size.
    #[error("bad filesize")]
    BadFilesize = 39,
    /// Too many files in a store.
    #[error("too many files")]
    MaxFiles = 40,
    /// Renaming or moving a file failed.
    #[error("cannot move")]
    Move = 41,
    /// The index rejected an operation.
    #[error("index error")]
    Index = 42,
    /// An on-disk version is not understood.
    #[error("version mismatch")]
    Version = 43,
    /// Compression failed.
    #[error("cannot compress")]
    Comp = 44,
    /// Decompression failed.
    #[error("cannot decompress")]
    Decomp = 45,
    /// The compression dictionary is unusable.
    #[error("bad compression dictionary")]
    CompDict = 46,
    /// The store rejected an operation.
    #[error("store error")]
    Store = 47,
    /// The context rejected an operation.
    #[error("context error")]
    Context = 48,
    /// The scope rejected an operation.
    #[error("scope error")]
    Scope = 49,
    /// Stat'ing a file failed.
    #[error("cannot stat")]
    Stat = 50,
    /// Creating an object failed.
    #[error("cannot create")]
    Create = 51,
    /// Dropping an object failed.
    #[error("cannot drop")]
    Drop = 52,
    /// A magic number did not match; the store goes read-only.
    #[error("bad magic")]
    Magic = 53,
    /// Truncating a file failed.
    #[error("cannot truncate")]
    Trunc = 55,
    /// Flushing buffered data failed.
    #[error("cannot flush")]
    Flush = 56,
    /// An aggregate function failed.
    #[error("function error")]
    Fun = 58,
    /// An object lookup found nothing.
    #[error("not found")]
    NotFound = 59,
    /// The SQL parser rejected the input.
    #[error("parser error")]
    Parser = 60,
    /// A streaming frame violated the protocol.
    #[error("protocol error")]
    Protocol = 64,
    /// Unclassified.
    #[error("unknown error")]
    Unknown = 9999,
}

impl ErrorKind {
    /// The stable wire code of this kind.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Kinds that leave the store read-only pending manual recovery.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::Panic | ErrorKind::Magic | ErrorKind::BadBlock | ErrorKind::BadFilesize
        )
    }
}

/// An error descriptor: kind, optional OS errno, the reporting object,
/// free-form detail and an optional cause chain.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    oserr: Option<i32>,
    object: String,
    info: String,
    cause: Option<Box<Error>>,
}

impl Error {
    /// Creates a descriptor without an OS error code.
    pub fn new(kind: ErrorKind, object: &str, info: impl Into<String>) -> Self {
        Error {
            kind,
            oserr: None,
            object: object.to_owned(),
            info: info.into(),
            cause: None,
        }
    }

    /// Creates a descriptor carrying the errno of an `io::Error`.
    pub fn with_io(kind: ErrorKind, object: &str, info: impl Into<String>, io: io::Error) -> Self {
        Error {
            kind,
            oserr: io.raw_os_error(),
            object: object.to_owned(),
            info: info.into(),
            cause: None,
        }
    }

    /// Chains `cause` below this error and returns the combined descriptor.
    pub fn cascade(mut self, cause: Error) -> Self {
        let mut last = &mut self;
        while last.cause.is_some() {
            last = last.cause.as_deref_mut().expect("checked above");
        }
        last.cause = Some(Box::new(cause));
        self
    }

    /// The kind of the top-level descriptor.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The stable wire code of the top-level descriptor.
    pub fn code(&self) -> u16 {
        self.kind.code()
    }

    /// The OS errno, if one was captured.
    pub fn oserr(&self) -> Option<i32> {
        self.oserr
    }

    /// The object that reported the error.
    pub fn object(&self) -> &str {
        &self.object
    }

    /// Walks the cause chain looking for `kind`.
    pub fn contains(&self, kind: ErrorKind) -> bool {
        let mut cur = Some(self);
        while let Some(e) = cur {
            if e.kind == kind {
                return true;
            }
            cur = e.cause.as_deref();
        }
        false
    }

    /// True if this error or any cause is fatal for the store.
    pub fn is_fatal(&self) -> bool {
        let mut cur = Some(self);
        while let Some(e) = cur {
            if e.kind.is_fatal() {
                return true;
            }
            cur = e.cause.as_deref();
        }
        false
    }
}

/// Renders one line per chain level, newest first.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut cur = Some(self);
        let mut first = true;
        while let Some(e) = cur {
            if !first {
                writeln!(f)?;
            }
            write!(f, "[{:04}] {}: {}", e.kind.code(), e.object, e.kind)?;
            if let Some(os) = e.oserr {
                write!(f, " (errno {os})")?;
            }
            if !e.info.is_empty() {
                write!(f, " - {}", e.info)?;
            }
            first = false;
            cur = e.cause.as_deref();
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Result type alias for nowdb operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorKind::NoMem.code(), 1);
        assert_eq!(ErrorKind::Eof.code(), 8);
        assert_eq!(ErrorKind::Timeout.code(), 36);
        assert_eq!(ErrorKind::Parser.code(), 60);
        assert_eq!(ErrorKind::Protocol.code(), 64);
    }

    #[test]
    fn cascade_and_contains() {
        let inner = Error::new(ErrorKind::Open, "file", "data file 7");
        let outer = Error::new(ErrorKind::Store, "store", "insert").cascade(inner);
        assert_eq!(outer.kind(), ErrorKind::Store);
        assert!(outer.contains(ErrorKind::Open));
        assert!(!outer.contains(ErrorKind::Eof));
    }

    #[test]
    fn renders_newest_first() {
        let e = Error::new(ErrorKind::Catalog, "catalog", "flush")
            .cascade(Error::new(ErrorKind::Write, "file", "tmp catalog"));
        let s = e.to_string();
        let mut lines = s.lines();
        assert!(lines.next().unwrap().contains("catalog"));
        assert!(lines.next().unwrap().contains("cannot write"));
    }

    #[test]
    fn fatal_kinds() {
        assert!(Error::new(ErrorKind::Magic, "file", "").is_fatal());
        assert!(!Error::new(ErrorKind::Eof, "reader", "").is_fatal());
    }
}
