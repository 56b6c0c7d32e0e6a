use std::fmt;

/// Engine-internal status codes.
///
/// These mirror the codes a front-end translates to HTTP responses. They
/// fall into the categories documented on [`HfsError`]: bad input, conflict,
/// transient, not-found, internal, and capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    /// Requested object does not exist.
    ENoEnt,
    /// Object already exists.
    EExist,
    /// Caller-supplied argument is invalid; never retried.
    EInval,
    /// Mismatch between expected and actual state (e.g. CAS guard failed).
    EFault,
    /// Caller may retry the same operation with the same arguments.
    EAgain,
    /// Caller is not permitted to perform the operation.
    EPerm,
    /// A size limit (name, metadata item, block) was exceeded.
    EMsgSize,
    /// No space left to admit the write.
    ENoSpc,
    /// Directory-like listing is not empty.
    ENotEmpty,
    /// A counter or length calculation overflowed.
    EOverflow,
    /// A syscall was interrupted; the caller should retry the syscall.
    EIntr,
    /// Allocation failed.
    ENoMem,
    /// The engine is in an unexpected state; transactions are rolled back.
    FailEInternal,
    /// Engine initialization failed (e.g. data file header mismatch).
    FailEInit,
    /// A global or per-resource lock is held by someone else.
    FailLocked,
    /// A cardinality limit (e.g. MAX_PENDING_JOBS) was exceeded.
    FailETooMany,
    /// Block size does not match one of the configured size classes.
    FailBadBlockSize,
    /// Volume with this name already exists.
    FailVolumeEExist,
    /// An iterator has no more items; distinct from `ENoEnt`.
    IterNoMore,
}

impl Code {
    /// Category used to decide retry/propagation behavior.
    pub fn category(self) -> Category {
        use Code::*;
        match self {
            EInval | EMsgSize => Category::BadInput,
            EExist | FailLocked | FailVolumeEExist => Category::Conflict,
            EAgain => Category::Transient,
            ENoEnt | IterNoMore => Category::NotFound,
            FailEInternal | FailEInit => Category::Internal,
            ENoSpc | FailETooMany => Category::Capacity,
            EFault | EPerm | ENotEmpty | EOverflow | EIntr | ENoMem | FailBadBlockSize => {
                Category::BadInput
            }
        }
    }
}

/// The six propagation categories from the error-handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    BadInput,
    Conflict,
    Transient,
    NotFound,
    Internal,
    Capacity,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Code::ENoEnt => "ENOENT",
            Code::EExist => "EEXIST",
            Code::EInval => "EINVAL",
            Code::EFault => "EFAULT",
            Code::EAgain => "EAGAIN",
            Code::EPerm => "EPERM",
            Code::EMsgSize => "EMSGSIZE",
            Code::ENoSpc => "ENOSPC",
            Code::ENotEmpty => "ENOTEMPTY",
            Code::EOverflow => "EOVERFLOW",
            Code::EIntr => "EINTR",
            Code::ENoMem => "ENOMEM",
            Code::FailEInternal => "FAIL_EINTERNAL",
            Code::FailEInit => "FAIL_EINIT",
            Code::FailLocked => "FAIL_LOCKED",
            Code::FailETooMany => "FAIL_ETOOMANY",
            Code::FailBadBlockSize => "FAIL_BADBLOCKSIZE",
            Code::FailVolumeEExist => "FAIL_VOLUME_EEXIST",
            Code::IterNoMore => "ITER_NO_MORE",
        };
        f.write_str(s)
    }
}

/// An engine error: a status code plus the human reason that used to live in
/// the thread-local "last error message" slot. Every function that can fail
/// returns this explicitly; there is no hidden control-flow escape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HfsError {
    pub code: Code,
    pub reason: String,
}

impl HfsError {
    pub fn new(code: Code, reason: impl Into<String>) -> Self {
        HfsError {
            code,
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> Category {
        self.code.category()
    }

    /// True if the caller may retry the exact same call.
    pub fn is_transient(&self) -> bool {
        self.category() == Category::Transient
    }
}

impl fmt::Display for HfsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.reason)
    }
}

impl std::error::Error for HfsError {}

pub type Result<T> = std::result::Result<T, HfsError>;

/// Shorthand constructors, one per code, for the call sites that raise them
/// most often.
macro_rules! code_ctor {
    ($name:ident, $code:ident) => {
        pub fn $name(reason: impl Into<String>) -> HfsError {
            HfsError::new(Code::$code, reason)
        }
    };
}

code_ctor!(enoent, ENoEnt);
code_ctor!(eexist, EExist);
code_ctor!(einval, EInval);
code_ctor!(efault, EFault);
code_ctor!(eagain, EAgain);
code_ctor!(eperm, EPerm);
code_ctor!(emsgsize, EMsgSize);
code_ctor!(enospc, ENoSpc);
code_ctor!(fail_einternal, FailEInternal);
code_ctor!(fail_einit, FailEInit);
code_ctor!(fail_locked, FailLocked);
code_ctor!(fail_etoomany, FailETooMany);
code_ctor!(fail_badblocksize, FailBadBlockSize);
code_ctor!(fail_volume_eexist, FailVolumeEExist);
code_ctor!(iter_no_more, IterNoMore);

impl From<rusqlite::Error> for HfsError {
    fn from(e: rusqlite::Error) -> Self {
        // SQLITE_BUSY surfaces as a transient condition the caller may retry;
        // everything else from the embedded engine is internal.
        if matches!(
            &e,
            rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::DatabaseBusy
        ) {
            eagain(format!("database busy: {e}"))
        } else {
            fail_einternal(format!("sqlite: {e}"))
        }
    }
}

impl From<std::io::Error> for HfsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => enoent(e.to_string()),
            std::io::ErrorKind::Interrupted => HfsError::new(Code::EIntr, e.to_string()),
            _ => fail_einternal(e.to_string()),
        }
    }
}
