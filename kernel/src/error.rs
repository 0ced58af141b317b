// SPDX-License-Identifier: MPL-2.0

#![allow(dead_code)]

/// Error number.
///
/// The discriminants follow the C convention so that the syscall layer can
/// hand them to user space unchanged.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Errno {
    EPERM = 1,   /* Operation not permitted */
    ESRCH = 3,   /* No such thread or process */
    EIO = 5,     /* I/O error */
    EAGAIN = 11, /* Try again */
    ENOMEM = 12, /* Out of memory */
    EACCES = 13, /* Permission denied */
    EFAULT = 14, /* Bad address */
    EBUSY = 16,  /* Resource busy */
    EEXIST = 17, /* Already exists */
    EINVAL = 22, /* Invalid argument */
    ENFILE = 23, /* File table overflow */
    EMFILE = 24, /* Too many open files */
    EDEADLK = 35, /* Resource deadlock would occur */
    ENOSYS = 38, /* Invalid system call number */
    ENOTEMPTY = 39, /* Not empty */
    ERANGE = 34, /* Result not representable */
    ETIMEDOUT = 110, /* Deadline expired */
}

/// The error type returned by the core's fallible operations.
#[derive(Debug, Clone, Copy)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    pub const fn with_message(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    pub const fn error(&self) -> Errno {
        self.errno
    }

    pub const fn message(&self) -> Option<&'static str> {
        self.msg
    }

    /// The value placed in the syscall error out-parameter.
    pub const fn as_neg_return(&self) -> i64 {
        -(self.errno as i64)
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return Err($crate::error::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_message {
    ($errno: expr, $message: expr) => {
        return Err($crate::error::Error::with_message($errno, $message))
    };
}
