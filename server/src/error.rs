// SPDX-License-Identifier: MPL-2.0

#![allow(dead_code)]

/// Error number.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Errno {
    EPERM = 1,      /* Operation not permitted */
    ENOENT = 2,     /* No such file or directory */
    EINTR = 4,      /* Interrupted system call */
    EIO = 5,        /* I/O error */
    EAGAIN = 11,    /* Try again */
    ENOMEM = 12,    /* Out of memory */
    EFAULT = 14,    /* Bad address */
    EBUSY = 16,     /* Device or resource busy */
    EEXIST = 17,    /* File exists */
    ENOTDIR = 20,   /* Not a directory */
    EISDIR = 21,    /* Is a directory */
    EINVAL = 22,    /* Invalid argument */
    ENOSPC = 28,    /* No space left on device */
    ENAMETOOLONG = 36, /* File name too long */
    ENOLCK = 37,    /* No record locks available */
    ENOTEMPTY = 39, /* Directory not empty */
    EOVERFLOW = 75, /* Value too large for defined data type */
    EMSGSIZE = 90,  /* Message too long */
    ECONNRESET = 104, /* Connection reset by peer */
    ETIMEDOUT = 110, /* Connection timed out */
    ECONNREFUSED = 111, /* Connection refused */
    EINPROGRESS = 115, /* Operation now in progress */
}

impl Errno {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Maps a raw wire errno back to the enum; unknown values fold to `EIO`.
    pub fn from_wire(value: u16) -> Errno {
        match value as i32 {
            1 => Errno::EPERM,
            2 => Errno::ENOENT,
            4 => Errno::EINTR,
            5 => Errno::EIO,
            11 => Errno::EAGAIN,
            12 => Errno::ENOMEM,
            14 => Errno::EFAULT,
            16 => Errno::EBUSY,
            17 => Errno::EEXIST,
            20 => Errno::ENOTDIR,
            21 => Errno::EISDIR,
            22 => Errno::EINVAL,
            28 => Errno::ENOSPC,
            36 => Errno::ENAMETOOLONG,
            37 => Errno::ENOLCK,
            39 => Errno::ENOTEMPTY,
            75 => Errno::EOVERFLOW,
            90 => Errno::EMSGSIZE,
            104 => Errno::ECONNRESET,
            110 => Errno::ETIMEDOUT,
            111 => Errno::ECONNREFUSED,
            115 => Errno::EINPROGRESS,
            _ => Errno::EIO,
        }
    }
}

/// Error used in this crate.
///
/// Carries the errno that ends up in the wire header `status` field plus an
/// optional short diagnostic that handlers ship as the reply body.
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

    /// The non-negative form carried in the reply header.
    pub const fn wire_status(&self) -> u16 {
        self.errno as u16
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl From<std::io::Error> for Error {
    fn from(io_error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match io_error.kind() {
            ErrorKind::NotFound => Error::new(Errno::ENOENT),
            ErrorKind::WouldBlock => Error::new(Errno::EAGAIN),
            ErrorKind::TimedOut => Error::new(Errno::ETIMEDOUT),
            ErrorKind::ConnectionRefused => Error::new(Errno::ECONNREFUSED),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Error::new(Errno::ECONNRESET),
            ErrorKind::AlreadyExists => Error::new(Errno::EEXIST),
            ErrorKind::InvalidInput | ErrorKind::InvalidData => Error::new(Errno::EINVAL),
            _ => Error::new(Errno::EIO),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::with_message(Errno::EINVAL, "Invalid utf-8 string")
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(_: std::num::ParseIntError) -> Self {
        Error::with_message(Errno::EINVAL, "Invalid integer token")
    }
}

impl From<int_to_c_enum::TryFromIntError> for Error {
    fn from(_: int_to_c_enum::TryFromIntError) -> Self {
        Error::with_message(Errno::EINVAL, "Invalid enum value")
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
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
