// SPDX-License-Identifier: MPL-2.0

//! The prelude shared by every module of the server.

#![allow(unused_imports)]

pub(crate) use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
    Arc, Condvar, Mutex, RwLock, Weak,
};

pub(crate) use log::{debug, error, info, warn};

pub(crate) use crate::error::{Errno, Error};
pub(crate) use crate::{return_errno, return_errno_with_message};

pub type Result<T> = core::result::Result<T, Error>;
