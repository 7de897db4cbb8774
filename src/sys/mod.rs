//! The kernel acceptor seam.
//!
//! Loading and attaching go through the [`Kernel`] trait so the rest of the
//! crate never talks to an operating system directly. The in-process
//! implementation lives in [`sim`]; a syscall-backed implementation would
//! plug in at the same seam.

pub mod sim;

use std::io;

use thiserror::Error;

use crate::programs::tc::TcAttachType;

pub use sim::{SimKernel, Verifier};

/// A kernel-assigned program identifier. Stands in for a program slot
/// held by the kernel until the program is unloaded.
pub type RawProgId = u32;

pub(crate) type SysResult<T> = Result<T, SysError>;

/// An error reported by the kernel acceptor.
#[derive(Debug, Error)]
pub enum SysError {
    /// A kernel call failed.
    #[error("`{call}` failed")]
    Syscall {
        /// The name of the failed call.
        call: &'static str,
        /// The underlying [`io::Error`].
        #[source]
        io_error: io::Error,
    },

    /// The verifier rejected the program.
    #[error("the verifier rejected the program: {verifier_log}")]
    VerifierRejected {
        /// The verifier's reason, carried verbatim.
        verifier_log: String,
    },
}

impl SysError {
    pub(crate) fn from_raw(call: &'static str, errno: i32) -> SysError {
        SysError::Syscall {
            call,
            io_error: io::Error::from_raw_os_error(errno),
        }
    }

    pub(crate) fn raw_os_error(&self) -> Option<i32> {
        match self {
            SysError::Syscall { io_error, .. } => io_error.raw_os_error(),
            SysError::VerifierRejected { .. } => None,
        }
    }
}

/// Attributes for a program load request.
#[derive(Debug)]
pub struct ProgLoadAttrs<'a> {
    /// The program name.
    pub name: &'a str,
    /// The instruction stream to verify and load.
    pub instructions: &'a [crate::insn::Insn],
}

/// The opaque acceptor the loader and attachment manager call through.
///
/// Implementations either accept a well-formed request or reject it with a
/// [`SysError`]; nothing here blocks indefinitely.
pub trait Kernel: Send + Sync + std::fmt::Debug {
    /// Verifies and loads a program, consuming one program slot.
    fn prog_load(&self, attrs: ProgLoadAttrs<'_>) -> SysResult<RawProgId>;

    /// Releases the program slot held by `prog_id`.
    fn prog_unload(&self, prog_id: RawProgId) -> SysResult<()>;

    /// Resolves an interface name to its index. `ENODEV` if it doesn't exist.
    fn if_index(&self, name: &str) -> SysResult<u32>;

    /// Adds the clsact qdisc to an interface. `EEXIST` if already present.
    fn qdisc_add_clsact(&self, if_index: u32) -> SysResult<()>;

    /// Attaches a loaded program to a TC hook. Returns the kernel-assigned
    /// (priority, handle) pair when the requested ones are zero.
    fn tc_attach(
        &self,
        prog_id: RawProgId,
        if_index: u32,
        attach_type: TcAttachType,
        priority: u16,
        handle: u32,
    ) -> SysResult<(u16, u32)>;

    /// Detaches a TC filter. `ENOENT` if it is not attached.
    fn tc_detach(
        &self,
        if_index: u32,
        attach_type: TcAttachType,
        priority: u16,
        handle: u32,
    ) -> SysResult<()>;

    /// Returns the verdict of the most recent invocation observed at the
    /// given filter, or `None` if no packet has reached it. Never blocks.
    fn tc_last_retval(
        &self,
        if_index: u32,
        attach_type: TcAttachType,
        priority: u16,
        handle: u32,
    ) -> SysResult<Option<i32>>;
}
