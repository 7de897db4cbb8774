//! Program types.
//!
//! Programs are selected from a parsed [`Object`], loaded through a
//! [`Kernel`] acceptor and attached to one or more hook points. Loading
//! consumes a kernel program slot that is held until the program is
//! unloaded or dropped.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tc_harness::{Object, SchedClassifier, SimKernel, TcAttachType, TcOptions};
//!
//! let kernel = Arc::new(SimKernel::new());
//! kernel.add_interface("veth0");
//!
//! let obj = Object::parse(&std::fs::read("tc-unit.bpf.o")?)?;
//! let mut prog = SchedClassifier::from_object(&obj, "tc", kernel.clone())?;
//! prog.load()?;
//! let link_id = prog.attach("veth0", TcAttachType::Egress, TcOptions::default())?;
//! // ... drive traffic, read prog.last_verdict(&link_id) ...
//! prog.detach(link_id)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! [`Object`]: crate::obj::Object
//! [`Kernel`]: crate::sys::Kernel

pub mod links;
pub mod tc;

use std::sync::Arc;

use thiserror::Error;

pub use links::{Link, OwnedLink};
use links::LinkMap;
pub use tc::{SchedClassifier, TcAttachType, TcOptions};

use crate::{
    insn::Insn,
    obj::ParseError,
    sys::{Kernel, ProgLoadAttrs, RawProgId, SysError},
};

/// Error type returned when working with programs.
#[derive(Debug, Error)]
pub enum ProgramError {
    /// The program is already loaded.
    #[error("the program is already loaded")]
    AlreadyLoaded,

    /// The program is not loaded.
    #[error("the program is not loaded")]
    NotLoaded,

    /// The program is already attached to this hook.
    #[error("the program is already attached")]
    AlreadyAttached,

    /// The program is not attached.
    #[error("the program is not attached")]
    NotAttached,

    /// No section with the requested name exists in the object.
    #[error("section `{name}` not found in the object")]
    SectionNotFound {
        /// The requested section name.
        name: String,
    },

    /// The kernel acceptor rejected the program.
    #[error("the verifier rejected the program. Verifier output: {verifier_log}")]
    VerificationRejected {
        /// The verifier's reason, carried verbatim.
        verifier_log: String,
    },

    /// No program slot was available.
    #[error("the kernel program slot limit was reached")]
    ResourceExhausted,

    /// The hook the program was attached to cannot be used.
    #[error("the TC hook on interface `{interface}` is unavailable")]
    HookUnavailable {
        /// The interface name.
        interface: String,
        /// The underlying error.
        #[source]
        error: SysError,
    },

    /// No invocation has been observed at the hook since attachment.
    #[error("no invocation observed at the hook")]
    NoInvocationObserved,

    /// A kernel call failed.
    #[error(transparent)]
    SyscallError(#[from] SysError),

    /// An error occurred while parsing the object.
    #[error(transparent)]
    ParseError(#[from] ParseError),
}

#[derive(Debug)]
pub(crate) struct ProgramData<T: Link> {
    pub(crate) name: String,
    pub(crate) instructions: Vec<Insn>,
    pub(crate) prog_id: Option<RawProgId>,
    pub(crate) links: LinkMap<T>,
    pub(crate) kernel: Arc<dyn Kernel>,
}

impl<T: Link> ProgramData<T> {
    pub(crate) fn new(name: String, instructions: Vec<Insn>, kernel: Arc<dyn Kernel>) -> Self {
        ProgramData {
            name,
            instructions,
            prog_id: None,
            links: LinkMap::new(),
            kernel,
        }
    }

    pub(crate) fn prog_id_or_err(&self) -> Result<RawProgId, ProgramError> {
        self.prog_id.ok_or(ProgramError::NotLoaded)
    }

    pub(crate) fn take_link(&mut self, link_id: T::Id) -> Result<T, ProgramError> {
        self.links.forget(link_id)
    }
}

pub(crate) fn load_program<T: Link>(data: &mut ProgramData<T>) -> Result<(), ProgramError> {
    if data.prog_id.is_some() {
        return Err(ProgramError::AlreadyLoaded);
    }
    let prog_id = data
        .kernel
        .prog_load(ProgLoadAttrs {
            name: &data.name,
            instructions: &data.instructions,
        })
        .map_err(|error| match error {
            SysError::VerifierRejected { verifier_log } => {
                ProgramError::VerificationRejected { verifier_log }
            }
            error if error.raw_os_error() == Some(libc::ENOSPC) => {
                ProgramError::ResourceExhausted
            }
            error => ProgramError::SyscallError(error),
        })?;
    data.prog_id = Some(prog_id);
    Ok(())
}

pub(crate) fn unload_program<T: Link>(data: &mut ProgramData<T>) -> Result<(), ProgramError> {
    data.links.remove_all()?;
    let prog_id = data.prog_id.take().ok_or(ProgramError::NotLoaded)?;
    match data.kernel.prog_unload(prog_id) {
        // the slot is already gone, nothing left to release
        Err(ref error) if error.raw_os_error() == Some(libc::ENOENT) => Ok(()),
        other => other.map_err(ProgramError::SyscallError),
    }
}
