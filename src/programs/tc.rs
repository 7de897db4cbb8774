//! Network traffic control programs.

use std::{sync::Arc, time::SystemTime};

use libc::{EEXIST, EINVAL, ENETDOWN, ENODEV, ENOENT};

use crate::{
    obj::{Object, ProgramSection},
    programs::{
        links::{define_link_wrapper, Link, OwnedLink},
        load_program, unload_program, ProgramData, ProgramError,
    },
    sys::Kernel,
};

/// Traffic control attach type.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum TcAttachType {
    /// Attach to ingress.
    Ingress,
    /// Attach to egress.
    Egress,
}

/// Options for SchedClassifier attach.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcOptions {
    /// Priority assigned to the tc filter, lower number = higher priority.
    /// If set to default (0), the kernel chooses one.
    pub priority: u16,
    /// Used to uniquely identify a filter at a given priority level.
    /// If set to default (0), the kernel chooses a handle.
    pub handle: u32,
}

/// A network traffic control classifier.
///
/// A [`SchedClassifier`] is selected from a parsed [`Object`] by section
/// name, loaded through the [`Kernel`] acceptor and attached to the
/// ingress or egress hook of a network interface. The verdict of the most
/// recent invocation at a hook can be read back with
/// [`SchedClassifier::last_verdict`].
///
/// The clsact qdisc needs to be added to an interface before classifiers
/// can be attached to it, see [`qdisc_add_clsact`].
#[derive(Debug)]
pub struct SchedClassifier {
    pub(crate) data: ProgramData<SchedClassifierLink>,
}

impl SchedClassifier {
    /// Selects the program in the section named `section_name`.
    ///
    /// Fails with [`ProgramError::SectionNotFound`] when the object
    /// declares no such section; no kernel resource is consumed by a
    /// failed selection.
    pub fn from_object(
        obj: &Object,
        section_name: &str,
        kernel: Arc<dyn Kernel>,
    ) -> Result<SchedClassifier, ProgramError> {
        let program = obj
            .program(section_name)
            .ok_or_else(|| ProgramError::SectionNotFound {
                name: section_name.to_owned(),
            })?;
        let ProgramSection::SchedClassifier { name } = &program.section;
        Ok(SchedClassifier {
            data: ProgramData::new(name.clone(), program.instructions.clone(), kernel),
        })
    }

    /// Loads the program inside the kernel, consuming one program slot.
    pub fn load(&mut self) -> Result<(), ProgramError> {
        load_program(&mut self.data)
    }

    /// Unloads the program from the kernel, releasing its slot.
    ///
    /// Remaining links are detached first. Also runs on `Drop`.
    pub fn unload(&mut self) -> Result<(), ProgramError> {
        unload_program(&mut self.data)
    }

    /// Attaches the program to the given `interface` in the given
    /// direction.
    ///
    /// The returned value can be used to detach, see
    /// [`SchedClassifier::detach`]. At most one attachment may occupy a
    /// given (interface, direction) pair per program; a second attach
    /// fails with [`ProgramError::AlreadyAttached`] until the first is
    /// detached. A missing interface, an interface that is down, or one
    /// without the clsact qdisc fails with
    /// [`ProgramError::HookUnavailable`].
    pub fn attach(
        &mut self,
        interface: &str,
        attach_type: TcAttachType,
        options: TcOptions,
    ) -> Result<SchedClassifierLinkId, ProgramError> {
        let prog_id = self.data.prog_id_or_err()?;
        let kernel = self.data.kernel.clone();
        let if_index = kernel
            .if_index(interface)
            .map_err(|error| ProgramError::HookUnavailable {
                interface: interface.to_owned(),
                error,
            })?;

        // hook uniqueness is checked before touching the kernel so a
        // rejected attach leaves no dangling filter behind
        let link_id = SchedClassifierLinkId(TcLinkId(if_index, attach_type));
        if self.data.links.get(&link_id).is_some() {
            return Err(ProgramError::AlreadyAttached);
        }

        let (priority, handle) = kernel
            .tc_attach(
                prog_id,
                if_index,
                attach_type,
                options.priority,
                options.handle,
            )
            .map_err(|error| match error.raw_os_error() {
                Some(EEXIST) => ProgramError::AlreadyAttached,
                Some(ENODEV) | Some(ENETDOWN) | Some(EINVAL) => ProgramError::HookUnavailable {
                    interface: interface.to_owned(),
                    error,
                },
                _ => ProgramError::SyscallError(error),
            })?;

        self.data.links.insert(SchedClassifierLink(TcLink {
            kernel,
            if_index,
            attach_type,
            priority,
            handle,
            created_at: SystemTime::now(),
        }))
    }

    /// Detaches the program from the hook behind `link_id`.
    ///
    /// Idempotent: detaching an attachment that is already gone is a
    /// no-op, so teardown code can detach unconditionally.
    pub fn detach(&mut self, link_id: SchedClassifierLinkId) -> Result<(), ProgramError> {
        self.data.links.remove(link_id)
    }

    /// Takes ownership of the link referenced by the provided `link_id`.
    ///
    /// The returned link detaches on `Drop`; the caller is now
    /// responsible for its lifetime.
    pub fn take_link(
        &mut self,
        link_id: SchedClassifierLinkId,
    ) -> Result<OwnedLink<SchedClassifierLink>, ProgramError> {
        Ok(OwnedLink::new(self.data.take_link(link_id)?))
    }

    /// Returns the verdict of the most recent invocation observed at the
    /// hook behind `link_id`, bit-exact as the classifier returned it.
    ///
    /// Never blocks: when no packet has reached the hook since
    /// attachment, fails immediately with
    /// [`ProgramError::NoInvocationObserved`].
    pub fn last_verdict(&self, link_id: &SchedClassifierLinkId) -> Result<i32, ProgramError> {
        let link = self
            .data
            .links
            .get(link_id)
            .ok_or(ProgramError::NotAttached)?;
        link.last_verdict()
    }
}

impl Drop for SchedClassifier {
    fn drop(&mut self) {
        let _ = self.unload();
    }
}

/// The identity of a TC hook: one (interface, direction) pair.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub(crate) struct TcLinkId(u32, TcAttachType);

#[derive(Debug)]
pub(crate) struct TcLink {
    kernel: Arc<dyn Kernel>,
    if_index: u32,
    attach_type: TcAttachType,
    priority: u16,
    handle: u32,
    created_at: SystemTime,
}

impl TcLink {
    fn last_verdict(&self) -> Result<i32, ProgramError> {
        let retval = self
            .kernel
            .tc_last_retval(self.if_index, self.attach_type, self.priority, self.handle)
            .map_err(|error| match error.raw_os_error() {
                Some(ENOENT) => ProgramError::NotAttached,
                _ => ProgramError::SyscallError(error),
            })?;
        retval.ok_or(ProgramError::NoInvocationObserved)
    }
}

impl Link for TcLink {
    type Id = TcLinkId;

    fn id(&self) -> Self::Id {
        TcLinkId(self.if_index, self.attach_type)
    }

    fn detach(self) -> Result<(), ProgramError> {
        match self
            .kernel
            .tc_detach(self.if_index, self.attach_type, self.priority, self.handle)
        {
            // the filter is already gone, eg torn down with the qdisc
            Err(ref error) if error.raw_os_error() == Some(ENOENT) => Ok(()),
            other => other.map_err(ProgramError::SyscallError),
        }
    }
}

define_link_wrapper!(
    /// The link used by [SchedClassifier] programs.
    SchedClassifierLink,
    /// The type returned by [SchedClassifier::attach]. Can be passed to [SchedClassifier::detach].
    SchedClassifierLinkId,
    TcLink,
    TcLinkId
);

impl SchedClassifierLink {
    /// The interface index the link is attached on.
    pub fn interface_index(&self) -> u32 {
        self.0.if_index
    }

    /// The direction the link is attached in.
    pub fn attach_type(&self) -> TcAttachType {
        self.0.attach_type
    }

    /// When the attachment was created.
    pub fn created_at(&self) -> SystemTime {
        self.0.created_at
    }

    /// See [`SchedClassifier::last_verdict`].
    pub fn last_verdict(&self) -> Result<i32, ProgramError> {
        self.0.last_verdict()
    }
}

/// Adds the clsact qdisc to the given interface.
///
/// The clsact qdisc must be added to an interface before
/// [`SchedClassifier`] programs can be attached to it. Adding it to an
/// interface that already has one succeeds.
pub fn qdisc_add_clsact(kernel: &dyn Kernel, if_name: &str) -> Result<(), ProgramError> {
    let if_index = kernel
        .if_index(if_name)
        .map_err(|error| ProgramError::HookUnavailable {
            interface: if_name.to_owned(),
            error,
        })?;
    match kernel.qdisc_add_clsact(if_index) {
        // the qdisc may already exist, this is not an error
        Err(ref error) if error.raw_os_error() == Some(EEXIST) => Ok(()),
        other => other.map_err(ProgramError::SyscallError),
    }
}
