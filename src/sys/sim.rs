//! An in-process kernel acceptor.
//!
//! [`SimKernel`] implements the [`Kernel`] seam deterministically: a
//! pluggable verifier gates loads, program slots are counted, interfaces
//! are plain table entries and packets are injected by the caller through
//! [`SimKernel::process_packet`]. Harness tests run against it without any
//! real kernel, network namespace or traffic generator.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use libc::{EEXIST, EINVAL, ENETDOWN, ENODEV, ENOENT, ENOSPC};
use log::debug;

use super::{Kernel, ProgLoadAttrs, RawProgId, SysError, SysResult};
use crate::{
    insn::{self, Insn},
    programs::tc::TcAttachType,
    verdict::TcAct,
};

/// How many program slots a fresh [`SimKernel`] offers.
pub const DEFAULT_SLOT_CAPACITY: usize = 64;

// first kernel-assigned filter priority, matching what tc does when no
// filters exist yet
const FIRST_AUTO_PRIORITY: u16 = 49152;

/// The verification gate consulted on every program load.
///
/// A rejection reason travels to the caller verbatim. Closures implement
/// this trait, so tests can substitute a permissive or rejecting gate
/// inline.
pub trait Verifier: Send + Sync {
    /// Accepts the program or rejects it with a reason.
    fn verify(&self, instructions: &[Insn]) -> Result<(), String>;
}

impl<F> Verifier for F
where
    F: Fn(&[Insn]) -> Result<(), String> + Send + Sync,
{
    fn verify(&self, instructions: &[Insn]) -> Result<(), String> {
        self(instructions)
    }
}

/// The default gate: known opcodes only, and the stream must end in `exit`.
#[derive(Debug, Default)]
pub struct InsnChecker;

impl Verifier for InsnChecker {
    fn verify(&self, instructions: &[Insn]) -> Result<(), String> {
        match instructions.last() {
            None => return Err("no instructions".to_owned()),
            Some(last) if last.code != insn::EXIT => {
                return Err("last insn is not an exit".to_owned())
            }
            Some(_) => {}
        }
        for insn in instructions {
            match insn.code {
                insn::MOV64_IMM | insn::EXIT => {}
                code => return Err(format!("unknown opcode {code:02x}")),
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Interface {
    name: String,
    index: u32,
    up: bool,
    clsact: bool,
    filters: Vec<Filter>,
}

#[derive(Debug)]
struct Filter {
    attach_type: TcAttachType,
    priority: u16,
    handle: u32,
    prog_id: RawProgId,
    last_retval: Option<i32>,
}

#[derive(Debug, Default)]
struct SimState {
    next_prog_id: RawProgId,
    programs: HashMap<RawProgId, Vec<Insn>>,
    interfaces: Vec<Interface>,
}

/// A deterministic, in-process [`Kernel`] implementation.
pub struct SimKernel {
    verifier: Box<dyn Verifier>,
    slot_capacity: usize,
    state: Mutex<SimState>,
}

impl std::fmt::Debug for SimKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimKernel")
            .field("slot_capacity", &self.slot_capacity)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for SimKernel {
    fn default() -> Self {
        SimKernel::new()
    }
}

impl SimKernel {
    /// Creates a kernel with the [`InsnChecker`] gate and the default slot
    /// capacity.
    pub fn new() -> SimKernel {
        SimKernel::with_verifier(InsnChecker)
    }

    /// Creates a kernel with the given verification gate.
    pub fn with_verifier(verifier: impl Verifier + 'static) -> SimKernel {
        SimKernel {
            verifier: Box::new(verifier),
            slot_capacity: DEFAULT_SLOT_CAPACITY,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Caps the number of loadable programs. Future loads beyond the cap
    /// fail with `ENOSPC`; already loaded programs are unaffected.
    pub fn set_slot_capacity(&mut self, capacity: usize) {
        self.slot_capacity = capacity;
    }

    /// Registers a network interface, administratively up, and returns its
    /// index.
    pub fn add_interface(&self, name: &str) -> u32 {
        let mut state = self.state.lock().unwrap();
        let index = state.interfaces.len() as u32 + 1;
        state.interfaces.push(Interface {
            name: name.to_owned(),
            index,
            up: true,
            clsact: false,
            filters: Vec::new(),
        });
        index
    }

    /// Brings an interface up or down.
    pub fn set_link_up(&self, name: &str, up: bool) -> SysResult<()> {
        let mut state = self.state.lock().unwrap();
        let interface = state
            .interfaces
            .iter_mut()
            .find(|i| i.name == name)
            .ok_or_else(|| SysError::from_raw("set_link_up", ENODEV))?;
        interface.up = up;
        Ok(())
    }

    /// The number of program slots currently consumed.
    pub fn loaded_programs(&self) -> usize {
        self.state.lock().unwrap().programs.len()
    }

    /// Delivers one packet to the given hook, as the host's packet path
    /// would, and returns the verdict.
    ///
    /// Filters run in priority order; [`TcAct::Unspec`] falls through to
    /// the next filter, any other verdict ends the walk. Every filter that
    /// ran has its last observed verdict recorded. Fails with `ENOENT` when
    /// no filter is attached in that direction.
    pub fn process_packet(
        &self,
        interface: &str,
        attach_type: TcAttachType,
        _packet: &[u8],
    ) -> SysResult<i32> {
        let mut state = self.state.lock().unwrap();
        let SimState {
            programs,
            interfaces,
            ..
        } = &mut *state;
        let interface = interfaces
            .iter_mut()
            .find(|i| i.name == interface)
            .ok_or_else(|| SysError::from_raw("process_packet", ENODEV))?;
        if !interface.up {
            return Err(SysError::from_raw("process_packet", ENETDOWN));
        }

        let mut filters = interface
            .filters
            .iter_mut()
            .filter(|f| f.attach_type == attach_type)
            .collect::<Vec<_>>();
        if filters.is_empty() {
            return Err(SysError::from_raw("process_packet", ENOENT));
        }
        filters.sort_by_key(|f| f.priority);

        let mut verdict = TcAct::Unspec.into();
        for filter in filters {
            let instructions = programs
                .get(&filter.prog_id)
                .ok_or_else(|| SysError::from_raw("process_packet", ENOENT))?;
            verdict = execute(instructions)?;
            filter.last_retval = Some(verdict);
            debug!(
                "{}/{:?} prio {} returned {}",
                interface.name, attach_type, filter.priority, verdict
            );
            if verdict != i32::from(TcAct::Unspec) {
                break;
            }
        }
        Ok(verdict)
    }

    fn interface_mut<'a>(
        state: &'a mut SimState,
        if_index: u32,
        call: &'static str,
    ) -> SysResult<&'a mut Interface> {
        state
            .interfaces
            .iter_mut()
            .find(|i| i.index == if_index)
            .ok_or_else(|| SysError::from_raw(call, ENODEV))
    }
}

impl Kernel for SimKernel {
    fn prog_load(&self, attrs: ProgLoadAttrs<'_>) -> SysResult<RawProgId> {
        self.verifier
            .verify(attrs.instructions)
            .map_err(|verifier_log| SysError::VerifierRejected { verifier_log })?;

        let mut state = self.state.lock().unwrap();
        if state.programs.len() >= self.slot_capacity {
            return Err(SysError::from_raw("prog_load", ENOSPC));
        }
        state.next_prog_id += 1;
        let prog_id = state.next_prog_id;
        state.programs.insert(prog_id, attrs.instructions.to_vec());
        debug!("loaded program `{}` as id {}", attrs.name, prog_id);
        Ok(prog_id)
    }

    fn prog_unload(&self, prog_id: RawProgId) -> SysResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .programs
            .remove(&prog_id)
            .map(|_| ())
            .ok_or_else(|| SysError::from_raw("prog_unload", ENOENT))
    }

    fn if_index(&self, name: &str) -> SysResult<u32> {
        let state = self.state.lock().unwrap();
        state
            .interfaces
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.index)
            .ok_or_else(|| SysError::from_raw("if_nametoindex", ENODEV))
    }

    fn qdisc_add_clsact(&self, if_index: u32) -> SysResult<()> {
        let mut state = self.state.lock().unwrap();
        let interface = Self::interface_mut(&mut state, if_index, "qdisc_add_clsact")?;
        if interface.clsact {
            return Err(SysError::from_raw("qdisc_add_clsact", EEXIST));
        }
        interface.clsact = true;
        Ok(())
    }

    fn tc_attach(
        &self,
        prog_id: RawProgId,
        if_index: u32,
        attach_type: TcAttachType,
        priority: u16,
        handle: u32,
    ) -> SysResult<(u16, u32)> {
        let mut state = self.state.lock().unwrap();
        if !state.programs.contains_key(&prog_id) {
            return Err(SysError::from_raw("tc_attach", ENOENT));
        }
        let interface = Self::interface_mut(&mut state, if_index, "tc_attach")?;
        if !interface.up {
            return Err(SysError::from_raw("tc_attach", ENETDOWN));
        }
        if !interface.clsact {
            return Err(SysError::from_raw("tc_attach", EINVAL));
        }

        let assigned_priority = if priority != 0 {
            priority
        } else {
            let mut candidate = FIRST_AUTO_PRIORITY;
            while interface
                .filters
                .iter()
                .any(|f| f.attach_type == attach_type && f.priority == candidate)
            {
                candidate -= 1;
            }
            candidate
        };
        let assigned_handle = if handle != 0 { handle } else { 1 };

        if interface.filters.iter().any(|f| {
            f.attach_type == attach_type
                && f.priority == assigned_priority
                && f.handle == assigned_handle
        }) {
            return Err(SysError::from_raw("tc_attach", EEXIST));
        }

        interface.filters.push(Filter {
            attach_type,
            priority: assigned_priority,
            handle: assigned_handle,
            prog_id,
            last_retval: None,
        });
        debug!(
            "attached program {} to {}/{:?} prio {} handle {}",
            prog_id, interface.name, attach_type, assigned_priority, assigned_handle
        );
        Ok((assigned_priority, assigned_handle))
    }

    fn tc_detach(
        &self,
        if_index: u32,
        attach_type: TcAttachType,
        priority: u16,
        handle: u32,
    ) -> SysResult<()> {
        let mut state = self.state.lock().unwrap();
        let interface = Self::interface_mut(&mut state, if_index, "tc_detach")?;
        let position = interface.filters.iter().position(|f| {
            f.attach_type == attach_type && f.priority == priority && f.handle == handle
        });
        match position {
            Some(position) => {
                interface.filters.remove(position);
                Ok(())
            }
            None => Err(SysError::from_raw("tc_detach", ENOENT)),
        }
    }

    fn tc_last_retval(
        &self,
        if_index: u32,
        attach_type: TcAttachType,
        priority: u16,
        handle: u32,
    ) -> SysResult<Option<i32>> {
        let mut state = self.state.lock().unwrap();
        let interface = Self::interface_mut(&mut state, if_index, "tc_last_retval")?;
        interface
            .filters
            .iter()
            .find(|f| {
                f.attach_type == attach_type && f.priority == priority && f.handle == handle
            })
            .map(|f| f.last_retval)
            .ok_or_else(|| SysError::from_raw("tc_last_retval", ENOENT))
    }
}

/// Runs an instruction stream to completion and returns r0.
fn execute(instructions: &[Insn]) -> SysResult<i32> {
    let mut registers = [0i64; 11];
    for instruction in instructions {
        match instruction.code {
            insn::MOV64_IMM => {
                let dst = instruction.dst_reg() as usize;
                if dst >= registers.len() {
                    return Err(SysError::from_raw("bpf_prog_run", EINVAL));
                }
                registers[dst] = i64::from(instruction.imm);
            }
            insn::EXIT => return Ok(registers[0] as i32),
            _ => return Err(SysError::from_raw("bpf_prog_run", EINVAL)),
        }
    }
    // the verifier guarantees the stream ends in an exit
    Err(SysError::from_raw("bpf_prog_run", EINVAL))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::fixture;

    fn load_fixture(kernel: &SimKernel) -> RawProgId {
        kernel
            .prog_load(ProgLoadAttrs {
                name: "tc",
                instructions: &fixture::tc_unit_instructions(),
            })
            .unwrap()
    }

    #[test]
    fn test_verifier_rejection_is_verbatim() {
        let kernel = SimKernel::with_verifier(|_: &[Insn]| -> Result<(), String> {
            Err("R0 !read_ok".to_owned())
        });
        assert_matches!(
            kernel.prog_load(ProgLoadAttrs {
                name: "tc",
                instructions: &fixture::tc_unit_instructions(),
            }),
            Err(SysError::VerifierRejected { verifier_log }) if verifier_log == "R0 !read_ok"
        );
        assert_eq!(kernel.loaded_programs(), 0);
    }

    #[test]
    fn test_insn_checker_requires_exit() {
        let checker = InsnChecker;
        assert!(checker.verify(&fixture::tc_unit_instructions()).is_ok());
        assert_eq!(
            checker.verify(&[]).unwrap_err(),
            "no instructions"
        );
        assert_eq!(
            checker.verify(&[Insn::mov64_imm(0, -1)]).unwrap_err(),
            "last insn is not an exit"
        );
    }

    #[test]
    fn test_slot_exhaustion() {
        let mut kernel = SimKernel::new();
        kernel.set_slot_capacity(1);
        let prog_id = load_fixture(&kernel);
        assert_matches!(
            kernel.prog_load(ProgLoadAttrs {
                name: "tc",
                instructions: &fixture::tc_unit_instructions(),
            }),
            Err(ref e @ SysError::Syscall { .. }) if e.raw_os_error() == Some(ENOSPC)
        );
        // releasing the slot makes room again
        kernel.prog_unload(prog_id).unwrap();
        load_fixture(&kernel);
    }

    #[test]
    fn test_attach_requires_clsact() {
        let kernel = SimKernel::new();
        let if_index = kernel.add_interface("veth0");
        let prog_id = load_fixture(&kernel);
        assert_matches!(
            kernel.tc_attach(prog_id, if_index, TcAttachType::Egress, 0, 0),
            Err(ref e) if e.raw_os_error() == Some(EINVAL)
        );
        kernel.qdisc_add_clsact(if_index).unwrap();
        kernel
            .tc_attach(prog_id, if_index, TcAttachType::Egress, 0, 0)
            .unwrap();
    }

    #[test]
    fn test_attach_down_interface() {
        let kernel = SimKernel::new();
        let if_index = kernel.add_interface("veth0");
        kernel.qdisc_add_clsact(if_index).unwrap();
        kernel.set_link_up("veth0", false).unwrap();
        let prog_id = load_fixture(&kernel);
        assert_matches!(
            kernel.tc_attach(prog_id, if_index, TcAttachType::Ingress, 0, 0),
            Err(ref e) if e.raw_os_error() == Some(ENETDOWN)
        );
    }

    #[test]
    fn test_packet_runs_constant_classifier() {
        let kernel = SimKernel::new();
        let if_index = kernel.add_interface("veth0");
        kernel.qdisc_add_clsact(if_index).unwrap();
        let prog_id = load_fixture(&kernel);
        let (priority, handle) = kernel
            .tc_attach(prog_id, if_index, TcAttachType::Egress, 0, 0)
            .unwrap();

        assert_eq!(
            kernel
                .tc_last_retval(if_index, TcAttachType::Egress, priority, handle)
                .unwrap(),
            None
        );

        let verdict = kernel
            .process_packet("veth0", TcAttachType::Egress, &[0u8; 64])
            .unwrap();
        assert_eq!(verdict, -1);
        assert_eq!(
            kernel
                .tc_last_retval(if_index, TcAttachType::Egress, priority, handle)
                .unwrap(),
            Some(-1)
        );
    }

    #[test]
    fn test_packet_without_filter() {
        let kernel = SimKernel::new();
        kernel.add_interface("veth0");
        assert_matches!(
            kernel.process_packet("veth0", TcAttachType::Ingress, &[]),
            Err(ref e) if e.raw_os_error() == Some(ENOENT)
        );
    }

    #[test]
    fn test_detach_twice_is_enoent() {
        let kernel = SimKernel::new();
        let if_index = kernel.add_interface("veth0");
        kernel.qdisc_add_clsact(if_index).unwrap();
        let prog_id = load_fixture(&kernel);
        let (priority, handle) = kernel
            .tc_attach(prog_id, if_index, TcAttachType::Ingress, 0, 0)
            .unwrap();
        kernel
            .tc_detach(if_index, TcAttachType::Ingress, priority, handle)
            .unwrap();
        assert_matches!(
            kernel.tc_detach(if_index, TcAttachType::Ingress, priority, handle),
            Err(ref e) if e.raw_os_error() == Some(ENOENT)
        );
    }
}
