//! A test harness for TC classifier programs.
//!
//! `tc-harness` exercises the full user-space contract around a traffic
//! control (TC) classifier: parse a compiled artifact, load a program
//! through a verification gate, attach it to a network interface's
//! ingress or egress hook, observe the verdict it returned for the last
//! packet, and detach again. The kernel side is a pluggable acceptor
//! ([`sys::Kernel`]); the bundled [`sys::SimKernel`] implements it
//! in-process so the whole contract runs deterministically with no real
//! kernel, interfaces or traffic generator.
//!
//! The canonical workload is the bundled [`fixture`]: a classifier with
//! no branching that returns [`TcAct::Unspec`] for every packet.
//!
//! ```
//! use std::sync::Arc;
//! use tc_harness::{
//!     fixture, qdisc_add_clsact, Object, SchedClassifier, SimKernel, TcAttachType, TcOptions,
//! };
//!
//! let kernel = Arc::new(SimKernel::new());
//! kernel.add_interface("veth0");
//! qdisc_add_clsact(&*kernel, "veth0")?;
//!
//! let obj = Object::parse(&fixture::tc_unit_object())?;
//! let mut prog = SchedClassifier::from_object(&obj, "tc", kernel.clone())?;
//! prog.load()?;
//! let link_id = prog.attach("veth0", TcAttachType::Egress, TcOptions::default())?;
//!
//! kernel.process_packet("veth0", TcAttachType::Egress, &[0u8; 64])?;
//! assert_eq!(prog.last_verdict(&link_id)?, -1);
//!
//! prog.detach(link_id)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
#![deny(clippy::all)]

pub mod fixture;
pub mod insn;
pub mod obj;
pub mod programs;
pub mod sys;
pub mod verdict;

pub use obj::{Object, ParseError, ProgramSection};
pub use programs::{
    tc::qdisc_add_clsact, ProgramError, SchedClassifier, TcAttachType, TcOptions,
};
pub use sys::{Kernel, SimKernel, SysError, Verifier};
pub use verdict::TcAct;
