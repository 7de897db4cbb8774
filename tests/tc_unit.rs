//! End-to-end harness contract tests against the constant classifier.

use std::sync::Arc;

use assert_matches::assert_matches;

use tc_harness::{
    fixture, qdisc_add_clsact, Object, ProgramError, SchedClassifier, SimKernel, TcAct,
    TcAttachType, TcOptions,
};

fn kernel_with_veth0() -> Arc<SimKernel> {
    let kernel = Arc::new(SimKernel::new());
    kernel.add_interface("veth0");
    qdisc_add_clsact(&*kernel, "veth0").unwrap();
    kernel
}

#[test]
fn test_full_cycle() {
    let kernel = kernel_with_veth0();

    let obj = Object::parse(&fixture::tc_unit_object()).unwrap();
    let sections = obj
        .programs()
        .iter()
        .map(|p| p.section.name())
        .collect::<Vec<_>>();
    assert_eq!(sections, vec!["tc"]);

    let mut prog = SchedClassifier::from_object(&obj, "tc", kernel.clone()).unwrap();
    prog.load().unwrap();
    let link_id = prog
        .attach("veth0", TcAttachType::Egress, TcOptions::default())
        .unwrap();

    kernel
        .process_packet("veth0", TcAttachType::Egress, b"one matching packet")
        .unwrap();
    assert_eq!(prog.last_verdict(&link_id).unwrap(), -1);

    prog.detach(link_id).unwrap();
    // teardown paths may detach again, this must stay a no-op
    prog.detach(link_id).unwrap();
}

#[test]
fn test_verdict_is_constant_across_packets() {
    let kernel = kernel_with_veth0();
    let obj = Object::parse(&fixture::tc_unit_object()).unwrap();
    let mut prog = SchedClassifier::from_object(&obj, "tc", kernel.clone()).unwrap();
    prog.load().unwrap();
    let link_id = prog
        .attach("veth0", TcAttachType::Ingress, TcOptions::default())
        .unwrap();

    for packet in [&b""[..], &[0u8; 1500], b"\xff\xff\xff\xff"] {
        let verdict = kernel
            .process_packet("veth0", TcAttachType::Ingress, packet)
            .unwrap();
        assert_eq!(verdict, i32::from(TcAct::Unspec));
        assert_eq!(prog.last_verdict(&link_id).unwrap(), -1);
    }
}

#[test]
fn test_no_invocation_observed_is_not_a_default() {
    let kernel = kernel_with_veth0();
    let obj = Object::parse(&fixture::tc_unit_object()).unwrap();
    let mut prog = SchedClassifier::from_object(&obj, "tc", kernel).unwrap();
    prog.load().unwrap();
    let link_id = prog
        .attach("veth0", TcAttachType::Egress, TcOptions::default())
        .unwrap();

    assert_matches!(
        prog.last_verdict(&link_id),
        Err(ProgramError::NoInvocationObserved)
    );
}

#[test]
fn test_missing_section_consumes_no_slot() {
    let kernel = kernel_with_veth0();
    let obj = Object::parse(&fixture::tc_unit_object()).unwrap();
    assert_matches!(
        SchedClassifier::from_object(&obj, "nonexistent", kernel.clone()),
        Err(ProgramError::SectionNotFound { .. })
    );
    assert_eq!(kernel.loaded_programs(), 0);
}

#[test]
fn test_rejecting_acceptor() {
    use tc_harness::insn::Insn;

    let kernel = Arc::new(SimKernel::with_verifier(
        |_: &[Insn]| -> Result<(), String> { Err("processed 2 insns, rejected".to_owned()) },
    ));
    kernel.add_interface("veth0");
    let obj = Object::parse(&fixture::tc_unit_object()).unwrap();
    let mut prog = SchedClassifier::from_object(&obj, "tc", kernel.clone()).unwrap();
    assert_matches!(
        prog.load(),
        Err(ProgramError::VerificationRejected { verifier_log })
            if verifier_log == "processed 2 insns, rejected"
    );
    assert_eq!(kernel.loaded_programs(), 0);
}

#[test]
fn test_repeated_runs_release_resources() {
    let kernel = kernel_with_veth0();
    let obj = Object::parse(&fixture::tc_unit_object()).unwrap();

    // repeated load/attach/detach cycles must not accumulate kernel state
    for _ in 0..100 {
        let mut prog = SchedClassifier::from_object(&obj, "tc", kernel.clone()).unwrap();
        prog.load().unwrap();
        let link_id = prog
            .attach("veth0", TcAttachType::Egress, TcOptions::default())
            .unwrap();
        prog.detach(link_id).unwrap();
    }
    assert_eq!(kernel.loaded_programs(), 0);
}
