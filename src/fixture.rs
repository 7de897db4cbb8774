//! The `tc-unit` reference fixture.
//!
//! A classifier with no branching that returns [`TcAct::Unspec`] for every
//! packet, no matter its contents. It touches no maps and no shared state,
//! so a harness asserting on its verdict must observe exactly -1. The
//! artifact is built in memory, no compiler toolchain involved.
//!
//! [`TcAct::Unspec`]: crate::verdict::TcAct::Unspec

use object::{
    write::{Object as ElfBuilder, StandardSegment},
    Architecture, BinaryFormat, Endianness, SectionKind,
};

use crate::{insn::Insn, verdict::TcAct};

/// The instruction stream of the constant classifier:
/// `mov64 r0, TC_ACT_UNSPEC; exit`.
pub fn tc_unit_instructions() -> [Insn; 2] {
    [Insn::mov64_imm(0, TcAct::Unspec.into()), Insn::exit()]
}

/// Builds the `tc-unit` artifact: a relocatable ELF with a single `"tc"`
/// section holding the constant classifier.
pub fn tc_unit_object() -> Vec<u8> {
    build_object(&[("tc", &tc_unit_instructions())])
}

/// Builds an artifact with the given program sections, in order.
pub fn build_object(sections: &[(&str, &[Insn])]) -> Vec<u8> {
    let raw = sections
        .iter()
        .map(|(name, insns)| {
            let mut data = Vec::with_capacity(insns.len() * crate::insn::INSN_SIZE);
            for insn in *insns {
                data.extend_from_slice(&insn.to_bytes());
            }
            (*name, data)
        })
        .collect::<Vec<_>>();
    let raw = raw
        .iter()
        .map(|(name, data)| (*name, data.as_slice()))
        .collect::<Vec<_>>();
    build_object_raw(&raw)
}

/// Builds an artifact from raw section bytes, without any instruction
/// encoding. Used to produce deliberately malformed artifacts in tests.
pub fn build_object_raw(sections: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = ElfBuilder::new(BinaryFormat::Elf, Architecture::Bpf, Endianness::Little);
    for (name, data) in sections {
        let segment = builder.segment_name(StandardSegment::Text).to_vec();
        let section = builder.add_section(segment, name.as_bytes().to_vec(), SectionKind::Text);
        builder.set_section_data(section, data.to_vec(), 1);
    }
    builder.write().expect("in-memory ELF write cannot fail")
}
