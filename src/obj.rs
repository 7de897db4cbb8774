//! Object file loading and parsing.
//!
//! An [`Object`] is a read-only descriptor of a compiled classifier
//! artifact: it lists the program sections the artifact declares, in
//! declaration order, together with their decoded instruction streams.
//! Nothing is executed or submitted to the kernel at this stage.

use std::str::FromStr;

use log::debug;
use object::{
    read::{Object as ElfObject, ObjectSection},
    Endianness, SectionKind,
};
use thiserror::Error;

use crate::{
    insn::{Insn, INSN_SIZE},
    verdict::TcAct,
};

/// The parsed object file representation.
#[derive(Debug, Clone)]
pub struct Object {
    /// The endianness of the artifact.
    pub endianness: Endianness,
    programs: Vec<Program>,
}

/// A program found in an object file.
#[derive(Debug, Clone)]
pub struct Program {
    /// The section the program was declared in.
    pub section: ProgramSection,
    /// The decoded instruction stream.
    pub instructions: Vec<Insn>,
}

/// Section types containing programs.
///
/// Parsed from the ELF section name. Only classifier sections are
/// recognized; the section name `"tc"` and its legacy alias
/// `"classifier"` both map to [`ProgramSection::SchedClassifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramSection {
    /// A `SEC("tc")` traffic control classifier.
    SchedClassifier {
        /// The program name.
        name: String,
    },
}

impl ProgramSection {
    /// Returns the program name.
    pub fn name(&self) -> &str {
        match self {
            ProgramSection::SchedClassifier { name } => name,
        }
    }

    /// The verdict codes a program of this section type may return.
    pub fn return_domain(&self) -> &'static [TcAct] {
        match self {
            ProgramSection::SchedClassifier { .. } => &[
                TcAct::Unspec,
                TcAct::Ok,
                TcAct::Reclassify,
                TcAct::Shot,
                TcAct::Pipe,
                TcAct::Stolen,
                TcAct::Queued,
                TcAct::Repeat,
                TcAct::Redirect,
                TcAct::Trap,
            ],
        }
    }
}

impl FromStr for ProgramSection {
    type Err = ParseError;

    fn from_str(section: &str) -> Result<ProgramSection, ParseError> {
        // the common case is a bare kind, eg "tc"; "tc/program_name" also
        // occurs when one object declares several classifiers
        let mut parts = section.rsplitn(2, '/').collect::<Vec<_>>();
        if parts.len() == 1 {
            parts.push(parts[0]);
        }
        let kind = parts[1];
        let name = parts[0].to_owned();

        Ok(match kind {
            "tc" | "classifier" => ProgramSection::SchedClassifier { name },
            _ => {
                return Err(ParseError::InvalidProgramSection {
                    section: section.to_owned(),
                })
            }
        })
    }
}

/// The error type returned when parsing an object file fails.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Error parsing the ELF data, eg a corrupt header or unknown magic.
    #[error("error parsing ELF data")]
    ElfError(object::read::Error),

    /// Error reading a section.
    #[error("error parsing section with index {index}")]
    SectionError {
        /// The section index.
        index: usize,
        /// The original error.
        error: object::read::Error,
    },

    /// An executable section has a name that doesn't map to a known
    /// program type.
    #[error("invalid program section `{section}`")]
    InvalidProgramSection {
        /// The section name.
        section: String,
    },

    /// A program section's size is not a multiple of the instruction size.
    #[error("invalid program code")]
    InvalidProgramCode,
}

impl Object {
    /// Parses the binary artifact.
    ///
    /// Read-only: no side effects beyond building the descriptor.
    pub fn parse(data: &[u8]) -> Result<Object, ParseError> {
        let obj = object::read::File::parse(data).map_err(ParseError::ElfError)?;
        let endianness = obj.endianness();

        let mut programs = Vec::new();
        for section in obj.sections() {
            if section.kind() != SectionKind::Text || section.size() == 0 {
                continue;
            }
            let index = section.index().0;
            let map_err = |error| ParseError::SectionError { index, error };
            let name = section.name().map_err(map_err)?;
            let section_type = ProgramSection::from_str(name)?;
            let data = section.data().map_err(map_err)?;
            let instructions = decode_instructions(data)?;
            debug!(
                "parsed program `{}` ({} instructions)",
                section_type.name(),
                instructions.len()
            );
            programs.push(Program {
                section: section_type,
                instructions,
            });
        }

        Ok(Object {
            endianness,
            programs,
        })
    }

    /// Returns the programs declared in the artifact, in declaration order.
    ///
    /// The order is stable across repeated calls on the same descriptor.
    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    /// Returns the program with the given name, if any.
    pub fn program(&self, name: &str) -> Option<&Program> {
        self.programs.iter().find(|p| p.section.name() == name)
    }
}

fn decode_instructions(data: &[u8]) -> Result<Vec<Insn>, ParseError> {
    if data.len() % INSN_SIZE != 0 {
        return Err(ParseError::InvalidProgramCode);
    }
    Ok(data
        .chunks_exact(INSN_SIZE)
        .map(|chunk| Insn::from_bytes(chunk.try_into().unwrap()))
        .collect())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::fixture;

    #[test]
    fn test_parse_generic_error() {
        assert_matches!(Object::parse(&b"foo"[..]), Err(ParseError::ElfError(_)));
    }

    #[test]
    fn test_parse_empty() {
        assert_matches!(Object::parse(&b""[..]), Err(ParseError::ElfError(_)));
    }

    #[test]
    fn test_program_section_names() {
        assert_matches!(
            ProgramSection::from_str("tc"),
            Ok(ProgramSection::SchedClassifier { name }) if name == "tc"
        );
        assert_matches!(
            ProgramSection::from_str("classifier"),
            Ok(ProgramSection::SchedClassifier { name }) if name == "classifier"
        );
        assert_matches!(
            ProgramSection::from_str("tc/handle_tc"),
            Ok(ProgramSection::SchedClassifier { name }) if name == "handle_tc"
        );
        assert_matches!(
            ProgramSection::from_str("kprobe/do_unlinkat"),
            Err(ParseError::InvalidProgramSection { section }) if section == "kprobe/do_unlinkat"
        );
    }

    #[test]
    fn test_parse_fixture_sections() {
        let bytes = fixture::tc_unit_object();
        let obj = Object::parse(&bytes).unwrap();

        let names = |o: &Object| {
            o.programs()
                .iter()
                .map(|p| p.section.name().to_owned())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&obj), vec!["tc"]);
        // stable across repeated calls
        assert_eq!(names(&obj), vec!["tc"]);
        assert_eq!(obj.programs()[0].instructions.len(), 2);
    }

    #[test]
    fn test_parse_declaration_order() {
        let bytes = fixture::build_object(&[
            ("tc/first", &fixture::tc_unit_instructions()),
            ("tc/second", &fixture::tc_unit_instructions()),
        ]);
        let obj = Object::parse(&bytes).unwrap();
        let names = obj
            .programs()
            .iter()
            .map(|p| p.section.name())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_parse_unknown_program_section() {
        let bytes = fixture::build_object(&[("xdp", &fixture::tc_unit_instructions())]);
        assert_matches!(
            Object::parse(&bytes),
            Err(ParseError::InvalidProgramSection { section }) if section == "xdp"
        );
    }

    #[test]
    fn test_parse_truncated_code() {
        let insns = fixture::tc_unit_instructions();
        let mut data = Vec::new();
        for insn in insns {
            data.extend_from_slice(&insn.to_bytes());
        }
        data.pop();
        let bytes = fixture::build_object_raw(&[("tc", &data)]);
        assert_matches!(Object::parse(&bytes), Err(ParseError::InvalidProgramCode));
    }

    #[test]
    fn test_return_domain_covers_all_actions() {
        let section = ProgramSection::SchedClassifier { name: "tc".into() };
        let domain = section.return_domain();
        assert_eq!(domain.len(), 10);
        assert!(domain.contains(&TcAct::Unspec));
    }
}
