//! Traffic control action codes.

use thiserror::Error;

/// The verdict a classifier returns to the kernel for a packet.
///
/// The numeric values are part of the kernel ABI and must be preserved
/// bit-exact when surfaced to callers.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
#[repr(i32)]
pub enum TcAct {
    /// Use the default action configured on the qdisc.
    Unspec = -1,
    /// Terminate packet processing and allow the packet to proceed.
    Ok = 0,
    /// Restart classification from the beginning.
    Reclassify = 1,
    /// Drop the packet.
    Shot = 2,
    /// Continue with the next action.
    Pipe = 3,
    /// The packet was consumed by the action.
    Stolen = 4,
    /// The packet was queued by the action.
    Queued = 5,
    /// Repeat the action.
    Repeat = 6,
    /// The packet was redirected to another interface.
    Redirect = 7,
    /// Drop the packet and fire an exception to tracing tooling.
    Trap = 8,
}

/// Error returned when converting an integer outside the TC action domain.
#[derive(Debug, Error)]
#[error("invalid TC action code {0}")]
pub struct InvalidTcAct(pub i32);

impl TryFrom<i32> for TcAct {
    type Error = InvalidTcAct;

    fn try_from(value: i32) -> Result<TcAct, InvalidTcAct> {
        Ok(match value {
            -1 => TcAct::Unspec,
            0 => TcAct::Ok,
            1 => TcAct::Reclassify,
            2 => TcAct::Shot,
            3 => TcAct::Pipe,
            4 => TcAct::Stolen,
            5 => TcAct::Queued,
            6 => TcAct::Repeat,
            7 => TcAct::Redirect,
            8 => TcAct::Trap,
            other => return Err(InvalidTcAct(other)),
        })
    }
}

impl From<TcAct> for i32 {
    fn from(act: TcAct) -> i32 {
        act as i32
    }
}
