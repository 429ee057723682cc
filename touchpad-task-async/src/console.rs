//! The `touchpad_st` operator console command.
//!
//! ```text
//! touchpad_st <version|calibrate|enable|disable>
//! ```
//!
//! `enable` turns on debug mode and heat-map capture, so frames are rendered
//! to the log instead of being streamed. `disable` reverts both.

use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::Vec;

use crate::task::{Request, TouchpadEvents};

/// Name the command is registered under.
pub const COMMAND_NAME: &str = "touchpad_st";

/// Usage string shown by the console help.
pub const COMMAND_USAGE: &str = "<version|calibrate|enable|disable>";

/// Requests one console command may queue.
pub type Requests = Vec<Request, 2>;

/// Console argument errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleError {
    /// Not exactly one argument after the command name.
    ParamCount,
    /// The argument is not a known subcommand.
    Param1,
    /// The touch task queue is full.
    Busy,
}

/// Parses `argv`, command name included, into the requests it stands for.
///
/// Subcommands are matched case-insensitively.
pub fn parse(argv: &[&str]) -> Result<Requests, ConsoleError> {
    let [_, arg] = argv else {
        return Err(ConsoleError::ParamCount);
    };

    let requests: &[Request] = if arg.eq_ignore_ascii_case("version") {
        &[Request::Version]
    } else if arg.eq_ignore_ascii_case("calibrate") {
        &[Request::Calibrate]
    } else if arg.eq_ignore_ascii_case("enable") {
        &[Request::Debug(true), Request::HeatMap(true)]
    } else if arg.eq_ignore_ascii_case("disable") {
        &[Request::Debug(false), Request::HeatMap(false)]
    } else {
        return Err(ConsoleError::Param1);
    };
    Vec::from_slice(requests).map_err(|_| ConsoleError::Param1)
}

/// Runs the command by queuing its requests on the touch task.
pub fn run<M: RawMutex>(events: &TouchpadEvents<M>, argv: &[&str]) -> Result<(), ConsoleError> {
    for request in parse(argv)? {
        if !events.request(request) {
            return Err(ConsoleError::Busy);
        }
    }
    Ok(())
}
