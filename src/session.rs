//! Command loop: one command in flight, one response per command.
//!
//!   AwaitingCommand -> Decoding -> Dispatching -> Encoding -> AwaitingCommand
//!                         |                                       |
//!                         +-- bad magic / transport error --> Closed <-- Disconnect

use crate::codec::{decode_command, CommandFrame, Decoded, Response};
use crate::dispatch::Dispatcher;
use crate::drives::DriveTable;
use crate::error::{Error, FsError, TransportError};
use crate::protocol::{CommandId, ResultCode, MAX_PAYLOAD};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    AwaitingCommand,
    Decoding,
    Dispatching,
    Encoding,
    Closed,
}

/// How a session that ended without error ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The client sent `Disconnect`.
    Disconnected,
    /// A `ShutdownHandle` was raised.
    Shutdown,
}

pub struct Session<'a, T: Transport> {
    transport: T,
    dispatcher: Dispatcher<'a>,
    state: State,
    handled: u64,
}

impl<'a, T: Transport> Session<'a, T> {
    pub fn new(transport: T, drives: &'a DriveTable) -> Self {
        Session {
            transport,
            dispatcher: Dispatcher::new(drives),
            state: State::AwaitingCommand,
            handled: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Number of commands answered so far.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    pub fn open_transfers(&self) -> usize {
        self.dispatcher.transfers().open_sessions()
    }

    /// Read one command, run it and write its response.
    ///
    /// Returns the state the machine settled in. Errors are fatal: the
    /// machine is `Closed` and nothing was written for the failed frame.
    pub fn step(&mut self) -> Result<State, Error> {
        if self.state == State::Closed {
            return Ok(State::Closed);
        }

        self.state = State::Decoding;
        let decoded = match decode_command(&mut self.transport) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.close();
                return Err(err);
            }
        };

        self.state = State::Dispatching;
        let (response, closing) = match decoded {
            Decoded::Oversized { command_id, length } => {
                log::warn!(
                    "command {:#x}: payload of {} bytes dropped (limit {})",
                    command_id,
                    length,
                    MAX_PAYLOAD
                );
                (Response::error(ResultCode::PayloadTooLarge), false)
            }
            Decoded::Command(frame) => self.dispatch(frame),
        };

        self.state = State::Encoding;
        if let Err(err) = self.transport.write_all(&response.encode()) {
            self.close();
            return Err(err.into());
        }
        self.handled += 1;

        if closing {
            log::info!("client disconnected after {} commands", self.handled);
            self.close();
        } else {
            self.state = State::AwaitingCommand;
        }
        Ok(self.state)
    }

    fn dispatch(&mut self, frame: CommandFrame) -> (Response, bool) {
        let command = match CommandId::try_from(frame.command_id) {
            Ok(command) => command,
            Err(err) => {
                log::warn!("{}", err);
                return (Response::error(FsError::from(err).result_code()), false);
            }
        };

        let response = match self.dispatcher.handle(command, &frame.payload) {
            Ok(payload) if payload.len() > MAX_PAYLOAD => {
                log::warn!(
                    "{:?}: response of {} bytes exceeds limit {}",
                    command,
                    payload.len(),
                    MAX_PAYLOAD
                );
                Response::error(ResultCode::PayloadTooLarge)
            }
            Ok(payload) => Response::ok(payload),
            Err(err) => {
                log::warn!("{:?} failed: {}", command, err);
                Response::error(err.result_code())
            }
        };

        (response, command == CommandId::Disconnect)
    }

    fn close(&mut self) {
        let open = self.dispatcher.transfers().open_sessions();
        if open > 0 {
            log::warn!("discarding {} open transfer sessions", open);
        }
        self.dispatcher.abort_transfers();
        self.state = State::Closed;
    }
}

/// Serve commands from `transport` until the client disconnects, a shutdown
/// is requested, or the stream fails.
pub fn run<T: Transport>(transport: T, drives: &DriveTable) -> Result<Termination, Error> {
    let mut session = Session::new(transport, drives);
    log::info!("session started with {} drives", drives.drives().len());

    loop {
        match session.step() {
            Ok(State::Closed) => return Ok(Termination::Disconnected),
            Ok(_) => continue,
            Err(Error::Transport(TransportError::Shutdown)) => {
                log::info!("shutdown requested, session closed");
                return Ok(Termination::Shutdown);
            }
            Err(err) => {
                log::error!("session terminated: {}", err);
                return Err(err);
            }
        }
    }
}
