//! Command engine — intake on the BLE task, execution on the main loop.
//!
//! ```text
//!  BLE task                         main loop (every tick)
//!  ────────                         ──────────────────────
//!  on_command_written(bytes)        execute_commands()
//!    │ validate_frame                 │ send parked rejections
//!    │   └─ reject ─▶ try send now    │ pop ─▶ handle ─▶ Reply
//!    │         └─ busy ─▶ park        │          ├─ Now(resp) ─▶ send if respond
//!    │ queue.push(req, respond=true)  │          └─ Deferred    (updater answers)
//!    │   └─ full ───▶ try send now    │
//!  enqueue_local(cmd)  (respond=false)
//! ```
//!
//! Rejections never reach the command queue. The BLE task never waits on a
//! pending command notification: a rejection it cannot notify at once is
//! parked and sent by the main loop. The queue lock is held only for the
//! push or pop, never while a handler runs.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::app::ports::PeripheralPort;
use crate::app::profile::{Field, Profile};
use crate::error::ErrorCode;
use crate::rpc::auth::{TokenStore, validate_frame};
use crate::rpc::channels::CommandQueue;
use crate::rpc::codec::{CommandRequest, CommandResponse, CommandType};
use crate::rpc::ota::Updater;
use crate::rpc::transport::{Link, TransportError};

// ── Intake ────────────────────────────────────────────────────

/// Producer side of the command queue.
pub struct CommandIntake {
    queue: Arc<CommandQueue>,
    tokens: Arc<TokenStore>,
    link: Arc<dyn Link>,
}

impl CommandIntake {
    pub fn new(queue: Arc<CommandQueue>, tokens: Arc<TokenStore>, link: Arc<dyn Link>) -> Self {
        Self { queue, tokens, link }
    }

    /// A frame written to the command characteristic. Valid requests are
    /// queued; anything else is answered immediately.
    pub fn on_command_written(&self, bytes: &[u8]) {
        let response = match validate_frame(bytes, &self.tokens) {
            Ok(request) => {
                let header = request.header;
                match self.queue.push(request, true) {
                    Ok(()) => {
                        debug!("engine: queued id={} cmd={}", header.identifier, header.command);
                        return;
                    }
                    Err(code) => {
                        warn!("engine: queue full, dropping id={}", header.identifier);
                        let mut response = CommandResponse::for_request(&header);
                        response.set_error(code);
                        response
                    }
                }
            }
            Err(response) => response,
        };
        match self.link.try_send_response(&response) {
            Ok(()) => {}
            Err(TransportError::Busy) => {
                let id = response.header.identifier;
                if self.queue.defer_reply(response).is_err() {
                    warn!("engine: reply queue full, dropping rejection id={}", id);
                }
            }
            Err(e) => warn!("engine: rejection not delivered: {}", e),
        }
    }

    /// Queue a command raised on the badge itself. No response is sent.
    pub fn enqueue_local(&self, command: CommandType, payload: &[u8]) -> Result<(), ErrorCode> {
        let request = CommandRequest::new(0, self.tokens.current(), command.as_u8(), payload)
            .map_err(|_| ErrorCode::DataTooLong)?;
        self.queue.push(request, false)
    }
}

// ── Dispatch ──────────────────────────────────────────────────

/// Outcome of one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Now(CommandResponse),
    /// The handler handed the request to a task that answers on its own.
    Deferred,
}

/// Consumer side: owns the handler collaborators.
pub struct Dispatcher {
    queue: Arc<CommandQueue>,
    tokens: Arc<TokenStore>,
    link: Arc<dyn Link>,
    updater: Arc<Updater>,
    profile: Profile,
    peripherals: Box<dyn PeripheralPort>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<CommandQueue>,
        tokens: Arc<TokenStore>,
        link: Arc<dyn Link>,
        updater: Arc<Updater>,
        profile: Profile,
        peripherals: Box<dyn PeripheralPort>,
    ) -> Self {
        Self {
            queue,
            tokens,
            link,
            updater,
            profile,
            peripherals,
        }
    }

    /// Run every pending command in arrival order. Returns how many ran.
    pub fn execute_commands(&mut self) -> usize {
        while let Some(response) = self.queue.pop_reply() {
            if let Err(e) = self.link.send_response(&response) {
                warn!("engine: rejection id={} not delivered: {}", response.header.identifier, e);
            }
        }

        let mut handled = 0;
        while let Some(queued) = self.queue.pop() {
            handled += 1;
            let Reply::Now(response) = self.handle(&queued.request) else {
                continue;
            };
            if !queued.respond {
                continue;
            }
            if let Err(e) = self.link.send_response(&response) {
                warn!(
                    "engine: response to id={} not delivered: {}",
                    queued.request.header.identifier, e
                );
            }
        }
        handled
    }

    /// Run the handler for one validated request.
    pub fn handle(&mut self, request: &CommandRequest) -> Reply {
        let mut response = CommandResponse::for_request(&request.header);
        let payload = request.payload();

        let Some(command) = request.header.command_type() else {
            warn!("engine: unknown command {}", request.header.command);
            response.set_error(ErrorCode::InvalidCommandReq);
            return Reply::Now(response);
        };
        debug!("engine: {:?} id={}", command, request.header.identifier);

        let outcome = match command {
            CommandType::Ping => {
                response.set_payload(payload);
                Ok(())
            }
            CommandType::SetBtToken => self.tokens.set(payload),
            CommandType::FirmwareUpdate => match self.updater.request_update(request.header) {
                Ok(_task) => {
                    info!("engine: update session started");
                    return Reply::Deferred;
                }
                Err(code) => Err(code),
            },
            CommandType::FactoryReset => self.profile.factory_reset(),
            CommandType::SetOwner => self.profile.set(Field::Owner, payload),
            CommandType::SetContact => self.profile.set(Field::Contact, payload),
            CommandType::GetOwner => self
                .profile
                .get(Field::Owner)
                .map(|value| response.set_payload(&value)),
            CommandType::GetContact => self
                .profile
                .get(Field::Contact)
                .map(|value| response.set_payload(&value)),
            peripheral => {
                self.peripherals.handle(peripheral, payload, &mut response);
                Ok(())
            }
        };

        if let Err(code) = outcome {
            response.set_error(code);
        }
        Reply::Now(response)
    }
}

// ── Tests ─────────────────────────────────────────────────────
