//! Command queue between the BLE task and the main loop.
//!
//! ```text
//! ┌──────────────┐  QueuedCommand  ┌──────────────┐
//! │  BLE task    │────────────────▶│  Main loop   │
//! │  (validated  │   depth 10,     │  (one entry  │
//! │   frames)    │   fail closed   │   per pop)   │
//! │  Local UI    │────────────────▶│              │
//! └──────────────┘                 └──────────────┘
//! ```
//!
//! Backed by an owned `embassy-sync` channel used only through `try_send`
//! and `try_receive`: the internal critical section is held for the push or
//! pop alone, never while a handler runs.
//!
//! A second channel of the same depth carries rejections the BLE task could
//! not notify without waiting; the main loop sends them on its next tick.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use crate::config::COMMAND_QUEUE_DEPTH;
use crate::error::ErrorCode;
use crate::rpc::codec::{CommandRequest, CommandResponse};

/// A validated request waiting for the main loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    pub request: CommandRequest,
    /// `false` for commands raised locally, where no peer awaits an answer.
    pub respond: bool,
}

/// Bounded FIFO of pending commands.
pub struct CommandQueue {
    channel: Channel<CriticalSectionRawMutex, QueuedCommand, COMMAND_QUEUE_DEPTH>,
    replies: Channel<CriticalSectionRawMutex, CommandResponse, COMMAND_QUEUE_DEPTH>,
}

impl CommandQueue {
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
            replies: Channel::new(),
        }
    }

    /// Append, or fail with `MAX_COMMAND_REACHED` when already full. A full
    /// queue is left untouched.
    pub fn push(&self, request: CommandRequest, respond: bool) -> Result<(), ErrorCode> {
        self.channel
            .try_send(QueuedCommand { request, respond })
            .map_err(|_| ErrorCode::MaxCommandReached)
    }

    /// Oldest pending command, if any.
    pub fn pop(&self) -> Option<QueuedCommand> {
        self.channel.try_receive().ok()
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    /// Park a response for the main loop. Fails when the reply queue is full.
    pub fn defer_reply(&self, response: CommandResponse) -> Result<(), ErrorCode> {
        self.replies
            .try_send(response)
            .map_err(|_| ErrorCode::MaxCommandReached)
    }

    /// Oldest parked response, if any.
    pub fn pop_reply(&self) -> Option<CommandResponse> {
        self.replies.try_receive().ok()
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}
