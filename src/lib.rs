// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! The callee side of the [Cap'n Proto remote procedure call](https://capnproto.org/rpc.html)
//! protocol: the answer table of a connection and the lifecycle of each answer in it.
//!
//! When the peer sends a `Call`, the connection adds an [`AnswerHandle`] for it with
//! [`ConnectionState::new_answer()`], which also reserves the `Return` message. The code
//! executing the call may install a [`capability::PipelineCaller`] so that calls the peer
//! pipelines on the result are forwarded to the running computation, then fills in
//! results with [`AnswerHandle::allocate_results()`] or
//! [`AnswerHandle::set_bootstrap()`] and finally completes the call with
//! [`AnswerHandle::send_return()`].
//!
//! The peer's `Finish` may arrive at any point relative to our `Return`; it is fed in with
//! [`ConnectionState::handle_finish()`]. An answer leaves the table exactly once, when the
//! second of the two arrives.
//!
//! ```ignore
//! let answer = connection_state.new_answer(question_id, abort_handle)?;
//! answer.set_pipeline_caller(pipeline);
//! let results = answer.allocate_results(ObjectSize { data: 1, pointers: 0 })?;
//! results.set_data_field(0, 42)?;
//! answer.send_return(Ok(())).await;
//! ```
//!
//! Everything here is `Send` and `Sync`: many calls on the same connection may complete
//! concurrently from different threads.

use capnp::Error;
use futures::future::BoxFuture;

pub use crate::answer::{AnswerHandle, AnswerState, Lifecycle, NewAnswerError};
pub use crate::join::{DeliveryAck, JoinCounter};
pub use crate::rpc::{AnswerId, ConnectionOptions, ConnectionState, ExportId, Forwarded, QuestionId};
pub use crate::send_session::{SendSession, Sender};

mod answer;
pub mod capability;
mod join;
pub mod message;
mod rpc;
mod send_session;

/// A message to be sent on a [`Connection`].
pub trait OutgoingMessage: Send {
    /// Gets the message body, which the caller may fill in any way it wants.
    fn get_body(&mut self) -> &mut message::Builder;

    /// Same as `get_body()`, but returns a shared reference.
    fn get_body_as_reader(&self) -> &message::Builder;

    /// Sends the message. Returns a future that resolves once the transport has accepted
    /// the message. Dropping the returned future does *not* cancel the send.
    fn send(self: Box<Self>) -> BoxFuture<'static, Result<(), Error>>;

    /// Gets the total size of the message, for flow control purposes.
    fn size_in_words(&self) -> usize {
        self.get_body_as_reader().size_in_words() as usize
    }
}

/// The transport side of a two-way RPC connection.
pub trait Connection: Send {
    /// Allocates a new message to be sent on this connection.
    ///
    /// If `first_segment_word_size` is non-zero, it should be treated as a
    /// hint suggesting how large to make the first segment.  This is entirely
    /// a hint and the connection may adjust it up or down.  If it is zero,
    /// the connection should choose the size itself.
    fn new_outgoing_message(
        &mut self,
        first_segment_word_size: u32,
    ) -> capnp::Result<Box<dyn OutgoingMessage>>;

    /// Waits until all outgoing messages have been sent, then shuts down the outgoing stream. The
    /// returned future resolves after shutdown is complete.
    fn shutdown(&mut self, result: capnp::Result<()>) -> BoxFuture<'static, Result<(), Error>>;
}

/// Receives errors that could not be returned to anyone. Implementations must not block
/// and must not call back into the connection.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: Error);
}

/// An `ErrorReporter` that logs through the `log` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, error: Error) {
        log::warn!("rpc: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorReporter, LogReporter};

    #[test]
    fn log_reporter_accepts_errors_without_a_logger() {
        let reporter: Box<dyn ErrorReporter> = Box::new(LogReporter);
        reporter.report(capnp::Error::failed("unreachable peer".to_string()));
    }
}
