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

use std::sync::Arc;

use capnp::Error;

use crate::message;

/// The per-connection sender lock. Whoever holds it is the only one writing to the
/// transport, so messages go out in the order the lock was acquired.
#[derive(Clone)]
pub struct Sender {
    lock: Arc<futures::lock::Mutex<()>>,
}

impl Sender {
    pub fn new() -> Self {
        Self {
            lock: Arc::new(futures::lock::Mutex::new(())),
        }
    }
}

impl Default for Sender {
    fn default() -> Self {
        Self::new()
    }
}

/// A claim on one outgoing message slot of a connection.
///
/// Committing the session with `send()` transmits the message; `finish()` (or dropping
/// the session) discards the reservation.
pub struct SendSession {
    message: Box<dyn crate::OutgoingMessage>,
    sender: Sender,
}

impl SendSession {
    pub(crate) fn new(message: Box<dyn crate::OutgoingMessage>, sender: Sender) -> Self {
        Self { message, sender }
    }

    pub fn get_body(&mut self) -> &mut message::Builder {
        self.message.get_body()
    }

    pub fn get_body_as_reader(&self) -> &message::Builder {
        self.message.get_body_as_reader()
    }

    /// Acquires the sender lock and writes the message. The lock is released once the
    /// transport has accepted the message.
    pub async fn send(self) -> Result<(), Error> {
        let Self { message, sender } = self;
        let _guard = sender.lock.lock().await;
        message.send().await
    }

    pub fn finish(self) {}
}
