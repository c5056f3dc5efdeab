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

//! Test doubles for the transport, capabilities, pipeline callers and the error sink.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use capnp::Error;
use capnp_rpc_answer::capability::{Client, ClientHook, PipelineCaller, PipelinedCall};
use capnp_rpc_answer::message::{self, Message, Return};
use capnp_rpc_answer::{
    ConnectionOptions, ConnectionState, DeliveryAck, ErrorReporter, OutgoingMessage,
};
use futures::channel::oneshot;
use futures::future::BoxFuture;
use parking_lot::Mutex;

pub struct TestHook {
    ptr: usize,
    live: Arc<AtomicUsize>,
}

impl ClientHook for TestHook {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        self.live.fetch_add(1, Ordering::SeqCst);
        Box::new(TestHook {
            ptr: self.ptr,
            live: self.live.clone(),
        })
    }

    fn get_ptr(&self) -> usize {
        self.ptr
    }
}

impl Drop for TestHook {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A capability whose live references can be counted.
pub fn new_cap(ptr: usize) -> (Client, Arc<AtomicUsize>) {
    let live = Arc::new(AtomicUsize::new(1));
    let hook = TestHook {
        ptr,
        live: live.clone(),
    };
    (Client::new(Box::new(hook)), live)
}

pub fn live(count: &Arc<AtomicUsize>) -> usize {
    count.load(Ordering::SeqCst)
}

#[derive(Default)]
struct TransportState {
    sent: Vec<message::Builder>,
    word_limit: Option<u64>,
    fail_reservations: bool,
    fail_sends: bool,
    gates: VecDeque<oneshot::Receiver<()>>,
    sends_started: usize,
    shut_down: Option<Result<(), Error>>,
}

/// An in-memory transport that records every message it is asked to send.
#[derive(Clone, Default)]
pub struct TestTransport {
    state: Arc<Mutex<TransportState>>,
}

impl TestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_word_limit(&self, limit: u64) {
        self.state.lock().word_limit = Some(limit);
    }

    pub fn fail_reservations(&self) {
        self.state.lock().fail_reservations = true;
    }

    pub fn fail_sends(&self) {
        self.state.lock().fail_sends = true;
    }

    /// Holds back the next send until the returned sender is fired or dropped.
    pub fn gate_next_send(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().gates.push_back(rx);
        tx
    }

    pub fn sends_started(&self) -> usize {
        self.state.lock().sends_started
    }

    /// Blocks until at least `n` sends have started.
    pub fn wait_for_sends_started(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.sends_started() < n {
            assert!(Instant::now() < deadline, "timed out waiting for a send");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn take_sent(&self) -> Vec<message::Builder> {
        std::mem::take(&mut self.state.lock().sent)
    }

    pub fn sent_returns(&self) -> Vec<Return> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|m| m.get_return().cloned())
            .collect()
    }

    pub fn sent_roots(&self) -> Vec<Message> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|m| m.get_root().cloned())
            .collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down.is_some()
    }
}

struct TestMessage {
    body: message::Builder,
    state: Arc<Mutex<TransportState>>,
}

impl OutgoingMessage for TestMessage {
    fn get_body(&mut self) -> &mut message::Builder {
        &mut self.body
    }

    fn get_body_as_reader(&self) -> &message::Builder {
        &self.body
    }

    fn send(self: Box<Self>) -> BoxFuture<'static, Result<(), Error>> {
        let TestMessage { body, state } = *self;
        let gate = {
            let mut state = state.lock();
            state.sends_started += 1;
            state.gates.pop_front()
        };
        Box::pin(async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            let mut state = state.lock();
            if state.fail_sends {
                return Err(Error::disconnected("write failed".to_string()));
            }
            state.sent.push(body);
            Ok(())
        })
    }
}

impl capnp_rpc_answer::Connection for TestTransport {
    fn new_outgoing_message(
        &mut self,
        _first_segment_word_size: u32,
    ) -> capnp::Result<Box<dyn OutgoingMessage>> {
        let state = self.state.lock();
        if state.fail_reservations {
            return Err(Error::overloaded("no outgoing message slots".to_string()));
        }
        Ok(Box::new(TestMessage {
            body: message::Builder::new(state.word_limit),
            state: self.state.clone(),
        }))
    }

    fn shutdown(&mut self, result: capnp::Result<()>) -> BoxFuture<'static, Result<(), Error>> {
        self.state.lock().shut_down = Some(result);
        Box::pin(futures::future::ready(Ok(())))
    }
}

/// Collects reported errors.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    errors: Arc<Mutex<Vec<Error>>>,
}

impl RecordingReporter {
    pub fn messages(&self) -> Vec<String> {
        self.errors.lock().iter().map(|e| e.to_string()).collect()
    }

    pub fn count(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn any_contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.contains(needle))
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, error: Error) {
        self.errors.lock().push(error);
    }
}

/// A pipeline caller that records calls. Acknowledgements are held until
/// `release_acks()` unless `ack_immediately` is set.
#[derive(Default)]
pub struct RecordingPipeline {
    pub ack_immediately: bool,
    calls: Mutex<Vec<PipelinedCall>>,
    acks: Mutex<Vec<DeliveryAck>>,
}

impl RecordingPipeline {
    pub fn acking() -> Self {
        Self {
            ack_immediately: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<PipelinedCall> {
        self.calls.lock().clone()
    }

    pub fn release_acks(&self) {
        let acks = std::mem::take(&mut *self.acks.lock());
        drop(acks);
    }
}

impl PipelineCaller for RecordingPipeline {
    fn pipeline_call(&self, call: PipelinedCall, ack: DeliveryAck) {
        self.calls.lock().push(call);
        if self.ack_immediately {
            ack.ack();
        } else {
            self.acks.lock().push(ack);
        }
    }
}

pub struct Fixture {
    pub state: Arc<ConnectionState>,
    pub transport: TestTransport,
    pub reporter: RecordingReporter,
}

pub fn fixture() -> Fixture {
    fixture_with(TestTransport::new(), ConnectionOptions::default())
}

pub fn fixture_with(transport: TestTransport, options: ConnectionOptions) -> Fixture {
    let reporter = RecordingReporter::default();
    let state = ConnectionState::new(
        Box::new(transport.clone()),
        Box::new(reporter.clone()),
        options,
    );
    Fixture {
        state,
        transport,
        reporter,
    }
}
