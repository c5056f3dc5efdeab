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

use std::collections::binary_heap::BinaryHeap;
use std::collections::hash_map::HashMap;
use std::sync::Arc;
use std::{cmp, mem};

use capnp::Error;
use futures::future::AbortHandle;
use parking_lot::Mutex;

use crate::answer::{AnswerHandle, AnswerState, AnswerTable, Lifecycle, NewAnswerError, Route};
use crate::capability::{Client, PipelinedCall};
use crate::message::{self, CapDescriptor, ExceptionType};
use crate::send_session::{SendSession, Sender};

pub type QuestionId = u32;
pub type AnswerId = QuestionId;
pub type ExportId = u32;

#[derive(PartialEq, Eq)]
struct ReverseU32 {
    val: u32,
}

impl cmp::Ord for ReverseU32 {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        other.val.cmp(&self.val)
    }
}

impl cmp::PartialOrd for ReverseU32 {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A table whose IDs are chosen by us. Freed IDs are reused, lowest first.
struct ExportTable<T> {
    slots: Vec<Option<T>>,

    // prioritize lower values
    free_ids: BinaryHeap<ReverseU32>,
}

impl<T> ExportTable<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_ids: BinaryHeap::new(),
        }
    }

    fn erase(&mut self, id: u32) -> Option<T> {
        let value = self.slots.get_mut(id as usize).and_then(Option::take);
        if value.is_some() {
            self.free_ids.push(ReverseU32 { val: id });
        }
        value
    }

    fn push(&mut self, val: T) -> u32 {
        match self.free_ids.pop() {
            Some(ReverseU32 { val: id }) => {
                self.slots[id as usize] = Some(val);
                id
            }
            None => {
                self.slots.push(Some(val));
                self.slots.len() as u32 - 1
            }
        }
    }

    fn find(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn drain(&mut self) -> impl Iterator<Item = T> {
        self.free_ids.clear();
        mem::take(&mut self.slots).into_iter().flatten()
    }
}

struct Export {
    refcount: u32,
    client: Client,
}

/// Capabilities we have sent to the peer, deduplicated by identity.
pub(crate) struct Exports {
    table: ExportTable<Export>,
    by_cap: HashMap<usize, ExportId>,
}

impl Exports {
    fn new() -> Self {
        Self {
            table: ExportTable::new(),
            by_cap: HashMap::new(),
        }
    }

    fn export(&mut self, cap: &Client) -> ExportId {
        let ptr = cap.get_ptr();
        if let Some(&export_id) = self.by_cap.get(&ptr) {
            if let Some(exp) = self.table.find(export_id) {
                // We've already seen and exported this capability before. Just up the refcount.
                exp.refcount += 1;
                return export_id;
            }
        }
        let export_id = self.table.push(Export {
            refcount: 1,
            client: cap.add_ref(),
        });
        self.by_cap.insert(ptr, export_id);
        export_id
    }

    /// Fills in the payload capability table of `body` from the message's capability
    /// table. Returns the export IDs that were written.
    pub(crate) fn write_descriptors(
        &mut self,
        body: &mut message::Builder,
    ) -> capnp::Result<Vec<ExportId>> {
        body.init_cap_table(body.cap_table_len())?;
        let mut exports = Vec::new();
        let descriptors = body.with_cap_table(|caps| {
            caps.iter()
                .map(|slot| match slot {
                    Some(cap) => {
                        let export_id = self.export(cap);
                        exports.push(export_id);
                        CapDescriptor::SenderHosted(export_id)
                    }
                    None => CapDescriptor::None,
                })
                .collect()
        });
        body.get_results_mut()?.cap_table = descriptors;
        Ok(exports)
    }

    /// Drops one reference per ID. Capabilities whose last reference goes away are moved
    /// into `released` so the caller can drop them after unlocking. Unknown IDs are
    /// skipped and reported once the rest have been released.
    fn release(&mut self, ids: &[ExportId], released: &mut Vec<Client>) -> capnp::Result<()> {
        let mut invalid = Vec::new();
        for &id in ids {
            let Some(exp) = self.table.find(id) else {
                invalid.push(id);
                continue;
            };
            exp.refcount -= 1;
            if exp.refcount == 0 {
                if let Some(exp) = self.table.erase(id) {
                    self.by_cap.remove(&exp.client.get_ptr());
                    released.push(exp.client);
                }
            }
        }
        if invalid.is_empty() {
            Ok(())
        } else {
            Err(Error::failed(format!(
                "Tried to release invalid export IDs {invalid:?}."
            )))
        }
    }
}

pub(crate) fn from_error(error: &Error) -> (ExceptionType, String) {
    let typ = match error.kind {
        ::capnp::ErrorKind::Failed => ExceptionType::Failed,
        ::capnp::ErrorKind::Overloaded => ExceptionType::Overloaded,
        ::capnp::ErrorKind::Disconnected => ExceptionType::Disconnected,
        ::capnp::ErrorKind::Unimplemented => ExceptionType::Unimplemented,
        _ => ExceptionType::Failed,
    };
    (typ, error.to_string())
}

/// Tuning knobs for a `ConnectionState`.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionOptions {
    /// First-segment size hint, in words, for each reserved `Return` message.
    pub return_size_hint: u32,

    /// Whether `accept_call()` disconnects when the peer reuses an answer ID that is
    /// still live.
    pub abort_on_duplicate_answer: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            return_size_hint: 64,
            abort_on_duplicate_answer: true,
        }
    }
}

/// Everything guarded by the connection mutex.
pub(crate) struct Tables {
    pub(crate) connection: Result<Box<dyn crate::Connection>, Error>,
    pub(crate) answers: AnswerTable,
    pub(crate) exports: Exports,
}

/// What `forward_call()` did with a pipelined call.
#[derive(Debug)]
pub enum Forwarded {
    /// The call went to the answer's pipeline caller.
    Pipelined,

    /// The answer's results are ready; `target` is the capability the call is addressed
    /// to, and the caller should deliver `call` to it.
    Resolved { target: Client, call: PipelinedCall },
}

/// The callee-side state of one RPC connection.
pub struct ConnectionState {
    pub(crate) tables: Mutex<Tables>,
    sender: Sender,
    reporter: Box<dyn crate::ErrorReporter>,
    pub(crate) options: ConnectionOptions,
}

impl ConnectionState {
    pub fn new(
        connection: Box<dyn crate::Connection>,
        reporter: Box<dyn crate::ErrorReporter>,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(Tables {
                connection: Ok(connection),
                answers: AnswerTable::default(),
                exports: Exports::new(),
            }),
            sender: Sender::new(),
            reporter,
            options,
        })
    }

    pub(crate) fn report(&self, error: Error) {
        self.reporter.report(error);
    }

    pub(crate) fn start_send(
        &self,
        tables: &mut Tables,
        first_segment_words: u32,
    ) -> capnp::Result<SendSession> {
        match tables.connection.as_mut() {
            Err(e) => Err(e.clone()),
            Ok(c) => Ok(SendSession::new(
                c.new_outgoing_message(first_segment_words)?,
                self.sender.clone(),
            )),
        }
    }

    /// Like `new_answer()`, but treats reuse of a live answer ID as a protocol
    /// violation: it is reported and, if `abort_on_duplicate_answer` is set, the
    /// connection is aborted.
    pub async fn accept_call(
        self: &Arc<Self>,
        id: AnswerId,
        cancel: AbortHandle,
    ) -> Result<AnswerHandle, NewAnswerError> {
        match self.new_answer(id, cancel) {
            Err(NewAnswerError::Duplicate(e)) => {
                self.report(e.clone());
                if self.options.abort_on_duplicate_answer {
                    self.disconnect(e.clone()).await;
                }
                Err(NewAnswerError::Duplicate(e))
            }
            result => result,
        }
    }

    /// Handles a `Finish` message from the peer.
    pub fn handle_finish(&self, id: AnswerId, release_result_caps: bool) {
        let mut released = Vec::new();
        let mut error = None;
        let doomed = {
            let mut guard = self.tables.lock();
            let Tables {
                answers, exports, ..
            } = &mut *guard;
            let done = match answers.find_mut(id) {
                None => {
                    error = Some(Error::failed(format!(
                        "Invalid question ID {id} in Finish message."
                    )));
                    false
                }
                Some(answer) => {
                    if release_result_caps {
                        let ids = mem::take(&mut answer.result_exports);
                        if let Err(e) = exports.release(&ids, &mut released) {
                            error = Some(e);
                        }
                    }
                    let lifecycle = answer.state.mark_finish_received();
                    if lifecycle != Lifecycle::Done && !answer.state.results_ready() {
                        // The caller no longer wants the results.
                        answer.cancel.abort();
                    }
                    lifecycle == Lifecycle::Done
                }
            };
            if done {
                answers.remove(id)
            } else {
                None
            }
        };
        if doomed.is_some() {
            log::trace!("answer {id}: released on finish");
        }
        drop(doomed);
        drop(released);
        if let Some(e) = error {
            self.report(e);
        }
    }

    /// Routes a call that the peer addressed to the (possibly future) results of answer
    /// `id`.
    pub fn forward_call(&self, id: AnswerId, call: PipelinedCall) -> capnp::Result<Forwarded> {
        let route = {
            let mut tables = self.tables.lock();
            match tables.answers.find_mut(id) {
                Some(answer) => answer.route_pipelined_call(&call.transform),
                None => Err(Error::failed(format!(
                    "Pipeline call on answer {id}, which returned no capabilities or was already closed."
                ))),
            }
        }?;
        match route {
            Route::Pipeline(pipeline, ack) => {
                pipeline.pipeline_call(call, ack);
                Ok(Forwarded::Pipelined)
            }
            Route::Resolved(target) => Ok(Forwarded::Resolved { target, call }),
        }
    }

    /// Aborts the connection: outstanding calls are canceled, pipeline callers and
    /// exports are dropped, an `Abort` message carrying `error` is sent, and the
    /// transport is shut down. Does nothing if already disconnected.
    pub async fn disconnect(&self, error: Error) {
        let (mut connection, abort, pipelines, exports) = {
            let mut guard = self.tables.lock();
            let tables = &mut *guard;
            if tables.connection.is_err() {
                // Already disconnected.
                return;
            }
            let Ok(mut connection) = mem::replace(&mut tables.connection, Err(error.clone())) else {
                return;
            };

            let mut pipelines = Vec::new();
            for answer in tables.answers.iter_mut() {
                answer.cancel.abort();
                pipelines.extend(answer.pipeline.take());
            }
            let exports: Vec<Export> = tables.exports.table.drain().collect();
            tables.exports.by_cap.clear();

            let (typ, reason) = from_error(&error);
            let abort = connection
                .new_outgoing_message(self.options.return_size_hint)
                .and_then(|mut message| {
                    message.get_body().init_abort(typ, &reason)?;
                    Ok(message)
                });
            (connection, abort, pipelines, exports)
        };
        drop(pipelines);
        drop(exports);
        log::debug!("disconnecting: {error}");

        match abort {
            Ok(message) => {
                if let Err(e) = SendSession::new(message, self.sender.clone()).send().await {
                    if e.kind != ::capnp::ErrorKind::Disconnected {
                        self.report(e);
                    }
                }
            }
            Err(e) => self.report(e),
        }

        if let Err(e) = connection.shutdown(Err(error)).await {
            // Don't report disconnects as an error.
            if e.kind != ::capnp::ErrorKind::Disconnected {
                self.report(e);
            }
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.tables.lock().connection.is_err()
    }

    /// Returns the state of answer `id`, or `None` if it is not in the answer table.
    pub fn answer_state(&self, id: AnswerId) -> Option<AnswerState> {
        self.tables.lock().answers.find(id).map(|answer| answer.state)
    }

    pub fn answer_count(&self) -> usize {
        self.tables.lock().answers.len()
    }

    pub fn export_count(&self) -> usize {
        self.tables.lock().exports.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{ExportTable, Exports};
    use crate::capability::{Client, ClientHook};

    struct Hook(usize);

    impl ClientHook for Hook {
        fn add_ref(&self) -> Box<dyn ClientHook> {
            Box::new(Hook(self.0))
        }

        fn get_ptr(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn export_ids_reuse_lowest_first() {
        let mut table = ExportTable::new();
        assert_eq!(table.push('a'), 0);
        assert_eq!(table.push('b'), 1);
        assert_eq!(table.push('c'), 2);
        assert_eq!(table.erase(2), Some('c'));
        assert_eq!(table.erase(0), Some('a'));
        assert_eq!(table.erase(0), None);
        assert_eq!(table.push('d'), 0);
        assert_eq!(table.push('e'), 2);
        assert_eq!(table.push('f'), 3);
        assert_eq!(table.len(), 4);
        assert_eq!(table.find(1).copied(), Some('b'));
    }

    #[test]
    fn release_continues_past_invalid_ids() {
        let mut exports = Exports::new();
        let a = Client::new(Box::new(Hook(1)));
        let b = Client::new(Box::new(Hook(2)));
        assert_eq!(exports.export(&a), 0);
        assert_eq!(exports.export(&a), 0);
        assert_eq!(exports.export(&b), 1);

        let mut released = Vec::new();
        let err = exports.release(&[0, 7, 1], &mut released).unwrap_err();
        assert!(err.to_string().contains("[7]"));

        // The ID after the bad one was still released.
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].get_ptr(), 2);
        assert_eq!(exports.table.len(), 1);
        assert!(exports.by_cap.contains_key(&1));
        assert!(!exports.by_cap.contains_key(&2));

        exports.release(&[0], &mut released).unwrap();
        assert_eq!(exports.table.len(), 0);
    }
}
