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

//! The callee side of a call: one `Answer` per question the peer has asked us.
//!
//! An answer lives in the connection's answer table from the moment the `Call` arrives
//! until both our `Return` has been sent and the peer's `Finish` has been received,
//! whichever happens second.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use capnp::Error;
use futures::future::AbortHandle;

use crate::capability::{Client, PipelineCaller, PipelineOp};
use crate::join::{DeliveryAck, JoinCounter};
use crate::message::{self, ObjectSize, ResultsReader, StructBuilder};
use crate::rpc::{from_error, AnswerId, ConnectionState, ExportId, Tables};
use crate::send_session::SendSession;

/// Which of the two completion signals an answer has seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Neither `Return` sent nor `Finish` received.
    Pending,
    ReturnSent,
    FinishReceived,
    /// Both signals have arrived. An answer in this state is removed from the table in
    /// the same critical section that moved it here.
    Done,
}

/// The lifecycle of an answer plus whether its results are ready. Every flag only ever
/// goes from unset to set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnswerState {
    lifecycle: Lifecycle,
    results_ready: bool,
}

impl AnswerState {
    fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Pending,
            results_ready: false,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn return_sent(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::ReturnSent | Lifecycle::Done)
    }

    pub fn finish_received(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::FinishReceived | Lifecycle::Done)
    }

    pub fn results_ready(&self) -> bool {
        self.results_ready
    }

    /// Whether the answer should be removed from the answer table.
    pub fn is_done(&self) -> bool {
        self.lifecycle == Lifecycle::Done
    }

    fn mark_results_ready(&mut self) {
        self.results_ready = true;
    }

    fn mark_return_sent(&mut self) -> Lifecycle {
        self.lifecycle = match self.lifecycle {
            Lifecycle::Pending => Lifecycle::ReturnSent,
            Lifecycle::FinishReceived => Lifecycle::Done,
            other => other,
        };
        self.lifecycle
    }

    pub(crate) fn mark_finish_received(&mut self) -> Lifecycle {
        self.lifecycle = match self.lifecycle {
            Lifecycle::Pending => Lifecycle::FinishReceived,
            Lifecycle::ReturnSent => Lifecycle::Done,
            other => other,
        };
        self.lifecycle
    }
}

pub(crate) struct Answer {
    id: AnswerId,

    // The session holding our `Return` message. `None` if it could not be created, and
    // taken once the message is handed to the sender.
    session: Option<SendSession>,

    pub(crate) state: AnswerState,

    // Cancels the call's execution.
    pub(crate) cancel: AbortHandle,

    // Where pipelined calls go while the call is still running. Cleared when results
    // become ready and never set again afterwards.
    pub(crate) pipeline: Option<Arc<dyn PipelineCaller>>,

    // One count per pipelined call handed to `pipeline` and not yet acknowledged.
    forwards: JoinCounter,

    // The error the call completed with, if any.
    err: Option<Error>,

    // Kept after the `Return` goes out so that later pipelined calls can be resolved
    // against the results. Holds the result capabilities alive.
    results: Option<ResultsReader>,

    // Exports that were written into our results. Released if the `Finish` has
    // `releaseResultCaps` set.
    pub(crate) result_exports: Vec<ExportId>,
}

pub(crate) enum Route {
    Pipeline(Arc<dyn PipelineCaller>, DeliveryAck),
    Resolved(Client),
}

impl Answer {
    fn new(id: AnswerId, cancel: AbortHandle) -> Self {
        Self {
            id,
            session: None,
            state: AnswerState::new(),
            cancel,
            pipeline: None,
            forwards: JoinCounter::new(),
            err: None,
            results: None,
            result_exports: Vec::new(),
        }
    }

    fn return_builder(&mut self) -> capnp::Result<&mut message::Builder> {
        if self.state.results_ready() {
            return Err(Error::failed(format!(
                "results for answer {} have already been returned",
                self.id
            )));
        }
        match self.session {
            Some(ref mut session) => Ok(session.get_body()),
            None => Err(Error::failed(format!(
                "answer {} has no return message",
                self.id
            ))),
        }
    }

    fn allocate_results(&mut self, size: ObjectSize) -> capnp::Result<StructBuilder> {
        let body = self.return_builder()?;
        body.init_results()?;
        let results = body.new_struct(size)?;
        body.get_results_mut()?.content = results.pointer();
        Ok(results)
    }

    // Returns the capability back if it was never registered with the message.
    fn set_bootstrap(&mut self, cap: Client) -> (capnp::Result<()>, Option<Client>) {
        let body = match self.return_builder() {
            Ok(body) => body,
            Err(e) => return (Err(e), Some(cap)),
        };

        // Add the capability to the table first so that a failure below cannot leak it.
        let cap_index = body.add_cap(cap);

        let result = body
            .init_results()
            .map(|payload| payload.content = message::Pointer::Capability(cap_index));
        (result, None)
    }

    pub(crate) fn route_pipelined_call(&mut self, ops: &[PipelineOp]) -> capnp::Result<Route> {
        if let Some(ref pipeline) = self.pipeline {
            return Ok(Route::Pipeline(pipeline.clone(), self.forwards.add()));
        }
        if !self.state.results_ready() {
            return Err(Error::failed(format!(
                "answer {} is not ready to accept pipelined calls",
                self.id
            )));
        }
        if let Some(ref e) = self.err {
            return Err(e.clone());
        }
        match self.results {
            Some(ref results) => results.get_pipelined_cap(ops).map(Route::Resolved),
            None => Err(Error::failed(format!(
                "answer {} returned no results",
                self.id
            ))),
        }
    }
}

#[derive(Default)]
pub(crate) struct AnswerTable {
    slots: HashMap<AnswerId, Answer>,
}

impl AnswerTable {
    pub fn contains(&self, id: AnswerId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn find(&self, id: AnswerId) -> Option<&Answer> {
        self.slots.get(&id)
    }

    pub fn find_mut(&mut self, id: AnswerId) -> Option<&mut Answer> {
        self.slots.get_mut(&id)
    }

    pub fn remove(&mut self, id: AnswerId) -> Option<Answer> {
        self.slots.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Answer> {
        self.slots.values_mut()
    }

    fn insert(&mut self, answer: Answer) {
        self.slots.insert(answer.id, answer);
    }
}

/// The reason `ConnectionState::new_answer()` failed.
pub enum NewAnswerError {
    /// The peer reused an answer ID that is still in the table. The existing answer
    /// is untouched.
    Duplicate(Error),

    /// The answer was added to the table, but no `Return` message could be reserved
    /// for it. Results must not be set on it; completing it with `send_return()` lets
    /// it leave the table once the peer's `Finish` arrives.
    Unsendable { answer: AnswerHandle, error: Error },
}

impl NewAnswerError {
    pub fn error(&self) -> &Error {
        match self {
            Self::Duplicate(error) => error,
            Self::Unsendable { error, .. } => error,
        }
    }
}

impl fmt::Debug for NewAnswerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate(error) => f.debug_tuple("Duplicate").field(error).finish(),
            Self::Unsendable { answer, error } => f
                .debug_struct("Unsendable")
                .field("answer", answer)
                .field("error", error)
                .finish(),
        }
    }
}

impl fmt::Display for NewAnswerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.error(), f)
    }
}

impl std::error::Error for NewAnswerError {}

impl From<NewAnswerError> for Error {
    fn from(e: NewAnswerError) -> Self {
        match e {
            NewAnswerError::Duplicate(error) => error,
            NewAnswerError::Unsendable { error, .. } => error,
        }
    }
}

fn init_return(session: &mut SendSession, id: AnswerId) -> capnp::Result<()> {
    let ret = session.get_body().init_return(id)?;
    ret.release_param_caps = false;
    Ok(())
}

impl ConnectionState {
    /// Adds an answer for a newly received `Call` and reserves its `Return` message.
    pub fn new_answer(
        self: &Arc<Self>,
        id: AnswerId,
        cancel: AbortHandle,
    ) -> Result<AnswerHandle, NewAnswerError> {
        let mut discarded = None;
        let result = {
            let mut tables = self.tables.lock();
            if tables.answers.contains(id) {
                return Err(NewAnswerError::Duplicate(Error::failed(format!(
                    "answer ID {id} reused"
                ))));
            }
            let mut answer = Answer::new(id, cancel);
            let size_hint = self.options.return_size_hint;
            let result = match self.start_send(&mut tables, size_hint) {
                Ok(mut session) => match init_return(&mut session, id) {
                    Ok(()) => {
                        answer.session = Some(session);
                        Ok(())
                    }
                    Err(e) => {
                        discarded = Some(session);
                        Err(Error::failed(format!("create return: {e}")))
                    }
                },
                Err(e) => Err(e),
            };
            tables.answers.insert(answer);
            result
        };
        drop(discarded);

        let answer = AnswerHandle {
            connection_state: self.clone(),
            id,
            stage: Stage::Building,
        };
        match result {
            Ok(()) => {
                log::trace!("answer {id}: created");
                Ok(answer)
            }
            Err(error) => Err(NewAnswerError::Unsendable { answer, error }),
        }
    }

    /// Installs the target for pipelined calls on answer `id`, unless its results are
    /// already ready or it is gone, in which case `caller` is dropped.
    pub fn set_pipeline_caller(&self, id: AnswerId, caller: Arc<dyn PipelineCaller>) {
        let displaced = {
            let mut tables = self.tables.lock();
            match tables.answers.find_mut(id) {
                Some(answer) if !answer.state.results_ready() => answer.pipeline.replace(caller),
                _ => Some(caller),
            }
        };
        drop(displaced);
    }
}

struct BegunReturn {
    session: Option<SendSession>,
    finish_received: bool,
    forwards: JoinCounter,
}

// How far `send_return()` got. Read by `drop()` to finish what it started.
#[derive(Clone, Copy)]
enum Stage {
    Building,
    // Handed to the sender, not yet marked sent.
    Sending { finish_received: bool },
    Returned,
}

/// The executor's handle on an answer. Obtained from `ConnectionState::new_answer()` and
/// consumed by `send_return()`.
///
/// Dropping the handle without calling `send_return()`, or dropping the `send_return()`
/// future before it completes, still counts as the answer's return: no `Return` message
/// reaches the peer, but the answer leaves the table once the `Finish` arrives.
#[must_use = "dropping an answer handle cancels the call"]
pub struct AnswerHandle {
    connection_state: Arc<ConnectionState>,
    id: AnswerId,
    stage: Stage,
}

impl fmt::Debug for AnswerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnswerHandle").field("id", &self.id).finish()
    }
}

impl AnswerHandle {
    pub fn id(&self) -> AnswerId {
        self.id
    }

    pub fn state(&self) -> Option<AnswerState> {
        self.connection_state.answer_state(self.id)
    }

    fn missing(&self) -> Error {
        Error::failed(format!("answer {} is not in the answer table", self.id))
    }

    /// Installs the target for pipelined calls. See `ConnectionState::set_pipeline_caller()`.
    pub fn set_pipeline_caller(&self, caller: Arc<dyn PipelineCaller>) {
        self.connection_state.set_pipeline_caller(self.id, caller);
    }

    /// Allocates a results struct of the given size in the `Return` message and makes it
    /// the results content. Replaces any content set earlier.
    pub fn allocate_results(&self, size: ObjectSize) -> capnp::Result<StructBuilder> {
        let mut tables = self.connection_state.tables.lock();
        let answer = tables.answers.find_mut(self.id).ok_or_else(|| self.missing())?;
        answer
            .allocate_results(size)
            .map_err(|e| Error::failed(format!("alloc results: {e}")))
    }

    /// Makes `cap` the results content, taking ownership of the reference. Replaces any
    /// content set earlier.
    pub fn set_bootstrap(&self, cap: Client) -> capnp::Result<()> {
        let (result, unused) = {
            let mut tables = self.connection_state.tables.lock();
            match tables.answers.find_mut(self.id) {
                Some(answer) => answer.set_bootstrap(cap),
                None => (Err(self.missing()), Some(cap)),
            }
        };
        drop(unused);
        result.map_err(|e| Error::failed(format!("alloc bootstrap results: {e}")))
    }

    /// Completes the call and sends the `Return` message: results if `result` is `Ok`,
    /// an exception otherwise.
    ///
    /// Resolves once every pipelined call that was forwarded to the pipeline caller has
    /// been acknowledged. After that, no further calls will be forwarded to it.
    pub async fn send_return(mut self, result: Result<(), Error>) {
        let Some(begun) = self.begin_return(result) else {
            self.stage = Stage::Returned;
            return;
        };
        self.stage = Stage::Sending {
            finish_received: begun.finish_received,
        };
        if let Some(session) = begun.session {
            if let Err(e) = session.send().await {
                self.connection_state
                    .report(Error::failed(format!("send return: {e}")));
            }
        }
        self.end_return(begun.finish_received);
        self.stage = Stage::Returned;
        begun.forwards.wait_all_acked().await;
    }

    // The executor gave up on the call. Completes the answer with a cancellation error
    // and without a `Return` message.
    fn cancel_return(&self) {
        let mut discarded = None;
        let mut pipeline = None;
        let mut unfinished = false;
        let doomed = {
            let mut tables = self.connection_state.tables.lock();
            match tables.answers.find_mut(self.id) {
                Some(answer) => {
                    answer.err = Some(Error::failed("Call canceled.".to_string()));
                    pipeline = answer.pipeline.take();
                    answer.state.mark_results_ready();
                    discarded = answer.session.take();
                    unfinished = !answer.state.finish_received();
                    if answer.state.mark_return_sent() == Lifecycle::Done {
                        tables.answers.remove(self.id)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        drop(discarded);
        drop(pipeline);
        drop(doomed);
        if unfinished {
            self.connection_state.report(Error::failed(format!(
                "answer {} dropped without a return",
                self.id
            )));
        }
    }

    // Everything up to handing the message to the sender, under the connection mutex.
    fn begin_return(&self, result: Result<(), Error>) -> Option<BegunReturn> {
        let state = &self.connection_state;
        let mut discarded: Option<SendSession> = None;
        let mut pipeline = None;
        let mut errors = Vec::new();
        let begun = {
            let mut guard = state.tables.lock();
            let Tables {
                connection,
                answers,
                exports,
            } = &mut *guard;
            // Nobody is listening on a disconnected connection.
            let disconnected = connection.is_err();
            match answers.find_mut(self.id) {
                None => {
                    errors.push(Error::failed(format!(
                        "Return for answer {} that is no longer in the answer table",
                        self.id
                    )));
                    None
                }
                Some(answer) => {
                    answer.err = result.as_ref().err().cloned();
                    pipeline = answer.pipeline.take();
                    answer.state.mark_results_ready();

                    let mut session = answer.session.take();
                    let mut abandon = false;
                    match (result, session.as_mut()) {
                        (_, None) => {
                            errors.push(Error::failed(format!(
                                "answer {} has no return message to send",
                                self.id
                            )));
                        }
                        (Ok(()), Some(session)) => {
                            let body = session.get_body();
                            if body.get_results_mut().is_err() {
                                // A call with no results still returns an empty payload.
                                if let Err(e) = body.init_results() {
                                    errors.push(Error::failed(format!("send return: {e}")));
                                }
                            }
                            if !disconnected {
                                match exports.write_descriptors(body) {
                                    Ok(ids) => answer.result_exports = ids,
                                    // Don't fail to send the return if the cap table isn't fully filled.
                                    Err(e) => {
                                        errors.push(Error::failed(format!("send return: {e}")))
                                    }
                                }
                            }
                            answer.results = body.results_reader();
                        }
                        (Err(e), Some(session)) => {
                            let (type_, reason) = from_error(&e);
                            let body = session.get_body();
                            let written = body.init_exception(type_).map(|_| ());
                            let written = written.and_then(|()| body.set_exception_reason(&reason));
                            if let Err(e) = written {
                                errors.push(Error::failed(format!("send exception: {e}")));
                                abandon = true;
                            }
                        }
                    }

                    if abandon || disconnected {
                        discarded = session.take();
                    }

                    Some(BegunReturn {
                        session,
                        finish_received: answer.state.finish_received(),
                        forwards: answer.forwards.clone(),
                    })
                }
            }
        };
        drop(discarded);
        drop(pipeline);
        for e in errors {
            state.report(e);
        }
        begun
    }

    // Marks the `Return` as sent, and removes the answer if the `Finish` is already in.
    fn end_return(&self, finish_received: bool) {
        let doomed = {
            let mut tables = self.connection_state.tables.lock();
            match tables.answers.find_mut(self.id) {
                Some(answer) => {
                    let lifecycle = answer.state.mark_return_sent();
                    debug_assert!(!finish_received || lifecycle == Lifecycle::Done);
                    if lifecycle == Lifecycle::Done {
                        tables.answers.remove(self.id)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if doomed.is_some() {
            log::trace!("answer {}: released after return", self.id);
        }
        // Result capabilities are released here, outside the connection mutex.
        drop(doomed);
    }
}

impl Drop for AnswerHandle {
    fn drop(&mut self) {
        match self.stage {
            Stage::Building => self.cancel_return(),
            // The `send_return()` future was dropped mid-send, taking the message with it.
            Stage::Sending { finish_received } => self.end_return(finish_received),
            Stage::Returned => (),
        }
    }
}
