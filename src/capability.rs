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

//! Capability references as seen by the answer table.

use std::fmt;

use crate::join::DeliveryAck;

/// The underlying implementation of a capability.
///
/// Each `Box<dyn ClientHook>` owns exactly one reference. Dropping the box releases that
/// reference.
pub trait ClientHook: Send + Sync {
    /// Produces a new reference to the same capability.
    fn add_ref(&self) -> Box<dyn ClientHook>;

    /// Returns a value that is the same for every reference to this capability. Used to
    /// deduplicate exports.
    fn get_ptr(&self) -> usize;
}

/// An owned reference to a capability.
///
/// `Client` is not `Clone`. Passing a `Client` by value transfers its reference;
/// `add_ref()` mints another one.
pub struct Client {
    pub hook: Box<dyn ClientHook>,
}

impl Client {
    pub fn new(hook: Box<dyn ClientHook>) -> Self {
        Self { hook }
    }

    pub fn add_ref(&self) -> Self {
        Self {
            hook: self.hook.add_ref(),
        }
    }

    pub fn get_ptr(&self) -> usize {
        self.hook.get_ptr()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Client({:#x})", self.get_ptr())
    }
}

/// One step of the path from a call's result struct to the capability a pipelined call
/// is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineOp {
    Noop,
    GetPointerField(u16),
}

/// A call received on a promised answer, i.e. addressed to a capability inside results
/// that may not exist yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelinedCall {
    /// The question ID the caller assigned to this pipelined call.
    pub question_id: u32,
    pub interface_id: u64,
    pub method_id: u16,
    pub transform: Vec<PipelineOp>,
}

/// Receives pipelined calls on behalf of a call that is still executing.
///
/// The implementation must hold on to `ack` until it has taken responsibility for the call
/// (for example by queueing it on the in-progress computation), and then drop it. `Return`
/// on the answer does not complete until every such acknowledgement has been dropped.
pub trait PipelineCaller: Send + Sync {
    fn pipeline_call(&self, call: PipelinedCall, ack: DeliveryAck);
}
