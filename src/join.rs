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

//! Tracks pipelined calls that have been handed to a `PipelineCaller` but not yet
//! acknowledged.

use futures::channel::oneshot;
use parking_lot::Mutex;
use std::sync::Arc;

struct Inner {
    in_flight: usize,
    empty_fulfillers: Vec<oneshot::Sender<()>>,
}

impl Inner {
    fn release(&mut self) {
        self.in_flight -= 1;
        if self.in_flight == 0 {
            for f in std::mem::take(&mut self.empty_fulfillers) {
                let _ = f.send(());
            }
        }
    }
}

/// A counter of outstanding deliveries that can be waited on until it drains to zero.
#[derive(Clone)]
pub struct JoinCounter {
    inner: Arc<Mutex<Inner>>,
}

impl JoinCounter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                in_flight: 0,
                empty_fulfillers: Vec::new(),
            })),
        }
    }

    /// Registers one more delivery. The count goes back down when the returned
    /// acknowledgement is dropped.
    pub fn add(&self) -> DeliveryAck {
        self.inner.lock().in_flight += 1;
        DeliveryAck {
            inner: Some(self.inner.clone()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Resolves once every acknowledgement handed out so far has been dropped.
    pub async fn wait_all_acked(&self) {
        let rx = {
            let mut inner = self.inner.lock();
            if inner.in_flight == 0 {
                return;
            }
            let (tx, rx) = oneshot::channel();
            inner.empty_fulfillers.push(tx);
            rx
        };
        // The sender is only ever dropped after being fulfilled.
        let _ = rx.await;
    }
}

impl Default for JoinCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that a pipelined call is still being delivered. Dropping it (or calling `ack()`)
/// signals delivery.
#[must_use = "dropping a DeliveryAck acknowledges the delivery immediately"]
pub struct DeliveryAck {
    inner: Option<Arc<Mutex<Inner>>>,
}

impl DeliveryAck {
    pub fn ack(self) {}
}

impl Drop for DeliveryAck {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.lock().release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::JoinCounter;
    use futures::FutureExt;

    #[test]
    fn empty_counter_is_ready() {
        let counter = JoinCounter::new();
        assert!(counter.wait_all_acked().now_or_never().is_some());
    }

    #[test]
    fn waits_for_every_ack() {
        let counter = JoinCounter::new();
        let a = counter.add();
        let b = counter.add();
        assert_eq!(counter.in_flight(), 2);

        let mut wait = Box::pin(counter.wait_all_acked());
        assert!(wait.as_mut().now_or_never().is_none());

        a.ack();
        let mut wait = Box::pin(counter.wait_all_acked());
        assert!(wait.as_mut().now_or_never().is_none());

        drop(b);
        assert_eq!(counter.in_flight(), 0);
        assert!(wait.now_or_never().is_some());
    }

    #[test]
    fn ack_from_another_thread() {
        let counter = JoinCounter::new();
        let ack = counter.add();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            drop(ack);
        });
        futures::executor::block_on(counter.wait_all_acked());
        assert_eq!(counter.in_flight(), 0);
        handle.join().unwrap();
    }
}
