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

//! The outgoing RPC message, as far as the answer table needs to see it.
//!
//! Only the parts of the `rpc.capnp` `Message` union that a callee sends are modeled: a
//! `Return` (results payload or exception) or an `Abort`. Objects are allocated out of a word
//! budget the same way they would be allocated out of message segments, so running
//! out of space is an ordinary, reportable error.

use std::sync::Arc;

use capnp::{Error, Result};
use parking_lot::Mutex;

use crate::capability::{Client, PipelineOp};
use crate::rpc::{AnswerId, ExportId};

// Sizes in words, mirroring the struct layouts in rpc.capnp.
const MESSAGE_WORDS: u32 = 2;
const RETURN_WORDS: u32 = 3;
const PAYLOAD_WORDS: u32 = 2;
const EXCEPTION_WORDS: u32 = 3;
const CAP_DESCRIPTOR_WORDS: u32 = 2;
const LIST_TAG_WORDS: u32 = 1;

/// The size of a struct: data section words plus pointer section words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectSize {
    pub data: u16,
    pub pointers: u16,
}

impl ObjectSize {
    pub fn total(&self) -> u32 {
        u32::from(self.data) + u32::from(self.pointers)
    }
}

/// A pointer stored in a payload or in a struct's pointer section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pointer {
    Null,
    /// Index of a struct in the message arena.
    Struct(u32),
    /// Index into the message's capability table.
    Capability(u32),
}

struct StructData {
    data: Vec<u64>,
    pointers: Vec<Pointer>,
}

struct Arena {
    words_used: u64,
    word_limit: Option<u64>,
    structs: Vec<StructData>,
    cap_table: Vec<Option<Client>>,
}

impl Arena {
    fn allocate(&mut self, words: u32) -> Result<()> {
        let wanted = self.words_used + u64::from(words);
        if let Some(limit) = self.word_limit {
            if wanted > limit {
                return Err(Error::failed(format!(
                    "message exceeds its size limit of {limit} words"
                )));
            }
        }
        self.words_used = wanted;
        Ok(())
    }

    fn new_struct(&mut self, size: ObjectSize) -> Result<u32> {
        self.allocate(size.total())?;
        self.structs.push(StructData {
            data: vec![0; usize::from(size.data)],
            pointers: vec![Pointer::Null; usize::from(size.pointers)],
        });
        Ok(self.structs.len() as u32 - 1)
    }

    fn add_cap(&mut self, cap: Client) -> u32 {
        self.cap_table.push(Some(cap));
        self.cap_table.len() as u32 - 1
    }
}

/// Exception type, as in `rpc.capnp`'s `Exception.Type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionType {
    Failed,
    Overloaded,
    Disconnected,
    Unimplemented,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exception {
    pub reason: String,
    pub type_: ExceptionType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapDescriptor {
    None,
    SenderHosted(ExportId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    pub content: Pointer,
    pub cap_table: Vec<CapDescriptor>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReturnWhich {
    /// Neither results nor an exception has been initialized yet.
    Unset,
    Results(Payload),
    Exception(Exception),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Return {
    pub answer_id: AnswerId,
    pub release_param_caps: bool,
    pub which: ReturnWhich,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Return(Return),
    Abort(Exception),
}

/// An outgoing message under construction.
pub struct Builder {
    arena: Arc<Mutex<Arena>>,
    root: Option<Message>,
}

impl Builder {
    /// Creates an empty message. `word_limit` bounds the total size of the message;
    /// `None` means unbounded.
    pub fn new(word_limit: Option<u64>) -> Self {
        Self {
            arena: Arc::new(Mutex::new(Arena {
                words_used: 0,
                word_limit,
                structs: Vec::new(),
                cap_table: Vec::new(),
            })),
            root: None,
        }
    }

    pub fn new_default() -> Self {
        Self::new(None)
    }

    pub fn size_in_words(&self) -> u64 {
        self.arena.lock().words_used
    }

    pub fn get_root(&self) -> Option<&Message> {
        self.root.as_ref()
    }

    pub fn init_return(&mut self, answer_id: AnswerId) -> Result<&mut Return> {
        self.arena.lock().allocate(MESSAGE_WORDS + RETURN_WORDS)?;
        self.root = Some(Message::Return(Return {
            answer_id,
            release_param_caps: true,
            which: ReturnWhich::Unset,
        }));
        self.get_return_mut()
    }

    pub fn init_abort(&mut self, type_: ExceptionType, reason: &str) -> Result<()> {
        self.arena
            .lock()
            .allocate(MESSAGE_WORDS + EXCEPTION_WORDS + text_words(reason))?;
        self.root = Some(Message::Abort(Exception {
            reason: reason.to_string(),
            type_,
        }));
        Ok(())
    }

    pub fn get_return(&self) -> Option<&Return> {
        match self.root {
            Some(Message::Return(ref ret)) => Some(ret),
            _ => None,
        }
    }

    pub fn get_return_mut(&mut self) -> Result<&mut Return> {
        match self.root {
            Some(Message::Return(ref mut ret)) => Ok(ret),
            _ => Err(Error::failed("message is not a Return".to_string())),
        }
    }

    /// Switches the `Return` union to a fresh, empty results payload. Any previous
    /// content is orphaned.
    pub fn init_results(&mut self) -> Result<&mut Payload> {
        self.get_return_mut()?;
        self.arena.lock().allocate(PAYLOAD_WORDS)?;
        let ret = self.get_return_mut()?;
        ret.which = ReturnWhich::Results(Payload {
            content: Pointer::Null,
            cap_table: Vec::new(),
        });
        match ret.which {
            ReturnWhich::Results(ref mut payload) => Ok(payload),
            _ => unreachable!(),
        }
    }

    pub fn get_results_mut(&mut self) -> Result<&mut Payload> {
        match self.get_return_mut()?.which {
            ReturnWhich::Results(ref mut payload) => Ok(payload),
            _ => Err(Error::failed("Return does not hold results".to_string())),
        }
    }

    /// Switches the `Return` union to an exception with the given type and reason.
    pub fn init_exception(&mut self, type_: ExceptionType) -> Result<&mut Exception> {
        self.get_return_mut()?;
        self.arena.lock().allocate(EXCEPTION_WORDS)?;
        let ret = self.get_return_mut()?;
        ret.which = ReturnWhich::Exception(Exception {
            reason: String::new(),
            type_,
        });
        match ret.which {
            ReturnWhich::Exception(ref mut exc) => Ok(exc),
            _ => unreachable!(),
        }
    }

    pub fn set_exception_reason(&mut self, reason: &str) -> Result<()> {
        self.arena.lock().allocate(text_words(reason))?;
        match self.get_return_mut()?.which {
            ReturnWhich::Exception(ref mut exc) => {
                exc.reason = reason.to_string();
                Ok(())
            }
            _ => Err(Error::failed("Return does not hold an exception".to_string())),
        }
    }

    /// Allocates space for a payload capability table of `len` descriptors, all `None`.
    pub fn init_cap_table(&mut self, len: u32) -> Result<()> {
        self.arena
            .lock()
            .allocate(LIST_TAG_WORDS + len * CAP_DESCRIPTOR_WORDS)?;
        self.get_results_mut()?.cap_table = vec![CapDescriptor::None; len as usize];
        Ok(())
    }

    /// Allocates a struct in this message. The struct is not reachable until a pointer
    /// to it is stored somewhere.
    pub fn new_struct(&mut self, size: ObjectSize) -> Result<StructBuilder> {
        let index = self.arena.lock().new_struct(size)?;
        Ok(StructBuilder {
            arena: self.arena.clone(),
            index,
        })
    }

    /// Adds a capability to the message's capability table, taking ownership of the
    /// reference. Returns the table index.
    pub fn add_cap(&mut self, cap: Client) -> u32 {
        self.arena.lock().add_cap(cap)
    }

    pub fn cap_table_len(&self) -> u32 {
        self.arena.lock().cap_table.len() as u32
    }

    /// Runs `f` over the message's capability table.
    pub fn with_cap_table<R>(&self, f: impl FnOnce(&[Option<Client>]) -> R) -> R {
        f(&self.arena.lock().cap_table)
    }

    /// Returns a new reference to the capability at `index`, if the slot is filled.
    pub fn get_cap(&self, index: u32) -> Option<Client> {
        self.arena
            .lock()
            .cap_table
            .get(index as usize)
            .and_then(|slot| slot.as_ref().map(Client::add_ref))
    }

    /// Returns a reader over whatever results content is currently attached.
    pub fn results_reader(&self) -> Option<ResultsReader> {
        match self.get_return()?.which {
            ReturnWhich::Results(ref payload) => Some(ResultsReader {
                arena: self.arena.clone(),
                content: payload.content,
            }),
            _ => None,
        }
    }
}

fn text_words(text: &str) -> u32 {
    // NUL-terminated, rounded up to whole words.
    ((text.len() + 1 + 7) / 8) as u32
}

/// A handle to a struct inside a message, used to fill in its fields.
#[derive(Clone)]
pub struct StructBuilder {
    arena: Arc<Mutex<Arena>>,
    index: u32,
}

impl StructBuilder {
    pub fn pointer(&self) -> Pointer {
        Pointer::Struct(self.index)
    }

    pub fn get_data_field(&self, offset: u16) -> u64 {
        let arena = self.arena.lock();
        arena.structs[self.index as usize]
            .data
            .get(usize::from(offset))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_data_field(&self, offset: u16, value: u64) -> Result<()> {
        let mut arena = self.arena.lock();
        match arena.structs[self.index as usize]
            .data
            .get_mut(usize::from(offset))
        {
            Some(word) => {
                *word = value;
                Ok(())
            }
            None => Err(Error::failed(format!(
                "data offset {offset} is out of bounds"
            ))),
        }
    }

    pub fn get_pointer_field(&self, index: u16) -> Pointer {
        let arena = self.arena.lock();
        arena.structs[self.index as usize]
            .pointers
            .get(usize::from(index))
            .copied()
            .unwrap_or(Pointer::Null)
    }

    fn set_pointer_field(arena: &mut Arena, target: u32, index: u16, value: Pointer) -> Result<()> {
        match arena.structs[target as usize].pointers.get_mut(usize::from(index)) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::failed(format!(
                "pointer index {index} is out of bounds"
            ))),
        }
    }

    /// Stores a capability in pointer field `index`, adding it to the message's
    /// capability table.
    pub fn set_capability_field(&self, index: u16, cap: Client) -> Result<()> {
        let mut arena = self.arena.lock();
        if usize::from(index) >= arena.structs[self.index as usize].pointers.len() {
            return Err(Error::failed(format!(
                "pointer index {index} is out of bounds"
            )));
        }
        let cap_index = arena.add_cap(cap);
        Self::set_pointer_field(&mut arena, self.index, index, Pointer::Capability(cap_index))
    }

    /// Allocates a struct and stores a pointer to it in pointer field `index`.
    pub fn init_struct_field(&self, index: u16, size: ObjectSize) -> Result<StructBuilder> {
        let mut arena = self.arena.lock();
        if usize::from(index) >= arena.structs[self.index as usize].pointers.len() {
            return Err(Error::failed(format!(
                "pointer index {index} is out of bounds"
            )));
        }
        let child = arena.new_struct(size)?;
        Self::set_pointer_field(&mut arena, self.index, index, Pointer::Struct(child))?;
        Ok(StructBuilder {
            arena: self.arena.clone(),
            index: child,
        })
    }
}

/// Read access to a results payload, kept alive by an answer after its `Return` has been
/// handed to the transport so that pipelined calls can be resolved against it. Holding a
/// reader keeps the message's capabilities alive.
pub struct ResultsReader {
    arena: Arc<Mutex<Arena>>,
    content: Pointer,
}

impl ResultsReader {
    pub fn content(&self) -> Pointer {
        self.content
    }

    /// Follows `ops` from the results content and returns a new reference to the
    /// capability found there.
    pub fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Result<Client> {
        let arena = self.arena.lock();
        let mut pointer = self.content;
        for op in ops {
            match *op {
                PipelineOp::Noop => (),
                PipelineOp::GetPointerField(idx) => {
                    pointer = match pointer {
                        Pointer::Struct(s) => arena.structs[s as usize]
                            .pointers
                            .get(usize::from(idx))
                            .copied()
                            .unwrap_or(Pointer::Null),
                        Pointer::Null => Pointer::Null,
                        Pointer::Capability(_) => {
                            return Err(Error::failed(
                                "Pipelined call traverses a capability pointer.".to_string(),
                            ));
                        }
                    };
                }
            }
        }
        match pointer {
            Pointer::Capability(cap_index) => match arena.cap_table.get(cap_index as usize) {
                Some(Some(cap)) => Ok(cap.add_ref()),
                _ => Err(Error::failed(format!(
                    "Pipelined call refers to empty capability table slot {cap_index}."
                ))),
            },
            Pointer::Null => Err(Error::failed(
                "Pipelined call on a null pointer.".to_string(),
            )),
            Pointer::Struct(_) => Err(Error::failed(
                "Pipelined call target is a struct, not a capability.".to_string(),
            )),
        }
    }
}
