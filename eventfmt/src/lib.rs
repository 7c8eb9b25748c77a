// SPDX-License-Identifier: Apache-2.0
//
// Copyright (C) 2024, ARM Limited and contributors.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may
// not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Decode Linux kernel trace event formats and the binary records produced against them.
//!
//! An event format, as found in `/sys/kernel/tracing/events/<system>/<name>/format`, is parsed
//! into an [event::EventDesc] describing the layout of the records of that event along with
//! its printk-style print fmt. A [session::Session] holds the registered events and the
//! [abi::Abi] of the machine that produced the records, and renders records the same way the
//! kernel would print them:
//!
//! ```
//! use eventfmt::{
//!     abi::{Abi, Endianness, LongSize},
//!     session::Session,
//! };
//!
//! let format = "name: irq_handler_entry
//! ID: 1
//! format:
//! \tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
//!
//! \tfield:int irq;\toffset:2;\tsize:4;\tsigned:1;
//!
//! print fmt: \"irq=%d\", REC->irq
//! ";
//!
//! let mut session = Session::new(Abi::new(Endianness::Little, Some(LongSize::Bits64)));
//! let id = session.register_event(format, "irq").unwrap();
//! let record = [1, 0, 42, 0, 0, 0];
//! assert_eq!(session.render(id, &record).unwrap(), "irq=42");
//! ```

mod parser;

pub mod abi;
pub mod buffer;
pub mod cinterp;
pub mod cparser;
pub mod error;
pub mod event;
pub mod logging;
pub mod print;
pub mod session;
