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

//! Registry of event formats sharing the same decoding settings.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    abi::{Abi, Endianness, LongSize},
    buffer::FieldError,
    cinterp::Value,
    event::{CommonSplit, EventDesc, EventId, FieldFmt, FormatError, StructFmt},
    logging::{Log, LogLevel, Logger},
    print::PrintError,
};

/// Name of the common field holding the [EventId] of a record.
const COMMON_TYPE: &str = "common_type";

/// Set of registered events along with the settings used to decode their records.
///
/// Events are owned by the session and addressed by their [EventId]. Registration needs
/// `&mut self` while decoding and rendering only need `&self`, so a fully populated session can
/// be shared between threads.
#[derive(Debug, Default)]
pub struct Session {
    abi: Abi,
    log: Log,
    common_split: CommonSplit,
    common: Option<StructFmt>,
    events: Vec<EventDesc>,
    ids: BTreeMap<EventId, usize>,
}

impl Session {
    #[inline]
    pub fn new(abi: Abi) -> Self {
        Session {
            abi,
            ..Default::default()
        }
    }

    #[inline]
    pub fn abi(&self) -> &Abi {
        &self.abi
    }

    /// Set the size of the *long* type. [None] makes any decoding depending on it fail.
    pub fn set_long_size(&mut self, long_size: Option<LongSize>) {
        self.abi.long_size = long_size;
        self.reset_caches();
    }

    pub fn set_endianness(&mut self, endianness: Endianness) {
        self.abi.endianness = endianness;
        self.reset_caches();
    }

    // Compiled print fmts have sizeof() folded with the previous ABI.
    fn reset_caches(&mut self) {
        for desc in &mut self.events {
            desc.reset_cache();
        }
    }

    #[inline]
    pub fn log(&self) -> &Log {
        &self.log
    }

    #[inline]
    pub fn set_log_level(&mut self, level: LogLevel) {
        self.log.set_level(level)
    }

    #[inline]
    pub fn reset_log_level(&mut self) {
        self.log.reset_level()
    }

    #[inline]
    pub fn set_logger(&mut self, logger: Arc<dyn Logger>) {
        self.log.set_logger(logger)
    }

    /// Set how the fields of the events registered from now on are split between common and
    /// event-specific fields.
    #[inline]
    pub fn set_common_split(&mut self, split: CommonSplit) {
        self.common_split = split
    }

    /// Set the common fields of the events registered from now on whose format does not carry
    /// its own common fields. `fields` is a list of `field:` lines.
    pub fn set_common_fields<I: AsRef<[u8]>>(&mut self, fields: I) -> Result<(), FormatError> {
        self.common = Some(StructFmt::parse(fields.as_ref())?);
        Ok(())
    }

    /// Parse and register an event format. An event already registered with the same ID is
    /// replaced.
    pub fn register_event<I: AsRef<[u8]>>(
        &mut self,
        format: I,
        system: &str,
    ) -> Result<EventId, FormatError> {
        let mut desc = EventDesc::parse_with(format, system, self.common_split)?;
        if desc.common.is_empty() {
            if let Some(common) = &self.common {
                desc.common = common.clone();
            }
        }

        let id = desc.id;
        match self.ids.get(&id).and_then(|idx| self.events.get_mut(*idx)) {
            Some(old) => {
                self.log.warn(format_args!(
                    "event ID {id} of {}:{} replaced by {}:{}",
                    old.system, old.name, desc.system, desc.name
                ));
                *old = desc;
            }
            None => {
                self.ids.insert(id, self.events.len());
                self.events.push(desc);
            }
        }
        Ok(id)
    }

    /// Find an event by system and name.
    pub fn find_event(&self, system: &str, name: &str) -> Option<EventId> {
        self.events
            .iter()
            .find(|desc| desc.system == system && desc.name == name)
            .map(|desc| desc.id)
    }

    /// Find an event by name in any system.
    pub fn find_event_by_name(&self, name: &str) -> Option<EventId> {
        self.events
            .iter()
            .find(|desc| desc.name == name)
            .map(|desc| desc.id)
    }

    #[inline]
    pub fn event(&self, id: EventId) -> Option<&EventDesc> {
        self.events.get(*self.ids.get(&id)?)
    }

    /// Registered events, in ID order.
    pub fn events(&self) -> impl Iterator<Item = &EventDesc> {
        self.ids.values().filter_map(|idx| self.events.get(*idx))
    }

    /// Event-specific field of the event, or a common field if no event-specific field has
    /// that name.
    #[inline]
    pub fn find_any_field(&self, id: EventId, name: &str) -> Option<&FieldFmt> {
        self.event(id)?.find_any_field(name)
    }

    #[inline]
    pub fn find_field(&self, id: EventId, name: &str) -> Option<&FieldFmt> {
        self.event(id)?.find_field(name)
    }

    #[inline]
    pub fn find_common_field(&self, id: EventId, name: &str) -> Option<&FieldFmt> {
        self.event(id)?.find_common_field(name)
    }

    /// Identify the event of `record` from its `common_type` field.
    pub fn event_of_record(&self, record: &[u8]) -> Result<&EventDesc, PrintError> {
        let field = self
            .common
            .as_ref()
            .and_then(|common| common.field_by_name(COMMON_TYPE))
            .or_else(|| {
                self.events
                    .iter()
                    .find_map(|desc| desc.find_common_field(COMMON_TYPE))
            })
            .ok_or(PrintError::NoEventType)?;

        let id = match field.decode(record, &self.abi)? {
            Value::U64Scalar(x) => x,
            Value::I64Scalar(x) => x as u64,
            _ => return Err(PrintError::NoEventType),
        };
        EventId::try_from(id)
            .ok()
            .and_then(|id| self.event(id))
            .ok_or(PrintError::UnknownEvent(id))
    }

    /// Print `record` according to the print fmt of its event.
    pub fn print_event<W>(&self, record: &[u8], out: &mut W) -> Result<(), PrintError>
    where
        W: core::fmt::Write + ?Sized,
    {
        let desc = self.event_of_record(record)?;
        desc.print_info(record, &self.abi, &self.log, out)
    }

    /// Render `record` of the event `id` to a string. Values that cannot be decoded are
    /// replaced by [crate::error::FAILED_TO_PARSE].
    pub fn render(&self, id: EventId, record: &[u8]) -> Option<String> {
        let desc = self.event(id)?;
        Some(desc.render(record, &self.abi, &self.log))
    }

    /// Decode the given field of `record`.
    pub fn decode_field<'a>(
        &self,
        id: EventId,
        name: &str,
        record: &'a [u8],
    ) -> Option<Result<Value<'a>, FieldError>> {
        let field = self.find_any_field(id, name)?;
        Some(field.decode(record, &self.abi))
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use itertools::Itertools as _;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        cparser::{CParseError, MAX_EXPR_DEPTH, MAX_NESTING},
        event::tests::{CPUMASK_FMT, DYN_STR_FMT, LEGACY_FMT, sizeof_fmt},
        logging::tests::RecordingLogger,
        print::{MAX_PRINT_WIDTH, PrintFmtError},
    };

    const COMMON_FIELDS: &str = "\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;
";

    fn session(long_size: Option<LongSize>) -> Session {
        Session::new(Abi::new(Endianness::Little, long_size))
    }

    fn dyn_str_record() -> Vec<u8> {
        let mut record = vec![1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 16, 0, 6, 0];
        record.extend(b"hello\0");
        record.extend([0, 0]);
        record
    }

    fn cpumask_record(mask: [u8; 8]) -> Vec<u8> {
        let mut record = vec![3, 0, 0, 0, 0, 0, 0, 0, 16, 0, 8, 0, 0, 0, 0, 0];
        record.extend(mask);
        record
    }

    fn sizeof_record(id: EventId) -> Vec<u8> {
        let mut record = vec![0; 32];
        record[..2].copy_from_slice(&id.to_le_bytes());
        record
    }

    #[test]
    fn send_sync_test() {
        fn check<T: Send + Sync>() {}
        check::<Session>();
    }

    #[test]
    fn registry_test() {
        let mut session = session(Some(LongSize::Bits64));
        assert_eq!(session.register_event(DYN_STR_FMT, "irq"), Ok(1));
        assert_eq!(session.register_event(LEGACY_FMT, "irq"), Ok(2));
        assert_eq!(session.register_event(CPUMASK_FMT, "sched"), Ok(3));

        assert_eq!(session.find_event("irq", "dyn_str"), Some(1));
        assert_eq!(session.find_event("sched", "dyn_str"), None);
        assert_eq!(session.find_event_by_name("cpumask"), Some(3));
        assert_eq!(
            session.events().map(|desc| desc.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        assert_eq!(session.find_field(1, "irq").map(|f| f.offset), Some(8));
        assert_eq!(session.find_field(1, "common_pid"), None);
        assert_eq!(
            session.find_common_field(1, "common_pid").map(|f| f.offset),
            Some(4)
        );
        assert_eq!(
            session.find_any_field(1, "common_pid").map(|f| f.offset),
            Some(4)
        );
        assert_eq!(session.find_any_field(1, "nope"), None);
        assert_eq!(session.find_any_field(42, "irq"), None);

        // Parsing is independent of registration.
        let desc = EventDesc::parse(DYN_STR_FMT, "irq").unwrap();
        assert_eq!(session.event(1), Some(&desc));
        assert_eq!(EventDesc::parse(DYN_STR_FMT, "irq").unwrap(), desc);
    }

    #[test]
    fn register_error_test() {
        let mut session = session(Some(LongSize::Bits64));
        let no_print_fmt = DYN_STR_FMT
            .lines()
            .filter(|line| !line.starts_with("print fmt"))
            .join("\n");
        assert!(matches!(
            session.register_event(no_print_fmt, "irq"),
            Err(FormatError::Malformed(_))
        ));
        assert_eq!(session.events().count(), 0);
    }

    #[test]
    fn replace_event_test() {
        let logger = Arc::new(RecordingLogger::default());
        let mut session = session(Some(LongSize::Bits64));
        session.set_logger(logger.clone());
        session.set_log_level(LogLevel::Warning);

        session.register_event(DYN_STR_FMT, "irq").unwrap();
        let renamed = DYN_STR_FMT.replace("name: dyn_str", "name: other");
        assert_eq!(session.register_event(renamed, "irq"), Ok(1));

        assert_eq!(session.events().count(), 1);
        assert_eq!(session.find_event("irq", "other"), Some(1));
        assert_eq!(session.find_event("irq", "dyn_str"), None);
        assert_eq!(
            logger.messages(),
            vec!["warning: event ID 1 of irq:dyn_str replaced by irq:other".to_string()]
        );
    }

    #[test]
    fn log_level_test() {
        let logger = Arc::new(RecordingLogger::default());
        let mut session = session(Some(LongSize::Bits64));
        session.set_logger(logger.clone());
        let id = session.register_event(sizeof_fmt(10), "test").unwrap();

        // The stray parenthesis is only reported at the warning level.
        session.render(id, &sizeof_record(id));
        assert_eq!(logger.messages(), Vec::<String>::new());

        session.set_log_level(LogLevel::All);
        session.set_long_size(Some(LongSize::Bits64));
        session.render(id, &sizeof_record(id));
        let messages = logger.messages();
        assert_eq!(messages.len(), 1);
        assert!(
            messages[0].starts_with("warning: test:sizeof10: ignoring trailing text"),
            "{}",
            messages[0]
        );

        session.reset_log_level();
        assert_eq!(session.log().level(), LogLevel::Critical);
    }

    #[test]
    fn dyn_str_test() {
        let mut session = session(Some(LongSize::Bits64));
        session.register_event(DYN_STR_FMT, "test").unwrap();
        let record = dyn_str_record();

        assert_eq!(
            session.decode_field(1, "name", &record),
            Some(Ok(Value::Str(Cow::Borrowed("hello"))))
        );
        assert_eq!(
            session.render(1, &record),
            Some("irq=0 handler=hello".into())
        );

        let mut out = String::new();
        assert_eq!(session.print_event(&record, &mut out), Ok(()));
        assert_eq!(out, "irq=0 handler=hello");

        // Big endian record
        session.set_endianness(Endianness::Big);
        let mut record = vec![0, 1, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xd6, 0, 6, 0, 16];
        record.extend(b"world\0");
        assert_eq!(
            session.render(1, &record),
            Some("irq=-42 handler=world".into())
        );
    }

    #[test]
    fn legacy_test() {
        let mut session = session(Some(LongSize::Bits64));
        session.register_event(LEGACY_FMT, "test").unwrap();
        let mut record = vec![2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 16, 0, 0, 0];
        record.extend(b"hello\0\0\0\0");

        assert_eq!(
            session.render(2, &record),
            Some("irq=0 handler=hello".into())
        );
    }

    #[test]
    fn cpumask_test() {
        let mut session = session(Some(LongSize::Bits64));
        session.register_event(CPUMASK_FMT, "test").unwrap();

        let test = |mask: [u8; 8], expected: &str| {
            let record = cpumask_record(mask);
            let mut out = String::new();
            assert_eq!(session.print_event(&record, &mut out), Ok(()));
            assert_eq!(out, format!("cpumask={expected}"));
        };

        test([0xff; 8], "0-63");
        test([0; 8], "");
        test([0x55; 8], &(0..64).step_by(2).join(","));
        test([0x01, 0x80, 0, 0, 0, 0, 0, 0], "0,15");
        test([0x01, 0, 0x80, 0, 0, 0, 0, 0], "0,23");
        test([0x01, 0, 0, 0, 0, 0, 0, 0x80], "0,63");

        let field = session.find_field(3, "cpumask").unwrap();
        let mut raw = String::new();
        field
            .print_content(&cpumask_record([0xff; 8]), session.abi(), &mut raw)
            .unwrap();
        assert_eq!(raw, "ARRAY[ff, ff, ff, ff, ff, ff, ff, ff]");
    }

    #[test]
    fn sizeof_test() {
        let mut session = session(Some(LongSize::Bits64));
        let id = session.register_event(sizeof_fmt(10), "test").unwrap();
        let record = sizeof_record(id);

        assert_eq!(
            session.render(id, &record),
            Some(
                "int=4 unsigned=4 unsigned int=4 long=8 unsigned long=8 long long=8 unsigned long long=8 s4=4 u4=4 s8=8 u8=8".into()
            )
        );

        session.set_long_size(Some(LongSize::Bits32));
        assert_eq!(
            session.render(id, &record),
            Some(
                "int=4 unsigned=4 unsigned int=4 long=4 unsigned long=4 long long=8 unsigned long long=8 s4=4 u4=4 s8=8 u8=8".into()
            )
        );

        session.set_long_size(None);
        let mut out = String::new();
        assert_eq!(
            session.print_event(&record, &mut out),
            Err(PrintError::PrintFmt(Box::new(PrintFmtError::Field(
                Box::new(FieldError::UndefinedLongSize)
            ))))
        );
        assert_eq!(out, "[FAILED TO PARSE] s4=0 u4=0 s8=0 u8=0x0");
    }

    #[test]
    fn sizeof_sessions_test() {
        let mut session64 = session(Some(LongSize::Bits64));
        let mut session32 = session(Some(LongSize::Bits32));
        session64.register_event(sizeof_fmt(11), "test").unwrap();
        session32.register_event(sizeof_fmt(12), "test").unwrap();

        let long = |session: &Session, id| {
            session
                .render(id, &sizeof_record(id))
                .unwrap()
                .split(' ')
                .find(|s| s.starts_with("long="))
                .map(String::from)
        };
        assert_eq!(long(&session64, 11), Some("long=8".into()));
        assert_eq!(long(&session32, 12), Some("long=4".into()));
    }

    #[test]
    fn unknown_field_test() {
        let mut session = session(Some(LongSize::Bits64));
        let fmt = DYN_STR_FMT.replace("REC->irq", "REC->nope");
        session.register_event(fmt, "test").unwrap();

        let mut out = String::new();
        assert_eq!(
            session.print_event(&dyn_str_record(), &mut out),
            Err(PrintError::PrintFmt(Box::new(PrintFmtError::UnknownField(
                "nope".into()
            ))))
        );
        assert_eq!(out, "[FAILED TO PARSE] irq=0 name=hello");
    }

    #[test]
    fn print_fmt_error_test() {
        let test = |print_fmt: &str, expected: PrintFmtError| {
            let mut session = session(Some(LongSize::Bits64));
            let fmt = DYN_STR_FMT.replace(
                "\"irq=%d handler=%s\", REC->irq, __get_str(name)",
                print_fmt,
            );
            let id = session.register_event(fmt, "test").unwrap();
            let desc = session.event(id).unwrap();
            assert_eq!(
                desc.print_fmt(session.abi(), session.log()).map(|_| ()),
                Err(expected)
            );
        };

        test(
            "\"irq=%d handler=%s\", REC->irq",
            PrintFmtError::ArityMismatch {
                context: "print fmt".into(),
                expected: 2,
                found: 1,
            },
        );
        test(
            "\"%s\", __get_nothing(name)",
            PrintFmtError::UnknownAccessor("__get_nothing".into()),
        );
    }

    #[test]
    fn untrusted_print_fmt_test() {
        let print = |print_fmt: &str, record: &[u8]| {
            let mut session = session(Some(LongSize::Bits64));
            let fmt = DYN_STR_FMT.replace(
                "\"irq=%d handler=%s\", REC->irq, __get_str(name)",
                print_fmt,
            );
            session.register_event(fmt, "test").unwrap();
            let mut out = String::new();
            let res = session.print_event(record, &mut out);
            (out, res)
        };
        let syntax_error = |err: CParseError| -> Result<(), PrintError> {
            Err(PrintError::PrintFmt(Box::new(PrintFmtError::SyntaxError(
                Box::new(err),
            ))))
        };
        let record = dyn_str_record();

        let nested = |depth: usize| {
            format!(
                "\"out=%d\", {}REC->irq + 1{}",
                "(".repeat(depth),
                ")".repeat(depth)
            )
        };
        assert_eq!(print(&nested(6), &record), ("out=1".into(), Ok(())));
        assert_eq!(
            print(&nested(200), &record),
            (
                "[FAILED TO PARSE] irq=0 name=hello".into(),
                syntax_error(CParseError::NestingTooDeep(MAX_NESTING))
            )
        );

        let chain = format!("\"out=%d\", REC->irq{}", " | 1".repeat(200));
        assert_eq!(
            print(&chain, &record),
            (
                "[FAILED TO PARSE] irq=0 name=hello".into(),
                syntax_error(CParseError::NestingTooDeep(MAX_EXPR_DEPTH))
            )
        );

        // Width taken from the record itself.
        let mut record = record;
        record[8..12].copy_from_slice(&70000i32.to_le_bytes());
        let (out, res) = print("\"[%*d]\", REC->irq, REC->irq", &record);
        assert_eq!(res, Ok(()));
        assert_eq!(
            out,
            format!("[{}70000]", " ".repeat(MAX_PRINT_WIDTH - 5))
        );

        record[8..12].copy_from_slice(&(-70000i32).to_le_bytes());
        let (out, _) = print("\"[%*d]\", REC->irq, REC->irq", &record);
        assert_eq!(
            out,
            format!("[-70000{}]", " ".repeat(MAX_PRINT_WIDTH - 6))
        );
    }

    #[test]
    fn bad_record_test() {
        let mut session = session(Some(LongSize::Bits64));
        session.register_event(DYN_STR_FMT, "test").unwrap();
        session.register_event(CPUMASK_FMT, "test").unwrap();
        let record = dyn_str_record();

        let mut out = String::new();
        assert!(matches!(
            session.print_event(&[], &mut out),
            Err(PrintError::Field(_))
        ));
        assert_eq!(out, "");

        let mut unknown = record.clone();
        unknown[0] = 42;
        assert_eq!(
            session.print_event(&unknown, &mut out),
            Err(PrintError::UnknownEvent(42))
        );

        // The string ends at byte 22, followed by padding.
        for len in 0..22 {
            let rendered = session.render(1, &record[..len]).unwrap();
            assert!(rendered.contains("[FAILED TO PARSE]"), "{len}: {rendered}");
        }

        // Location pointing past the end of the record
        let mut record = cpumask_record([0xff; 8]);
        record[8] = 20;
        assert_eq!(
            session.decode_field(3, "cpumask", &record),
            Some(Err(FieldError::OutOfBounds {
                offset: 20,
                size: 8,
                len: 24
            }))
        );
        assert_eq!(session.render(3, &record), Some("cpumask=[FAILED TO PARSE]".into()));
    }

    #[test]
    fn common_fields_test() {
        let mut session = session(Some(LongSize::Bits64));
        session.set_common_fields(COMMON_FIELDS).unwrap();
        session.set_common_split(CommonSplit::None);

        let id = session.register_event(DYN_STR_FMT, "test").unwrap();
        let desc = session.event(id).unwrap();
        assert_eq!(desc.common.len(), 4);
        // With no split, the common fields of the format are event-specific and shadow the
        // shared ones.
        assert_eq!(desc.fields.len(), 6);
        assert_eq!(
            session.render(id, &dyn_str_record()),
            Some("irq=0 handler=hello".into())
        );

        let mut session = Session::default();
        session.set_common_fields(COMMON_FIELDS).unwrap();
        session.set_common_split(CommonSplit::Count(0));
        let id = session.register_event(DYN_STR_FMT, "test").unwrap();
        assert_eq!(
            session.find_common_field(id, "common_type").map(|f| f.size),
            Some(2)
        );
    }
}
