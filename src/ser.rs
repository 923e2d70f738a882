// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Pickle serialization

use std::io;
use std::rc::Rc;
use std::cell::RefCell;
use std::convert::TryFrom;
use byteorder::{LittleEndian, BigEndian, WriteBytesExt};
use num_bigint::BigInt;
use num_traits::Zero;
use log::{debug, trace};

use crate::consts::*;
use crate::error::{Error, ErrorCode, Result};
use crate::memo::PickleMemo;
use crate::object::{Object, Reduction};
use crate::registry::{ExtensionRegistry, ReducerRegistry};
use crate::value::{Dict, Value};

type PersistentId = Rc<dyn Fn(&Value) -> Result<Option<Value>>>;

/// Options for serializing.
#[derive(Clone)]
pub struct SerOptions {
    proto: u8,
    persistent_id: Option<PersistentId>,
    inst_persistent_id: Option<PersistentId>,
    extensions: Option<Rc<ExtensionRegistry>>,
    reducers: Option<Rc<ReducerRegistry>>,
}

impl SerOptions {
    /// Construct with default options:
    ///
    /// - protocol 2
    /// - no persistent ids
    /// - no extension codes
    /// - objects are reduced by their own hooks
    pub fn new() -> Self {
        SerOptions {
            proto: DEFAULT_PROTOCOL,
            persistent_id: None,
            inst_persistent_id: None,
            extensions: None,
            reducers: None,
        }
    }

    /// Write protocol 0: text only, readable by every unpickler.
    pub fn proto_v0(self) -> Self {
        self.proto(0)
    }

    /// Write protocol 1: binary, without the protocol 2 opcodes.
    pub fn proto_v1(self) -> Self {
        self.proto(1)
    }

    pub fn proto_v2(self) -> Self {
        self.proto(2)
    }

    /// Select a protocol by number.  Numbers above `HIGHEST_PROTOCOL` make
    /// pickling fail.
    pub fn proto(mut self, proto: u8) -> Self {
        self.proto = proto;
        self
    }

    /// Set a hook that is asked first for every value written.  If it
    /// returns an id, the id is written in place of the value, and the
    /// unpickler's persistent_load hook has to supply the value.
    pub fn persistent_id<F>(mut self, hook: F) -> Self
        where F: Fn(&Value) -> Result<Option<Value>> + 'static
    {
        self.persistent_id = Some(Rc::new(hook));
        self
    }

    /// Like `persistent_id`, but only asked for objects that go through
    /// the reduce path and were not written before in the same pickle.
    pub fn inst_persistent_id<F>(mut self, hook: F) -> Self
        where F: Fn(&Value) -> Result<Option<Value>> + 'static
    {
        self.inst_persistent_id = Some(Rc::new(hook));
        self
    }

    /// Write globals registered here with the EXT opcodes (protocol 2).
    pub fn extensions(mut self, registry: Rc<ExtensionRegistry>) -> Self {
        self.extensions = Some(registry);
        self
    }

    /// Reduce objects whose class is registered here with the registered
    /// reducer instead of the object's own hooks.
    pub fn reducers(mut self, registry: Rc<ReducerRegistry>) -> Self {
        self.reducers = Some(registry);
        self
    }
}

impl Default for SerOptions {
    fn default() -> Self {
        SerOptions::new()
    }
}

/// A structure for writing object graphs into a pickle stream.
///
/// Every `dump` writes one complete pickle with a fresh memo, so that
/// several pickles can be written to the same stream.
pub struct Serializer<W> {
    writer: W,
    options: SerOptions,
    memo: PickleMemo,
}

impl<W: io::Write> Serializer<W> {
    pub fn new(writer: W, options: SerOptions) -> Self {
        Serializer {
            writer,
            options,
            memo: PickleMemo::new(),
        }
    }

    /// Unwrap the `Writer` from the `Serializer`.
    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn protocol(&self) -> u8 {
        self.options.proto
    }

    /// Write `value` and everything reachable from it as one pickle.
    pub fn dump(&mut self, value: &Value) -> Result<()> {
        let proto = self.options.proto;
        if proto > HIGHEST_PROTOCOL {
            return Err(Error::Pickling(ErrorCode::UnsupportedProtocol(proto)));
        }
        self.memo = PickleMemo::new();
        if proto >= 2 {
            self.write_opcode(PROTO)?;
            self.writer.write_u8(proto)?;
        }
        let result = self.save(value, false);
        debug!("pickled {} shared objects with protocol {}", self.memo.len(), proto);
        self.memo = PickleMemo::new();
        result?;
        self.write_opcode(STOP)?;
        self.writer.flush().map_err(From::from)
    }

    #[inline]
    fn write_opcode(&mut self, opcode: u8) -> Result<()> {
        self.writer.write_all(&[opcode]).map_err(From::from)
    }

    /// Write an opcode with a newline-terminated argument.
    fn write_line(&mut self, opcode: u8, arg: &[u8]) -> Result<()> {
        self.write_opcode(opcode)?;
        self.writer.write_all(arg)?;
        self.writer.write_all(b"\n").map_err(From::from)
    }

    fn write_get(&mut self, position: u32) -> Result<()> {
        if self.options.proto == 0 {
            self.write_line(GET, position.to_string().as_bytes())
        } else if position < 256 {
            self.write_opcode(BINGET)?;
            self.writer.write_u8(position as u8).map_err(From::from)
        } else {
            self.write_opcode(LONG_BINGET)?;
            self.writer.write_u32::<LittleEndian>(position).map_err(From::from)
        }
    }

    fn write_put(&mut self, position: u32) -> Result<()> {
        if self.options.proto == 0 {
            self.write_line(PUT, position.to_string().as_bytes())
        } else if position < 256 {
            self.write_opcode(BINPUT)?;
            self.writer.write_u8(position as u8).map_err(From::from)
        } else {
            self.write_opcode(LONG_BINPUT)?;
            self.writer.write_u32::<LittleEndian>(position).map_err(From::from)
        }
    }

    /// Assign the next memo position to `value` and write the PUT.
    fn memoize(&mut self, value: &Value) -> Result<()> {
        let id = match value.identity() {
            Some(id) => id,
            None => return Ok(()),
        };
        let position = u32::try_from(self.memo.len() + 1)
            .map_err(|_| Error::Pickling(ErrorCode::MemoFull))?;
        self.memo.put(id, position, value.clone()).map_err(Error::Pickling)?;
        self.write_put(position)
    }

    fn save(&mut self, value: &Value, pers_save: bool) -> Result<()> {
        if !pers_save {
            if let Some(hook) = self.options.persistent_id.clone() {
                if let Some(pid) = hook(value)? {
                    return self.save_pers(&pid);
                }
            }
        }
        match *value {
            Value::None          => self.write_opcode(NONE),
            Value::Bool(b)       => self.save_bool(b),
            Value::I64(i)        => self.save_int(i),
            Value::Int(ref i)    => self.save_long(i),
            Value::F64(f)        => self.save_float(f),
            Value::Tuple(ref t) if t.is_empty() => self.save_empty_tuple(),
            Value::Bytes(ref b)  => self.save_shared(value, |slf| slf.save_bytes(value, b)),
            Value::String(ref s) => self.save_shared(value, |slf| slf.save_unicode(value, s)),
            Value::Tuple(ref t)  => self.save_shared(value, |slf| slf.save_tuple(value, t)),
            Value::List(ref l)   => self.save_shared(value, |slf| slf.save_list(value, l)),
            Value::Dict(ref d)   => self.save_shared(value, |slf| slf.save_dict(value, d)),
            Value::Global(ref g) => self.save_shared(value, |slf| {
                slf.save_global(value, g.module(), g.name())
            }),
            Value::Object(ref o) => self.save_shared(value, |slf| {
                if !pers_save {
                    if let Some(hook) = slf.options.inst_persistent_id.clone() {
                        if let Some(pid) = hook(value)? {
                            return slf.save_pers(&pid);
                        }
                    }
                }
                slf.save_object(value, o)
            }),
        }
    }

    /// Write a GET if `value` was already written, else call `save`.
    fn save_shared<F>(&mut self, value: &Value, save: F) -> Result<()>
        where F: FnOnce(&mut Self) -> Result<()>
    {
        let memoized = value.identity().and_then(|id| self.memo.find_position(id));
        match memoized {
            Some(position) => self.write_get(position),
            None => save(self),
        }
    }

    fn save_pers(&mut self, pid: &Value) -> Result<()> {
        if self.options.proto == 0 {
            match *pid {
                Value::String(ref s) if !s.contains('\n') =>
                    self.write_line(PERSID, s.as_bytes()),
                ref other => Err(Error::Pickling(ErrorCode::InvalidPersistentId(
                    format!("protocol 0 needs a single-line string, got {}", other)))),
            }
        } else {
            self.save(pid, true)?;
            self.write_opcode(BINPERSID)
        }
    }

    fn save_bool(&mut self, value: bool) -> Result<()> {
        if self.options.proto >= 2 {
            self.write_opcode(if value { NEWTRUE } else { NEWFALSE })
        } else {
            self.write_line(INT, if value { b"01" } else { b"00" })
        }
    }

    fn save_int(&mut self, value: i64) -> Result<()> {
        let proto = self.options.proto;
        match i32::try_from(value) {
            Ok(small) if proto >= 1 => {
                if (0..=0xff).contains(&small) {
                    self.write_opcode(BININT1)?;
                    self.writer.write_u8(small as u8).map_err(From::from)
                } else if (0..=0xffff).contains(&small) {
                    self.write_opcode(BININT2)?;
                    self.writer.write_u16::<LittleEndian>(small as u16).map_err(From::from)
                } else {
                    self.write_opcode(BININT)?;
                    self.writer.write_i32::<LittleEndian>(small).map_err(From::from)
                }
            }
            Ok(small) => self.write_line(INT, small.to_string().as_bytes()),
            Err(_) => self.save_long(&BigInt::from(value)),
        }
    }

    fn save_long(&mut self, value: &BigInt) -> Result<()> {
        if self.options.proto >= 2 {
            let bytes = if value.is_zero() { vec![] } else { value.to_signed_bytes_le() };
            if bytes.len() < 256 {
                self.write_opcode(LONG1)?;
                self.writer.write_u8(bytes.len() as u8)?;
            } else {
                let len = i32::try_from(bytes.len()).map_err(|_| Error::Pickling(
                    ErrorCode::InvalidValue("long too large to pickle".into())))?;
                self.write_opcode(LONG4)?;
                self.writer.write_i32::<LittleEndian>(len)?;
            }
            self.writer.write_all(&bytes).map_err(From::from)
        } else {
            self.write_line(LONG, format!("{}L", value).as_bytes())
        }
    }

    fn save_float(&mut self, value: f64) -> Result<()> {
        if self.options.proto >= 1 {
            self.write_opcode(BINFLOAT)?;
            self.writer.write_f64::<BigEndian>(value).map_err(From::from)
        } else {
            self.write_line(FLOAT, float_repr(value).as_bytes())
        }
    }

    fn save_bytes(&mut self, value: &Value, bytes: &[u8]) -> Result<()> {
        if self.options.proto >= 1 {
            if bytes.len() < 256 {
                self.write_opcode(SHORT_BINSTRING)?;
                self.writer.write_u8(bytes.len() as u8)?;
            } else {
                let len = i32::try_from(bytes.len()).map_err(|_| Error::Pickling(
                    ErrorCode::InvalidValue("string too large to pickle".into())))?;
                self.write_opcode(BINSTRING)?;
                self.writer.write_i32::<LittleEndian>(len)?;
            }
            self.writer.write_all(bytes)?;
        } else {
            self.write_line(STRING, &quote_bytes(bytes))?;
        }
        self.memoize(value)
    }

    fn save_unicode(&mut self, value: &Value, string: &str) -> Result<()> {
        if self.options.proto >= 1 {
            let len = u32::try_from(string.len()).map_err(|_| Error::Pickling(
                ErrorCode::InvalidValue("string too large to pickle".into())))?;
            self.write_opcode(BINUNICODE)?;
            self.writer.write_u32::<LittleEndian>(len)?;
            self.writer.write_all(string.as_bytes())?;
        } else {
            self.write_line(UNICODE, &raw_unicode_escape(string))?;
        }
        self.memoize(value)
    }

    fn save_empty_tuple(&mut self) -> Result<()> {
        if self.options.proto >= 1 {
            self.write_opcode(EMPTY_TUPLE)
        } else {
            self.write_opcode(MARK)?;
            self.write_opcode(TUPLE)
        }
    }

    fn save_tuple(&mut self, value: &Value, items: &[Value]) -> Result<()> {
        let proto = self.options.proto;
        let len = items.len();
        if len <= 3 && proto >= 2 {
            for item in items {
                self.save(item, false)?;
            }
            // The tuple may have been written while writing its items, if
            // it is part of a cycle.  Drop the items again and refer to
            // the memoized copy.
            if let Some(position) = value.identity().and_then(|id| self.memo.find_position(id)) {
                for _ in 0..len {
                    self.write_opcode(POP)?;
                }
                return self.write_get(position);
            }
            self.write_opcode([TUPLE1, TUPLE2, TUPLE3][len - 1])?;
            return self.memoize(value);
        }

        self.write_opcode(MARK)?;
        for item in items {
            self.save(item, false)?;
        }
        if let Some(position) = value.identity().and_then(|id| self.memo.find_position(id)) {
            if proto >= 1 {
                self.write_opcode(POP_MARK)?;
            } else {
                for _ in 0..=len {
                    self.write_opcode(POP)?;
                }
            }
            return self.write_get(position);
        }
        self.write_opcode(TUPLE)?;
        self.memoize(value)
    }

    fn save_list(&mut self, value: &Value, list: &RefCell<Vec<Value>>) -> Result<()> {
        if self.options.proto >= 1 {
            self.write_opcode(EMPTY_LIST)?;
        } else {
            self.write_opcode(MARK)?;
            self.write_opcode(LIST)?;
        }
        self.memoize(value)?;
        // Snapshot, so that no borrow is held while hooks run.
        let items = list.try_borrow().map_err(|_| busy("list"))?.clone();
        self.batch_appends(&items)
    }

    fn batch_appends(&mut self, items: &[Value]) -> Result<()> {
        if self.options.proto == 0 {
            for item in items {
                self.save(item, false)?;
                self.write_opcode(APPEND)?;
            }
            return Ok(());
        }
        for chunk in items.chunks(BATCHSIZE) {
            self.write_opcode(MARK)?;
            for item in chunk {
                self.save(item, false)?;
            }
            self.write_opcode(APPENDS)?;
        }
        Ok(())
    }

    fn save_dict(&mut self, value: &Value, dict: &RefCell<Dict>) -> Result<()> {
        if self.options.proto >= 1 {
            self.write_opcode(EMPTY_DICT)?;
        } else {
            self.write_opcode(MARK)?;
            self.write_opcode(DICT)?;
        }
        self.memoize(value)?;
        let items = dict.try_borrow().map_err(|_| busy("dict"))?
                        .iter().cloned().collect::<Vec<_>>();
        self.batch_setitems(&items)
    }

    fn batch_setitems(&mut self, items: &[(Value, Value)]) -> Result<()> {
        if self.options.proto == 0 {
            for &(ref key, ref value) in items {
                self.save(key, false)?;
                self.save(value, false)?;
                self.write_opcode(SETITEM)?;
            }
            return Ok(());
        }
        for chunk in items.chunks(BATCHSIZE) {
            self.write_opcode(MARK)?;
            for &(ref key, ref value) in chunk {
                self.save(key, false)?;
                self.save(value, false)?;
            }
            self.write_opcode(SETITEMS)?;
        }
        Ok(())
    }

    fn save_global(&mut self, value: &Value, module: &str, name: &str) -> Result<()> {
        if self.options.proto >= 2 {
            let code = self.options.extensions.as_ref().and_then(|reg| reg.code(module, name));
            if let Some(code) = code {
                trace!("writing {}.{} as extension {}", module, name, code);
                if code <= 0xff {
                    self.write_opcode(EXT1)?;
                    self.writer.write_u8(code as u8)?;
                } else if code <= 0xffff {
                    self.write_opcode(EXT2)?;
                    self.writer.write_u16::<LittleEndian>(code as u16)?;
                } else {
                    self.write_opcode(EXT4)?;
                    self.writer.write_u32::<LittleEndian>(code)?;
                }
                return Ok(());
            }
        }
        for part in &[module, name] {
            if part.is_empty() || part.contains('\n') {
                return Err(Error::Pickling(ErrorCode::InvalidGlobalName(
                    format!("{}.{}", module, name))));
            }
        }
        self.write_opcode(GLOBAL)?;
        self.writer.write_all(module.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.write_all(name.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.memoize(value)
    }

    fn save_object(&mut self, value: &Value, object: &RefCell<dyn Object>) -> Result<()> {
        let proto = self.options.proto;
        let (class, reduced) = {
            let object = object.try_borrow().map_err(|_| busy("object"))?;
            let class = object.class();
            let reducer = self.options.reducers.as_ref()
                .and_then(|reg| reg.reducer(class.module(), class.name()));
            let reduced = match reducer {
                Some(reducer) => Some(reducer(&*object)),
                None => object.reduce_ex(proto).or_else(|| object.reduce()),
            };
            let reduced = match reduced {
                Some(reduced) => reduced?,
                None => return Err(Error::Pickling(
                    ErrorCode::Unpicklable(class.qualified_name()))),
            };
            (class, reduced)
        };
        match reduced {
            Value::String(ref name) => self.save_global(value, class.module(), name),
            Value::Tuple(ref items) => {
                let reduction = Reduction::from_tuple(items).map_err(Error::Pickling)?;
                self.save_reduce(value, reduction)
            }
            ref other => Err(Error::Pickling(ErrorCode::InvalidReduce(
                format!("{} must return a string or tuple, got {}",
                        class.qualified_name(), other.type_name())))),
        }
    }

    fn save_reduce(&mut self, value: &Value, reduction: Reduction) -> Result<()> {
        if self.options.proto >= 2 && reduction.is_newobj() {
            let args = match reduction.args {
                Value::Tuple(ref args) if !args.is_empty() => args.clone(),
                _ => return Err(Error::Pickling(ErrorCode::InvalidReduce(
                    "__newobj__ needs the class as first argument".into()))),
            };
            if !matches!(args[0], Value::Global(_)) {
                return Err(Error::Pickling(ErrorCode::InvalidReduce(format!(
                    "__newobj__ called with {} instead of a class", args[0].type_name()))));
            }
            self.save(&args[0], false)?;
            self.save(&Value::tuple(args[1..].to_vec()), false)?;
            self.write_opcode(NEWOBJ)?;
        } else {
            self.save(&reduction.callable, false)?;
            self.save(&reduction.args, false)?;
            self.write_opcode(REDUCE)?;
        }
        // Memoize before the items and state, which may refer back to
        // the object.
        self.memoize(value)?;

        match reduction.listitems {
            Value::None => {}
            Value::List(ref l) => {
                let items = l.try_borrow().map_err(|_| busy("list"))?.clone();
                self.batch_appends(&items)?;
            }
            Value::Tuple(ref t) => self.batch_appends(t)?,
            ref other => return Err(Error::Pickling(ErrorCode::InvalidReduce(
                format!("list items must be a list or tuple, got {}", other.type_name())))),
        }
        match reduction.dictitems {
            Value::None => {}
            Value::Dict(ref d) => {
                let items = d.try_borrow().map_err(|_| busy("dict"))?
                             .iter().cloned().collect::<Vec<_>>();
                self.batch_setitems(&items)?;
            }
            Value::List(_) | Value::Tuple(_) => {
                let pairs = item_pairs(&reduction.dictitems)?;
                self.batch_setitems(&pairs)?;
            }
            ref other => return Err(Error::Pickling(ErrorCode::InvalidReduce(
                format!("dict items must be a dict or list of pairs, got {}",
                        other.type_name())))),
        }
        if let Value::None = reduction.state {
            return Ok(());
        }
        self.save(&reduction.state, false)?;
        self.write_opcode(BUILD)
    }
}

fn busy(what: &str) -> Error {
    Error::Pickling(ErrorCode::InvalidValue(format!("{} is mutably borrowed", what)))
}

fn item_pairs(items: &Value) -> Result<Vec<(Value, Value)>> {
    let items = match *items {
        Value::List(ref l) => l.try_borrow().map_err(|_| busy("list"))?.clone(),
        Value::Tuple(ref t) => t.to_vec(),
        _ => vec![],
    };
    items.iter().map(|item| match *item {
        Value::Tuple(ref pair) if pair.len() == 2 => Ok((pair[0].clone(), pair[1].clone())),
        ref other => Err(Error::Pickling(ErrorCode::InvalidReduce(
            format!("dict items must be 2-tuples, got {}", other.type_name())))),
    }).collect()
}

/// Format a float so that parsing it back gives the same value.
fn float_repr(value: f64) -> String {
    if value.is_nan() {
        "nan".into()
    } else if value.is_infinite() {
        if value > 0.0 { "inf".into() } else { "-inf".into() }
    } else {
        format!("{:?}", value)
    }
}

/// Quote a bytestring the way the STRING opcode expects it.
fn quote_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 2);
    out.push(b'\'');
    for &b in bytes {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\'' => out.extend_from_slice(b"\\'"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0x20..=0x7e => out.push(b),
            _ => out.extend_from_slice(format!("\\x{:02x}", b).as_bytes()),
        }
    }
    out.push(b'\'');
    out
}

/// Encode text for the UNICODE opcode: latin-1, with `\uXXXX` escapes for
/// everything else and for the characters that would break the line.
fn raw_unicode_escape(string: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(string.len());
    for ch in string.chars() {
        let c = ch as u32;
        match ch {
            '\\' | '\0' | '\n' | '\r' | '\x1a' =>
                out.extend_from_slice(format!("\\u{:04x}", c).as_bytes()),
            _ if c < 0x100 => out.push(c as u8),
            _ if c < 0x10000 => out.extend_from_slice(format!("\\u{:04x}", c).as_bytes()),
            _ => out.extend_from_slice(format!("\\U{:08x}", c).as_bytes()),
        }
    }
    out
}

/// Serialize a value graph into the given writer, using the given options.
pub fn value_to_writer<W: io::Write>(writer: &mut W, value: &Value, options: SerOptions)
                                     -> Result<()> {
    let mut ser = Serializer::new(writer, options);
    ser.dump(value)
}

/// Serialize a value graph into a new byte vector, using the given options.
pub fn value_to_vec(value: &Value, options: SerOptions) -> Result<Vec<u8>> {
    let mut writer = Vec::with_capacity(128);
    value_to_writer(&mut writer, value, options)?;
    Ok(writer)
}

/// Write `value` to `writer` as a pickle of the given protocol.
pub fn dump<W: io::Write>(value: &Value, writer: W, protocol: u8) -> Result<()> {
    Serializer::new(writer, SerOptions::new().proto(protocol)).dump(value)
}

/// Pickle `value` with the given protocol.
pub fn dumps(value: &Value, protocol: u8) -> Result<Vec<u8>> {
    value_to_vec(value, SerOptions::new().proto(protocol))
}
