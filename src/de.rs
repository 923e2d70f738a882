// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! # Pickle deserialization
//!
//! Note: Pickles are not a declarative format, but a program for a stack-based
//! VM.  Each value that is decoded is simply put on the stack, and some
//! operations pop items from the stack and construct new data with them.
//!
//! Values that are stored in the memo and fetched again are the *same*
//! object, so the shape of the pickled graph, including its cycles, is
//! restored.  Containers are created empty and filled afterwards, which is
//! what makes it possible to refer to them while they are being filled.

use std::io;
use std::io::Read;
use std::iter;
use std::mem;
use std::str;
use std::char;
use std::rc::Rc;
use std::cell::RefCell;
use std::collections::HashMap;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use byteorder::{ByteOrder, BigEndian, LittleEndian};
use iter_read::IterRead;
use log::{debug, trace};

use crate::consts::*;
use crate::error::{Error, ErrorCode, Result};
use crate::memo::UnpickleMemo;
use crate::object::{self, Global, Instance};
use crate::registry::{ClassRegistry, ExtensionRegistry};
use crate::value::{self, Dict, Value};

type ResolveGlobal = Rc<dyn Fn(&str, &str) -> Result<Option<Value>>>;

/// What to do with persistent ids found in the stream.
#[derive(Clone)]
pub enum PersistentLoad {
    /// Call the function with the id and push its result.
    Call(Rc<dyn Fn(Value) -> Result<Value>>),
    /// Collect the ids into the list and push the ids themselves.
    Collect(Rc<RefCell<Vec<Value>>>),
}

/// How many containers may be nested in each other by default.
pub const DEFAULT_MAX_DEPTH: usize = 1000;

/// Options for deserializing.
#[derive(Clone)]
pub struct DeOptions {
    persistent_load: Option<PersistentLoad>,
    resolve_global: Option<ResolveGlobal>,
    classes: Rc<ClassRegistry>,
    extensions: Option<Rc<ExtensionRegistry>>,
    deny_unknown_globals: bool,
    max_depth: usize,
}

impl Default for DeOptions {
    fn default() -> Self {
        DeOptions {
            persistent_load: None,
            resolve_global: None,
            classes: Rc::default(),
            extensions: None,
            deny_unknown_globals: false,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl DeOptions {
    /// Construct with default options:
    ///
    /// - persistent ids are an error
    /// - globals are resolved with `ClassRegistry::new()`
    /// - unknown globals are kept as unbound references
    /// - EXT opcodes are an error
    /// - containers nest at most `DEFAULT_MAX_DEPTH` levels deep
    pub fn new() -> Self {
        Default::default()
    }

    /// Resolve persistent ids by calling `hook`.
    pub fn persistent_load<F>(mut self, hook: F) -> Self
        where F: Fn(Value) -> Result<Value> + 'static
    {
        self.persistent_load = Some(PersistentLoad::Call(Rc::new(hook)));
        self
    }

    /// Append persistent ids to `ids`, and use the ids as values.
    pub fn persistent_collect(mut self, ids: Rc<RefCell<Vec<Value>>>) -> Self {
        self.persistent_load = Some(PersistentLoad::Collect(ids));
        self
    }

    /// Ask `hook` first when resolving a global.  If it returns None, the
    /// class registry is consulted.
    pub fn resolve_global<F>(mut self, hook: F) -> Self
        where F: Fn(&str, &str) -> Result<Option<Value>> + 'static
    {
        self.resolve_global = Some(Rc::new(hook));
        self
    }

    pub fn classes(mut self, registry: Rc<ClassRegistry>) -> Self {
        self.classes = registry;
        self
    }

    /// Resolve EXT opcodes through `registry`.
    pub fn extensions(mut self, registry: Rc<ExtensionRegistry>) -> Self {
        self.extensions = Some(registry);
        self
    }

    /// Fail on globals that can't be resolved, instead of keeping them as
    /// unbound references.
    pub fn deny_unknown_globals(mut self) -> Self {
        self.deny_unknown_globals = true;
        self
    }

    /// Fail on pickles that nest containers more than `depth` levels deep.
    ///
    /// Dropping a value recurses once per level, so very deep values can
    /// exhaust the stack.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum State {
    Reading,
    Stopped,
    Failed,
}

/// Decodes pickle streams into Values.
///
/// `load` can be called repeatedly to read consecutive pickles from the
/// same stream.  After a failed `load`, the stream position is unknown,
/// and every further call fails.
pub struct Deserializer<R: Read> {
    rdr: R,
    pos: usize,
    stack: Vec<Value>,
    stacks: Vec<Vec<Value>>,
    memo: UnpickleMemo,
    // Nesting depth of the containers built by the current load, by
    // identity.
    depths: HashMap<usize, usize>,
    options: DeOptions,
    state: State,
}

impl<R: Read> Deserializer<R> {
    /// Construct a new Deserializer.
    pub fn new(rdr: R, options: DeOptions) -> Deserializer<R> {
        Deserializer {
            rdr,
            pos: 0,
            stack: Vec::with_capacity(128),
            stacks: Vec::with_capacity(16),
            memo: UnpickleMemo::new(),
            depths: HashMap::new(),
            options,
            state: State::Stopped,
        }
    }

    /// Read the next pickle from the stream.
    pub fn load(&mut self) -> Result<Value> {
        if self.state == State::Failed {
            return self.error(ErrorCode::StreamFailed);
        }
        self.state = State::Reading;
        let result = self.parse().and_then(|value| self.check_nesting(value));
        debug!("unpickled {} memoized objects, ending at offset {}", self.memo.len(), self.pos);
        let mut leftovers = mem::take(&mut self.stack);
        leftovers.extend(self.stacks.drain(..).flatten());
        leftovers.extend(self.memo.drain());
        value::release(leftovers);
        self.depths.clear();
        self.state = if result.is_ok() { State::Stopped } else { State::Failed };
        result
    }

    /// Assert that we reached the end of the stream.
    pub fn end(&mut self) -> Result<()> {
        let mut buf = [0];
        loop {
            match self.rdr.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => return self.error(ErrorCode::TrailingBytes),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Unwrap the reader from the Deserializer.
    pub fn into_inner(self) -> R {
        self.rdr
    }

    fn parse(&mut self) -> Result<Value> {
        loop {
            let opcode = self.read_byte()?;
            trace!("opcode {:?} at offset {}", opcode as char, self.pos - 1);
            match opcode {
                // Specials
                PROTO => {
                    let proto = self.read_byte()?;
                    if proto > HIGHEST_PROTOCOL {
                        return self.error(ErrorCode::UnsupportedProtocol(proto));
                    }
                }
                STOP => return self.pop(),
                POP => {
                    if self.stack.is_empty() {
                        self.pop_mark()?;
                    } else {
                        self.pop()?;
                    }
                }
                POP_MARK => { self.pop_mark()?; }
                DUP => {
                    let top = self.top()?.clone();
                    self.stack.push(top);
                }
                MARK => {
                    let stack = mem::take(&mut self.stack);
                    self.stacks.push(stack);
                }

                // Memo saving ops
                PUT => {
                    let line = self.read_line()?;
                    let position = self.parse_ascii::<u32>(line)?;
                    self.memoize(position)?;
                }
                BINPUT => {
                    let position = self.read_byte()?;
                    self.memoize(position.into())?;
                }
                LONG_BINPUT => {
                    let bytes = self.read_bytes(4)?;
                    self.memoize(LittleEndian::read_u32(&bytes))?;
                }

                // Memo getting ops
                GET => {
                    let line = self.read_line()?;
                    let position = self.parse_ascii::<u32>(line)?;
                    self.push_memo_ref(position)?;
                }
                BINGET => {
                    let position = self.read_byte()?;
                    self.push_memo_ref(position.into())?;
                }
                LONG_BINGET => {
                    let bytes = self.read_bytes(4)?;
                    self.push_memo_ref(LittleEndian::read_u32(&bytes))?;
                }

                // Singletons
                NONE => self.stack.push(Value::None),
                NEWFALSE => self.stack.push(Value::Bool(false)),
                NEWTRUE => self.stack.push(Value::Bool(true)),

                // ASCII-formatted numbers
                INT => {
                    let line = self.read_line()?;
                    let val = self.decode_text_int(line)?;
                    self.stack.push(val);
                }
                LONG => {
                    let line = self.read_line()?;
                    let long = self.decode_text_long(line)?;
                    self.stack.push(long);
                }
                FLOAT => {
                    let line = self.read_line()?;
                    let f = self.parse_ascii::<f64>(line)?;
                    self.stack.push(Value::F64(f));
                }

                // ASCII-formatted strings
                STRING => {
                    let line = self.read_line()?;
                    let string = self.decode_escaped_string(&line)?;
                    self.stack.push(string);
                }
                UNICODE => {
                    let line = self.read_line()?;
                    let string = self.decode_escaped_unicode(&line)?;
                    self.stack.push(string);
                }

                // Binary-coded numbers
                BINFLOAT => {
                    let bytes = self.read_bytes(8)?;
                    self.stack.push(Value::F64(BigEndian::read_f64(&bytes)));
                }
                BININT => {
                    let bytes = self.read_bytes(4)?;
                    self.stack.push(Value::I64(LittleEndian::read_i32(&bytes).into()));
                }
                BININT1 => {
                    let byte = self.read_byte()?;
                    self.stack.push(Value::I64(byte.into()));
                }
                BININT2 => {
                    let bytes = self.read_bytes(2)?;
                    self.stack.push(Value::I64(LittleEndian::read_u16(&bytes).into()));
                }
                LONG1 => {
                    let bytes = self.read_u8_prefixed_bytes()?;
                    self.stack.push(decode_long(&bytes));
                }
                LONG4 => {
                    let bytes = self.read_i32_prefixed_bytes()?;
                    self.stack.push(decode_long(&bytes));
                }

                // Length-prefixed strings
                SHORT_BINSTRING => {
                    let bytes = self.read_u8_prefixed_bytes()?;
                    self.stack.push(Value::bytes(bytes));
                }
                BINSTRING => {
                    let bytes = self.read_i32_prefixed_bytes()?;
                    self.stack.push(Value::bytes(bytes));
                }
                BINUNICODE => {
                    let bytes = self.read_u32_prefixed_bytes()?;
                    let string = self.decode_unicode(bytes)?;
                    self.stack.push(string);
                }

                // Tuples
                EMPTY_TUPLE => self.push_built(Value::tuple(vec![]), 1)?,
                TUPLE1 => {
                    let item = self.pop()?;
                    let depth = self.depth_of(iter::once(&item));
                    self.push_built(Value::tuple(vec![item]), depth)?;
                }
                TUPLE2 => {
                    let item2 = self.pop()?;
                    let item1 = self.pop()?;
                    let depth = self.depth_of(vec![&item1, &item2]);
                    self.push_built(Value::tuple(vec![item1, item2]), depth)?;
                }
                TUPLE3 => {
                    let item3 = self.pop()?;
                    let item2 = self.pop()?;
                    let item1 = self.pop()?;
                    let depth = self.depth_of(vec![&item1, &item2, &item3]);
                    self.push_built(Value::tuple(vec![item1, item2, item3]), depth)?;
                }
                TUPLE => {
                    let items = self.pop_mark()?;
                    let depth = self.depth_of(&items);
                    self.push_built(Value::tuple(items), depth)?;
                }

                // Lists
                EMPTY_LIST => self.push_built(Value::list(vec![]), 1)?,
                LIST => {
                    let items = self.pop_mark()?;
                    let depth = self.depth_of(&items);
                    self.push_built(Value::list(items), depth)?;
                }
                APPEND => {
                    let value = self.pop()?;
                    self.append_items(vec![value])?;
                }
                APPENDS => {
                    let items = self.pop_mark()?;
                    self.append_items(items)?;
                }

                // Dicts
                EMPTY_DICT => self.push_built(Value::dict(Dict::new()), 1)?,
                DICT => {
                    let items = self.pop_mark()?;
                    let depth = self.depth_of(&items);
                    let pairs = self.pair_up(items)?;
                    let mut dict = Dict::new();
                    for (key, value) in pairs {
                        let inserted = dict.insert(key, value);
                        self.located(inserted)?;
                    }
                    self.push_built(Value::dict(dict), depth)?;
                }
                SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.set_items(vec![(key, value)])?;
                }
                SETITEMS => {
                    let items = self.pop_mark()?;
                    let pairs = self.pair_up(items)?;
                    self.set_items(pairs)?;
                }

                // Globals and extensions
                GLOBAL => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    let global = self.resolve_global_bytes(module, name)?;
                    self.push_built(global, 1)?;
                }
                EXT1 => {
                    let code = self.read_byte()?;
                    self.push_extension(code.into())?;
                }
                EXT2 => {
                    let bytes = self.read_bytes(2)?;
                    self.push_extension(LittleEndian::read_u16(&bytes).into())?;
                }
                EXT4 => {
                    let bytes = self.read_bytes(4)?;
                    self.push_extension(LittleEndian::read_u32(&bytes))?;
                }

                // Object construction
                REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let depth = self.depth_of(iter::once(&args)).max(2) - 1;
                    let value = self.reduce(callable, args)?;
                    self.push_built(value, depth)?;
                }
                NEWOBJ => {
                    let args = self.pop()?;
                    let class = self.pop()?;
                    let depth = self.depth_of(iter::once(&args)).max(2) - 1;
                    let value = self.new_object(class, args)?;
                    self.push_built(value, depth)?;
                }
                INST => {
                    let args = self.pop_mark()?;
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    let class = self.resolve_global_bytes(module, name)?;
                    let depth = self.depth_of(&args);
                    let value = self.instantiate(class, args)?;
                    self.push_built(value, depth)?;
                }
                OBJ => {
                    let mut args = self.pop_mark()?;
                    if args.is_empty() {
                        return self.error(ErrorCode::StackUnderflow);
                    }
                    let class = args.remove(0);
                    let depth = self.depth_of(&args);
                    let value = self.instantiate(class, args)?;
                    self.push_built(value, depth)?;
                }
                BUILD => {
                    let state = self.pop()?;
                    self.build(state)?;
                }

                // Persistent ids
                PERSID => {
                    let line = self.read_line()?;
                    let pid = self.decode_unicode(line)?;
                    self.persistent_load(pid)?;
                }
                BINPERSID => {
                    let pid = self.pop()?;
                    self.persistent_load(pid)?;
                }

                code => return self.error(ErrorCode::Unsupported(code)),
            }
        }
    }

    // Pop the stack top item.
    fn pop(&mut self) -> Result<Value> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None    => self.error(ErrorCode::StackUnderflow)
        }
    }

    // Get a reference to the stack top item.
    fn top(&self) -> Result<&Value> {
        match self.stack.last() {
            Some(v) => Ok(v),
            None    => self.error(ErrorCode::StackUnderflow)
        }
    }

    // Pop all topmost stack items until the next MARK.
    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        match self.stacks.pop() {
            Some(new) => Ok(mem::replace(&mut self.stack, new)),
            None      => self.error(ErrorCode::MarkNotFound)
        }
    }

    fn memoize(&mut self, position: u32) -> Result<()> {
        let top = self.top()?.clone();
        self.memo.put(position, top);
        Ok(())
    }

    fn push_memo_ref(&mut self, position: u32) -> Result<()> {
        match self.memo.get(position) {
            Some(value) => {
                let value = value.clone();
                self.stack.push(value);
                Ok(())
            }
            None => self.error(ErrorCode::MissingMemo(position)),
        }
    }

    // Depth of a container holding `items`.  Leaves are zero deep, and
    // containers that weren't built here count as one level.
    fn depth_of<'a, I>(&self, items: I) -> usize
        where I: IntoIterator<Item=&'a Value>
    {
        let deepest = items.into_iter().map(|item| {
            if !value::is_container(item) {
                return 0;
            }
            item.identity().and_then(|id| self.depths.get(&id).copied()).unwrap_or(1)
        }).max();
        deepest.unwrap_or(0) + 1
    }

    // Push a value fresh out of a building opcode or a hook, recording how
    // deep it nests.  Items added to containers later are not tracked; the
    // finished value is checked as a whole.
    fn push_built(&mut self, value: Value, depth: usize) -> Result<()> {
        if value::is_container(&value) {
            if depth > self.options.max_depth {
                value::release(vec![value]);
                return self.error(ErrorCode::NestingTooDeep(self.options.max_depth));
            }
            if let Some(id) = value.identity() {
                self.depths.insert(id, depth);
            }
        }
        self.stack.push(value);
        Ok(())
    }

    fn check_nesting(&self, value: Value) -> Result<Value> {
        if value::nested_deeper_than(&value, self.options.max_depth) {
            value::release(vec![value]);
            return self.error(ErrorCode::NestingTooDeep(self.options.max_depth));
        }
        Ok(value)
    }

    fn pair_up(&self, items: Vec<Value>) -> Result<Vec<(Value, Value)>> {
        if items.len() % 2 != 0 {
            return self.error(ErrorCode::InvalidValue(
                format!("odd number of items ({}) for dict", items.len())));
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    fn append_items(&mut self, items: Vec<Value>) -> Result<()> {
        let target = self.top()?.clone();
        match target {
            Value::List(ref list) => match list.try_borrow_mut() {
                Ok(mut list) => list.extend(items),
                Err(_) => return self.error(ErrorCode::InvalidValue("list is borrowed".into())),
            },
            Value::Object(ref obj) => {
                let mut obj = match obj.try_borrow_mut() {
                    Ok(obj) => obj,
                    Err(_) => return self.error(
                        ErrorCode::InvalidValue("object is borrowed".into())),
                };
                for item in items {
                    let appended = obj.append(item);
                    self.located(appended)?;
                }
            }
            ref other => return self.error(ErrorCode::InvalidStackTop("list", other.type_name())),
        }
        Ok(())
    }

    fn set_items(&mut self, pairs: Vec<(Value, Value)>) -> Result<()> {
        let target = self.top()?.clone();
        match target {
            Value::Dict(ref dict) => {
                let mut dict = match dict.try_borrow_mut() {
                    Ok(dict) => dict,
                    Err(_) => return self.error(
                        ErrorCode::InvalidValue("dict is borrowed".into())),
                };
                for (key, value) in pairs {
                    let inserted = dict.insert(key, value);
                    self.located(inserted)?;
                }
            }
            Value::Object(ref obj) => {
                let mut obj = match obj.try_borrow_mut() {
                    Ok(obj) => obj,
                    Err(_) => return self.error(
                        ErrorCode::InvalidValue("object is borrowed".into())),
                };
                for (key, value) in pairs {
                    let set = obj.set_item(key, value);
                    self.located(set)?;
                }
            }
            ref other => return self.error(ErrorCode::InvalidStackTop("dict", other.type_name())),
        }
        Ok(())
    }

    fn resolve_global_bytes(&self, module: Vec<u8>, name: Vec<u8>) -> Result<Value> {
        let module = self.decode_utf8(module)?;
        let name = self.decode_utf8(name)?;
        self.resolve_global(module, name)
    }

    fn resolve_global(&self, module: String, name: String) -> Result<Value> {
        if let Some(ref hook) = self.options.resolve_global {
            if let Some(value) = hook(&module, &name)? {
                return Ok(value);
            }
        }
        if let Some(value) = self.options.classes.resolve(&module, &name) {
            return Ok(value);
        }
        if self.options.deny_unknown_globals {
            return self.error(ErrorCode::UnresolvedGlobal(module, name));
        }
        debug!("global {}.{} is not registered, keeping it unbound", module, name);
        Ok(Global::new(module, name).into_value())
    }

    fn push_extension(&mut self, code: u32) -> Result<()> {
        let name = self.options.extensions.as_ref()
            .and_then(|reg| reg.lookup(code))
            .map(|(module, name)| (module.to_owned(), name.to_owned()));
        match name {
            Some((module, name)) => {
                trace!("extension {} is {}.{}", code, module, name);
                let global = self.resolve_global(module, name)?;
                self.push_built(global, 1)
            }
            None => self.error(ErrorCode::UnregisteredExtension(code)),
        }
    }

    fn class_of(&self, value: Value) -> Result<Rc<Global>> {
        match value {
            Value::Global(global) => Ok(global),
            other => self.error(ErrorCode::InvalidStackTop("class", other.type_name())),
        }
    }

    fn call(&self, global: &Rc<Global>, args: Vec<Value>) -> Result<Value> {
        match global.callable() {
            Some(callable) => callable.call(args),
            None => self.error(ErrorCode::NotCallable(global.qualified_name())),
        }
    }

    fn reduce(&self, callable: Value, args: Value) -> Result<Value> {
        let global = self.class_of(callable)?;
        match args {
            Value::None => object::basic_construct(&global),
            Value::Tuple(args) => self.call(&global, args.to_vec()),
            other => self.error(ErrorCode::InvalidStackTop("argument tuple", other.type_name())),
        }
    }

    fn new_object(&self, class: Value, args: Value) -> Result<Value> {
        let class = self.class_of(class)?;
        match args {
            Value::Tuple(args) => object::construct(&class, args.to_vec()),
            other => self.error(ErrorCode::InvalidStackTop("argument tuple", other.type_name())),
        }
    }

    // INST and OBJ call the class; unbound classes without arguments still
    // give a plain instance.
    fn instantiate(&self, class: Value, args: Vec<Value>) -> Result<Value> {
        let class = self.class_of(class)?;
        if class.callable().is_none() && args.is_empty() {
            return Ok(Instance::new(class).into_value());
        }
        self.call(&class, args)
    }

    fn build(&mut self, state: Value) -> Result<()> {
        let target = self.top()?.clone();
        let obj = match target {
            Value::Object(ref obj) => obj.clone(),
            ref other => return self.error(ErrorCode::InvalidStackTop("object", other.type_name())),
        };
        let mut obj = match obj.try_borrow_mut() {
            Ok(obj) => obj,
            Err(_) => return self.error(ErrorCode::InvalidValue("object is borrowed".into())),
        };
        if let Some(result) = obj.set_state(&state) {
            return self.located(result);
        }

        let (state, slotstate) = match state {
            Value::Tuple(ref t) if t.len() == 2 => (t[0].clone(), t[1].clone()),
            other => (other, Value::None),
        };
        match state {
            Value::None => {}
            Value::Dict(ref dict) => {
                let items = match dict.try_borrow() {
                    Ok(dict) => dict.iter().cloned().collect::<Vec<_>>(),
                    Err(_) => return self.error(ErrorCode::InvalidValue("dict is borrowed".into())),
                };
                let class = obj.class();
                let attrs = match obj.dict_mut() {
                    Some(attrs) => attrs,
                    None => return self.error(ErrorCode::InvalidValue(
                        format!("{} object has no attribute dict", class.qualified_name()))),
                };
                for (key, value) in items {
                    let inserted = attrs.insert(key, value);
                    self.located(inserted)?;
                }
            }
            ref other => return self.error(ErrorCode::InvalidValue(
                format!("state is not a dictionary, got {}", other.type_name()))),
        }
        match slotstate {
            Value::None => {}
            Value::Dict(ref dict) => {
                let items = match dict.try_borrow() {
                    Ok(dict) => dict.iter().cloned().collect::<Vec<_>>(),
                    Err(_) => return self.error(ErrorCode::InvalidValue("dict is borrowed".into())),
                };
                for (key, value) in items {
                    let name = match key {
                        Value::String(ref name) => name.clone(),
                        ref other => return self.error(ErrorCode::InvalidValue(
                            format!("slot name must be a string, got {}", other.type_name()))),
                    };
                    let set = obj.set_attr(&name, value);
                    self.located(set)?;
                }
            }
            ref other => return self.error(ErrorCode::InvalidValue(
                format!("slot state is not a dictionary, got {}", other.type_name()))),
        }
        Ok(())
    }

    fn persistent_load(&mut self, pid: Value) -> Result<()> {
        let value = match self.options.persistent_load.clone() {
            None => return self.error(ErrorCode::NoPersistentLoad),
            Some(PersistentLoad::Call(hook)) => hook(pid)?,
            Some(PersistentLoad::Collect(ids)) => {
                match ids.try_borrow_mut() {
                    Ok(mut ids) => ids.push(pid.clone()),
                    Err(_) => return self.error(
                        ErrorCode::InvalidValue("persistent id list is borrowed".into())),
                }
                pid
            }
        };
        self.push_built(value, 1)
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.rdr.read_exact(buf) {
            Ok(()) => {
                self.pos += buf.len();
                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof =>
                self.error(ErrorCode::EOFWhileParsing),
            Err(e) => Err(Error::Io(e)),
        }
    }

    // Read a line, without the trailing newline (and CR, if present).
    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut result = Vec::with_capacity(16);
        loop {
            match self.read_byte()? {
                b'\n' => {
                    if result.last() == Some(&b'\r') {
                        result.pop();
                    }
                    return Ok(result);
                }
                ch => result.push(ch),
            }
        }
    }

    // Reads go through `take`, so that a bogus length doesn't make us
    // allocate a huge buffer up front.
    fn read_bytes(&mut self, n: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let got = match (&mut self.rdr).take(n).read_to_end(&mut buf) {
            Ok(got) => got,
            Err(e) => return Err(Error::Io(e)),
        };
        self.pos += got;
        if (got as u64) < n {
            return self.error(ErrorCode::EOFWhileParsing);
        }
        Ok(buf)
    }

    fn read_i32_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbytes = self.read_bytes(4)?;
        match LittleEndian::read_i32(&lenbytes) {
            0          => Ok(vec![]),
            l if l < 0 => self.error(ErrorCode::NegativeLength),
            l          => self.read_bytes(l as u64)
        }
    }

    fn read_u32_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbytes = self.read_bytes(4)?;
        self.read_bytes(LittleEndian::read_u32(&lenbytes) as u64)
    }

    fn read_u8_prefixed_bytes(&mut self) -> Result<Vec<u8>> {
        let lenbyte = self.read_byte()?;
        self.read_bytes(lenbyte as u64)
    }

    fn parse_ascii<T: str::FromStr>(&self, line: Vec<u8>) -> Result<T> {
        match str::from_utf8(&line).ok().and_then(|s| s.trim().parse().ok()) {
            Some(v) => Ok(v),
            None => self.error(ErrorCode::InvalidLiteral(line)),
        }
    }

    fn decode_text_int(&self, line: Vec<u8>) -> Result<Value> {
        match &line[..] {
            b"00" => return Ok(Value::Bool(false)),
            b"01" => return Ok(Value::Bool(true)),
            _ => {}
        }
        if let Ok(i) = self.parse_ascii::<i64>(line.clone()) {
            return Ok(Value::I64(i));
        }
        self.decode_text_long(line)
    }

    fn decode_text_long(&self, mut line: Vec<u8>) -> Result<Value> {
        if line.last() == Some(&b'L') {
            line.pop();
        }
        self.parse_ascii::<BigInt>(line).map(normalize_int)
    }

    fn decode_utf8(&self, bytes: Vec<u8>) -> Result<String> {
        match String::from_utf8(bytes) {
            Ok(v)  => Ok(v),
            Err(_) => self.error(ErrorCode::StringNotUTF8)
        }
    }

    fn decode_unicode(&self, bytes: Vec<u8>) -> Result<Value> {
        self.decode_utf8(bytes).map(Value::string)
    }

    fn decode_escaped_string(&self, line: &[u8]) -> Result<Value> {
        // The argument must be quoted, with the same quote on both ends.
        let s = match line {
            [q, inner @ .., q2] if (*q == b'\'' || *q == b'"') && q == q2 => inner,
            _ => return self.error(ErrorCode::InsecureString),
        };
        // The quoted part follows Python's string escape rules.
        let mut result = Vec::with_capacity(s.len());
        let mut iter = s.iter().peekable();
        while let Some(&b) = iter.next() {
            if b != b'\\' {
                result.push(b);
                continue;
            }
            match iter.next() {
                Some(&b'\\') => result.push(b'\\'),
                Some(&b'\'') => result.push(b'\''),
                Some(&b'"') => result.push(b'"'),
                Some(&b'a') => result.push(b'\x07'),
                Some(&b'b') => result.push(b'\x08'),
                Some(&b't') => result.push(b'\x09'),
                Some(&b'n') => result.push(b'\x0a'),
                Some(&b'v') => result.push(b'\x0b'),
                Some(&b'f') => result.push(b'\x0c'),
                Some(&b'r') => result.push(b'\x0d'),
                Some(&b'x') => {
                    match iter.next()
                              .and_then(|&ch1| (ch1 as char).to_digit(16))
                              .and_then(|v1| iter.next()
                                        .and_then(|&ch2| (ch2 as char).to_digit(16))
                                        .map(|v2| 16*(v1 as u8) + (v2 as u8)))
                    {
                        Some(v) => result.push(v),
                        None => return self.error(ErrorCode::InvalidLiteral(line.into()))
                    }
                }
                Some(&d) if (b'0'..=b'7').contains(&d) => {
                    let mut value = (d - b'0') as u32;
                    for _ in 0..2 {
                        match iter.peek() {
                            Some(&&d) if (b'0'..=b'7').contains(&d) => {
                                value = value * 8 + (d - b'0') as u32;
                                iter.next();
                            }
                            _ => break,
                        }
                    }
                    result.push(value as u8);
                }
                // Unknown escapes stay as they are.
                Some(&other) => {
                    result.push(b'\\');
                    result.push(other);
                }
                None => return self.error(ErrorCode::InvalidLiteral(line.into())),
            }
        }
        Ok(Value::bytes(result))
    }

    fn decode_escaped_unicode(&self, s: &[u8]) -> Result<Value> {
        // These are encoded with "raw-unicode-escape", which only knows
        // the \uXXXX and \UYYYYYYYY escapes.  The backslash is escaped
        // in this way, too, so a backslash followed by anything else is
        // taken literally.
        let mut result = String::with_capacity(s.len());
        let mut iter = s.iter().peekable();
        while let Some(&b) = iter.next() {
            if b != b'\\' {
                result.push(b as char);
                continue;
            }
            let nescape = match iter.peek() {
                Some(&&b'u') => 4,
                Some(&&b'U') => 8,
                _ => {
                    result.push('\\');
                    continue;
                }
            };
            iter.next();
            let mut accum = 0;
            for _i in 0..nescape {
                accum *= 16;
                match iter.next().and_then(|&ch| (ch as char).to_digit(16)) {
                    Some(v) => accum += v,
                    None => return self.error(ErrorCode::InvalidLiteral(s.into()))
                }
            }
            match char::from_u32(accum) {
                Some(v) => result.push(v),
                None => return self.error(ErrorCode::InvalidLiteral(s.into()))
            }
        }
        Ok(Value::string(result))
    }

    // Errors from inside values (dict keys, hooks of user objects) get the
    // current offset attached.
    fn located<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(Error::Syntax(code)) => self.error(code),
            other => other,
        }
    }

    fn error<T>(&self, reason: ErrorCode) -> Result<T> {
        Err(Error::Eval(reason, self.pos))
    }
}

// Two's complement, little endian.
fn decode_long(bytes: &[u8]) -> Value {
    normalize_int(BigInt::from_signed_bytes_le(bytes))
}

fn normalize_int(i: BigInt) -> Value {
    match i.to_i64() {
        Some(small) => Value::I64(small),
        None => Value::Int(i),
    }
}

/// Decode a value from a byte iterator, which must contain exactly one
/// pickle.
pub fn value_from_iter<I>(iter: I, options: DeOptions) -> Result<Value>
    where I: Iterator<Item=io::Result<u8>>
{
    value_from_reader(IterRead::new(iter), options)
}

/// Decode a value from a reader, which must contain exactly one pickle.
pub fn value_from_reader<R: Read>(rdr: R, options: DeOptions) -> Result<Value> {
    let mut de = Deserializer::new(io::BufReader::new(rdr), options);
    let value = de.load()?;
    de.end()?;
    Ok(value)
}

/// Decode a value from a byte slice, which must contain exactly one pickle.
pub fn value_from_slice(v: &[u8], options: DeOptions) -> Result<Value> {
    let mut de = Deserializer::new(v, options);
    let value = de.load()?;
    de.end()?;
    Ok(value)
}

/// Read one pickle from `reader` with default options.
///
/// Nothing after the pickle's STOP opcode is consumed, so the next pickle
/// can be read from the same reader.
pub fn load<R: Read>(reader: R) -> Result<Value> {
    Deserializer::new(reader, DeOptions::new()).load()
}

/// Unpickle `bytes` with default options.
pub fn loads(bytes: &[u8]) -> Result<Value> {
    value_from_slice(bytes, DeOptions::new())
}
