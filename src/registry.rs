// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Registries consulted when writing and resolving globals.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, ErrorCode, Result};
use crate::object::{self, Global, Object, COPYREG, NEWOBJ_NAME, RECONSTRUCTOR_NAME};
use crate::value::Value;

/// Highest code an extension can be registered under.
pub const MAX_EXTENSION_CODE: u32 = 0x7fff_ffff;

fn invalid(msg: String) -> Error {
    Error::Syntax(ErrorCode::InvalidValue(msg))
}

/// Maps globals to small integer codes, which protocol 2 writes with the
/// EXT opcodes instead of spelling out the names.
///
/// Both sides of a pickle must agree on the registrations.
#[derive(Clone, Debug, Default)]
pub struct ExtensionRegistry {
    codes: HashMap<(String, String), u32>,
    names: HashMap<u32, (String, String)>,
}

impl ExtensionRegistry {
    pub fn new() -> ExtensionRegistry {
        ExtensionRegistry::default()
    }

    /// Register `module.name` under `code`.  Registering the same pair
    /// twice is fine, anything conflicting is an error.
    pub fn add(&mut self, module: &str, name: &str, code: u32) -> Result<()> {
        if code < 1 || code > MAX_EXTENSION_CODE {
            return Err(invalid(format!("extension code {} out of range", code)));
        }
        let key = (module.to_owned(), name.to_owned());
        if self.codes.get(&key) == Some(&code) && self.names.get(&code) == Some(&key) {
            return Ok(());
        }
        if let Some(other) = self.codes.get(&key) {
            return Err(invalid(format!("{}.{} is already registered with code {}",
                                       module, name, other)));
        }
        if let Some(&(ref m, ref n)) = self.names.get(&code) {
            return Err(invalid(format!("code {} is already in use for {}.{}", code, m, n)));
        }
        self.codes.insert(key.clone(), code);
        self.names.insert(code, key);
        Ok(())
    }

    /// Unregister a previous `add`.
    pub fn remove(&mut self, module: &str, name: &str, code: u32) -> Result<()> {
        let key = (module.to_owned(), name.to_owned());
        if self.codes.get(&key) != Some(&code) || self.names.get(&code) != Some(&key) {
            return Err(invalid(format!("{}.{} is not registered as code {}",
                                       module, name, code)));
        }
        self.codes.remove(&key);
        self.names.remove(&code);
        Ok(())
    }

    pub fn code(&self, module: &str, name: &str) -> Option<u32> {
        self.codes.get(&(module.to_owned(), name.to_owned())).cloned()
    }

    pub fn lookup(&self, code: u32) -> Option<(&str, &str)> {
        self.names.get(&code).map(|&(ref m, ref n)| (m.as_str(), n.as_str()))
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Values that globals are resolved to while unpickling.
///
/// `ClassRegistry::new()` knows the constructor helpers that the default
/// object reduction refers to, under their Python 2 and 3 module names,
/// plus `_codecs.encode` which Python 3 uses to pickle bytes with protocols
/// below 3.
#[derive(Clone)]
pub struct ClassRegistry {
    classes: HashMap<(String, String), Value>,
}

impl ClassRegistry {
    /// A registry without any entries.
    pub fn empty() -> ClassRegistry {
        ClassRegistry { classes: HashMap::new() }
    }

    pub fn new() -> ClassRegistry {
        let mut reg = ClassRegistry::empty();
        for &module in &[COPYREG, "copy_reg"] {
            reg.register(Global::with_callable(module, RECONSTRUCTOR_NAME, reconstructor));
            reg.register(Global::with_callable(module, NEWOBJ_NAME, newobj));
        }
        reg.register(Global::with_callable("_codecs", "encode", codecs_encode));
        reg
    }

    /// Register a global under its own module and name.
    pub fn register(&mut self, global: Global) {
        let key = (global.module().to_owned(), global.name().to_owned());
        self.classes.insert(key, global.into_value());
    }

    /// Make `module.name` resolve to an arbitrary value.
    pub fn register_value(&mut self, module: &str, name: &str, value: Value) {
        self.classes.insert((module.to_owned(), name.to_owned()), value);
    }

    pub fn resolve(&self, module: &str, name: &str) -> Option<Value> {
        self.classes.get(&(module.to_owned(), name.to_owned())).cloned()
    }
}

impl Default for ClassRegistry {
    fn default() -> ClassRegistry {
        ClassRegistry::new()
    }
}

/// A function reducing an object, with the same contract as
/// `Object::reduce_ex`: it returns a global name or a reduce tuple.
pub type Reducer = Rc<dyn Fn(&dyn Object) -> Result<Value>>;

/// Reducers for objects, by the module and name of their class.
///
/// The pickler asks this registry before the object's own `reduce_ex` and
/// `reduce` hooks, which makes it possible to pickle host types whose
/// hooks can't be changed.
#[derive(Clone, Default)]
pub struct ReducerRegistry {
    reducers: HashMap<(String, String), Reducer>,
}

impl ReducerRegistry {
    pub fn new() -> ReducerRegistry {
        ReducerRegistry::default()
    }

    /// Reduce objects of class `module.name` with `reducer`, replacing any
    /// earlier registration.
    pub fn register<F>(&mut self, module: &str, name: &str, reducer: F)
        where F: Fn(&dyn Object) -> Result<Value> + 'static
    {
        self.reducers.insert((module.to_owned(), name.to_owned()), Rc::new(reducer));
    }

    /// Drop the reducer for `module.name`.  Returns whether there was one.
    pub fn remove(&mut self, module: &str, name: &str) -> bool {
        self.reducers.remove(&(module.to_owned(), name.to_owned())).is_some()
    }

    pub fn reducer(&self, module: &str, name: &str) -> Option<Reducer> {
        self.reducers.get(&(module.to_owned(), name.to_owned())).cloned()
    }

    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }
}

fn class_arg(args: &[Value], what: &str) -> Result<Rc<Global>> {
    match args.first() {
        Some(&Value::Global(ref class)) => Ok(class.clone()),
        Some(other) => Err(invalid(format!("{}: first argument must be a class, got {}",
                                           what, other.type_name()))),
        None => Err(invalid(format!("{}: missing class argument", what))),
    }
}

fn reconstructor(args: Vec<Value>) -> Result<Value> {
    let class = class_arg(&args, RECONSTRUCTOR_NAME)?;
    object::construct(&class, vec![])
}

fn newobj(mut args: Vec<Value>) -> Result<Value> {
    let class = class_arg(&args, NEWOBJ_NAME)?;
    let rest = args.split_off(1);
    object::construct(&class, rest)
}

fn codecs_encode(args: Vec<Value>) -> Result<Value> {
    let text = match args.first() {
        Some(&Value::String(ref s)) => s.clone(),
        _ => return Err(invalid("_codecs.encode: first argument must be a string".into())),
    };
    let encoding = match args.get(1) {
        Some(&Value::String(ref e)) => e.to_lowercase().replace('_', "-"),
        None => "utf-8".into(),
        _ => return Err(invalid("_codecs.encode: encoding must be a string".into())),
    };
    match &*encoding {
        "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => {
            let bytes = text.chars().map(|c| if (c as u32) < 256 {
                Ok(c as u8)
            } else {
                Err(invalid(format!("_codecs.encode: {:?} can't be encoded as latin-1", c)))
            }).collect::<Result<Vec<u8>>>()?;
            Ok(Value::bytes(bytes))
        }
        "utf-8" | "utf8" => Ok(Value::bytes(text.as_bytes())),
        _ => Err(invalid(format!("_codecs.encode: unsupported encoding {:?}", encoding))),
    }
}
