// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Globals, user objects and the reduce protocol.
//!
//! Anything that is not a builtin value is pickled by *reducing* it: the
//! object's hook returns a tuple `(callable, args, state, listitems,
//! dictitems)` (or the name of a global), and the pickler writes the
//! instructions to rebuild the object from those parts.  The unpickler gets
//! the callable back as a `Global`, which may carry a `Callable` that knows
//! how to construct the object.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, ErrorCode, Result};
use crate::value::{Dict, Value};

/// Module that holds the constructor helpers used by the reduce protocol.
pub const COPYREG: &str = "copyreg";
/// Name of the marker callable that requests NEWOBJ.
pub const NEWOBJ_NAME: &str = "__newobj__";
/// Name of the helper used to rebuild plain instances with protocols 0 and 1.
pub const RECONSTRUCTOR_NAME: &str = "_reconstructor";

/// Something a global can be called as: a class or a factory function.
pub trait Callable {
    /// Call with positional arguments, as REDUCE, INST and OBJ do.
    fn call(&self, args: Vec<Value>) -> Result<Value>;

    /// Create a new, not yet initialized instance of `class`, as NEWOBJ
    /// does.
    fn new_object(&self, class: &Rc<Global>, args: Vec<Value>) -> Result<Value> {
        let _ = args;
        Ok(Instance::new(class.clone()).into_value())
    }

    /// Create an instance without calling any constructor, as REDUCE with
    /// `None` for arguments does.
    fn basic_new(&self, class: &Rc<Global>) -> Result<Value> {
        Ok(Instance::new(class.clone()).into_value())
    }
}

impl<F> Callable for F where F: Fn(Vec<Value>) -> Result<Value> {
    fn call(&self, args: Vec<Value>) -> Result<Value> {
        self(args)
    }
}

/// A module-level name, optionally bound to something callable.
///
/// Globals that the unpickler could not resolve are unbound: they keep
/// their name so that they can be pickled again, but calling them fails.
pub struct Global {
    module: String,
    name: String,
    callable: Option<Rc<dyn Callable>>,
}

impl Global {
    pub fn new<M: Into<String>, N: Into<String>>(module: M, name: N) -> Global {
        Global { module: module.into(), name: name.into(), callable: None }
    }

    pub fn with_callable<M, N, C>(module: M, name: N, callable: C) -> Global
        where M: Into<String>, N: Into<String>, C: Callable + 'static
    {
        Global { module: module.into(), name: name.into(), callable: Some(Rc::new(callable)) }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }

    pub fn callable(&self) -> Option<&Rc<dyn Callable>> {
        self.callable.as_ref()
    }

    /// Whether this is the marker that asks for NEWOBJ in protocol 2.
    pub fn is_newobj(&self) -> bool {
        self.name == NEWOBJ_NAME
    }

    pub fn into_value(self) -> Value {
        Value::Global(Rc::new(self))
    }
}

impl fmt::Debug for Global {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Global({}.{}{})", self.module, self.name,
               if self.callable.is_some() { "" } else { ", unbound" })
    }
}

/// Create a new instance of `class` the way NEWOBJ does.
pub fn construct(class: &Rc<Global>, args: Vec<Value>) -> Result<Value> {
    match class.callable() {
        Some(callable) => callable.new_object(class, args),
        None => Ok(Instance::new(class.clone()).into_value()),
    }
}

/// Create a bare instance of `class`, bypassing any constructor.
pub fn basic_construct(class: &Rc<Global>) -> Result<Value> {
    match class.callable() {
        Some(callable) => callable.basic_new(class),
        None => Ok(Instance::new(class.clone()).into_value()),
    }
}

/// A user object that takes part in pickling.
///
/// Only `class` and `as_any` must be implemented.  To be picklable, an
/// object needs a `reduce_ex` or `reduce` hook; to be the target of
/// unpickled state, it needs `set_state` or an attribute dict.
pub trait Object: Any {
    /// The class this object is an instance of.
    fn class(&self) -> Rc<Global>;

    /// Reduce for a specific protocol.  Takes precedence over `reduce`.
    fn reduce_ex(&self, protocol: u8) -> Option<Result<Value>> {
        let _ = protocol;
        None
    }

    /// Reduce regardless of protocol.
    ///
    /// The result is either a string, naming a global in the module of the
    /// object's class, or a tuple of 2 to 5 elements; see `Reduction`.
    fn reduce(&self) -> Option<Result<Value>> {
        None
    }

    /// Restore state, as BUILD does.  Returning None asks for the default
    /// handling: merge a dict into `dict_mut`, and set the attributes of a
    /// `(dict, slots)` pair.
    fn set_state(&mut self, state: &Value) -> Option<Result<()>> {
        let _ = state;
        None
    }

    /// The attribute dictionary, if the object has one.
    fn dict(&self) -> Option<&Dict> {
        None
    }

    fn dict_mut(&mut self) -> Option<&mut Dict> {
        None
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<()> {
        let class = self.class();
        match self.dict_mut() {
            Some(dict) => dict.insert(Value::string(name), value).map(|_| ()),
            None => Err(Error::Syntax(ErrorCode::InvalidValue(
                format!("{} object has no attribute {:?}", class.qualified_name(), name)))),
        }
    }

    /// Receive an item from the reduction's `listitems`.
    fn append(&mut self, item: Value) -> Result<()> {
        let _ = item;
        Err(Error::Syntax(ErrorCode::InvalidValue(
            format!("{} object does not support append", self.class().qualified_name()))))
    }

    /// Receive a pair from the reduction's `dictitems`.
    fn set_item(&mut self, key: Value, value: Value) -> Result<()> {
        let _ = (key, value);
        Err(Error::Syntax(ErrorCode::InvalidValue(
            format!("{} object does not support item assignment", self.class().qualified_name()))))
    }

    /// Structural equality with another object; identity is checked before.
    fn equals(&self, other: &dyn Object) -> bool {
        let _ = other;
        false
    }

    fn as_any(&self) -> &dyn Any;
}

/// The parts of a reduced object.
///
/// Fields that are not used are `Value::None`.
thread_local! {
    // The globals of the default reductions.  Every reduction made on one
    // thread refers to the same objects, so a pickle writes each of them
    // once and fetches it from the memo afterwards.
    static NEWOBJ: Value = Global::new(COPYREG, NEWOBJ_NAME).into_value();
    static RECONSTRUCTOR: Value = Global::new(COPYREG, RECONSTRUCTOR_NAME).into_value();
    static OBJECT_BASE: Value = Global::new("builtins", "object").into_value();
}

#[derive(Clone, Debug)]
pub struct Reduction {
    /// Global to call.  For `copyreg.__newobj__`, the first argument is the
    /// class and the rest go to its `new_object`.
    pub callable: Value,
    /// Argument tuple, or None to create the object with `basic_new`.
    pub args: Value,
    /// Passed to the new object's `set_state` by BUILD.
    pub state: Value,
    /// List or tuple of items to `append`.
    pub listitems: Value,
    /// Dict or list of pairs to `set_item`.
    pub dictitems: Value,
}

impl Reduction {
    pub fn new(callable: Value, args: Vec<Value>) -> Reduction {
        Reduction {
            callable,
            args: Value::tuple(args),
            state: Value::None,
            listitems: Value::None,
            dictitems: Value::None,
        }
    }

    /// A reduction that creates the object with NEWOBJ in protocol 2.
    pub fn newobj(class: Rc<Global>, args: Vec<Value>) -> Reduction {
        let mut full_args = Vec::with_capacity(args.len() + 1);
        full_args.push(Value::Global(class));
        full_args.extend(args);
        Reduction::new(NEWOBJ.with(Value::clone), full_args)
    }

    pub fn state(mut self, state: Value) -> Reduction {
        self.state = state;
        self
    }

    pub fn listitems(mut self, items: Vec<Value>) -> Reduction {
        self.listitems = Value::list(items);
        self
    }

    pub fn dictitems(mut self, items: Dict) -> Reduction {
        self.dictitems = Value::dict(items);
        self
    }

    /// The tuple form returned from reduce hooks, without trailing Nones.
    pub fn into_value(self) -> Value {
        let mut items = vec![self.callable, self.args, self.state,
                             self.listitems, self.dictitems];
        while items.len() > 2 && matches!(items.last(), Some(Value::None)) {
            items.pop();
        }
        Value::tuple(items)
    }

    /// Check the shape of a reduce hook's tuple.
    pub fn from_tuple(items: &[Value]) -> std::result::Result<Reduction, ErrorCode> {
        if items.len() < 2 || items.len() > 5 {
            return Err(ErrorCode::InvalidReduce(
                format!("tuple must contain 2 through 5 elements, got {}", items.len())));
        }
        let part = |i: usize| items.get(i).cloned().unwrap_or(Value::None);
        let reduction = Reduction {
            callable: part(0),
            args: part(1),
            state: part(2),
            listitems: part(3),
            dictitems: part(4),
        };
        match reduction.args {
            Value::Tuple(_) | Value::None => {}
            ref other => return Err(ErrorCode::InvalidReduce(
                format!("second element must be a tuple, got {}", other.type_name()))),
        }
        Ok(reduction)
    }

    /// Whether the callable is the NEWOBJ marker.
    pub fn is_newobj(&self) -> bool {
        match self.callable {
            Value::Global(ref g) => g.is_newobj(),
            _ => false,
        }
    }
}

/// A generic instance: a class and an attribute dictionary.
///
/// This is what unpickling produces for classes without a custom
/// `Callable`, and it pickles the way Python's default object reduction
/// does.
#[derive(Clone, Debug)]
pub struct Instance {
    class: Rc<Global>,
    dict: Dict,
}

impl Instance {
    pub fn new(class: Rc<Global>) -> Instance {
        Instance { class, dict: Dict::new() }
    }

    pub fn with_dict(class: Rc<Global>, dict: Dict) -> Instance {
        Instance { class, dict }
    }

    pub fn get_attr(&self, name: &str) -> Option<&Value> {
        self.dict.get_str(name)
    }

    pub fn into_value(self) -> Value {
        Value::object(self)
    }
}

impl Object for Instance {
    fn class(&self) -> Rc<Global> {
        self.class.clone()
    }

    fn reduce_ex(&self, protocol: u8) -> Option<Result<Value>> {
        let state = if self.dict.is_empty() {
            Value::None
        } else {
            Value::dict(self.dict.clone())
        };
        let reduction = if protocol >= 2 {
            Reduction::newobj(self.class.clone(), vec![])
        } else {
            Reduction::new(RECONSTRUCTOR.with(Value::clone),
                           vec![Value::Global(self.class.clone()),
                                OBJECT_BASE.with(Value::clone),
                                Value::None])
        };
        Some(Ok(reduction.state(state).into_value()))
    }

    fn dict(&self) -> Option<&Dict> {
        Some(&self.dict)
    }

    fn dict_mut(&mut self) -> Option<&mut Dict> {
        Some(&mut self.dict)
    }

    fn equals(&self, other: &dyn Object) -> bool {
        match other.as_any().downcast_ref::<Instance>() {
            Some(other) => self.class.module() == other.class.module() &&
                self.class.name() == other.class.name() &&
                self.dict == other.dict,
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
