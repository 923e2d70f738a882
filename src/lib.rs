// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Object graph serialization in Python's pickle format
//!
//! # Pickle format
//!
//! Please see the [Python docs](http://docs.python.org/library/pickle) for
//! details on the Pickle format.
//!
//! This crate reads and writes pickle protocols 0, 1 and 2.  Protocol 0 is
//! plain text, protocol 1 adds binary encodings, and protocol 2 adds compact
//! small tuples, booleans and longs, and NEWOBJ.  All three are compatible
//! with Python 2 and 3.
//!
//! # Object graphs
//!
//! Unlike a tree serializer, pickling preserves *identity*.  A `Value` that
//! is referenced from several places is written once and referenced by its
//! memo position afterwards, and unpickling hands out the same object for
//! every reference.  Since containers are written empty and filled
//! afterwards, self-referential structures survive the round trip:
//!
//! ```
//! use graph_pickle::Value;
//!
//! let list = Value::list(vec![Value::I64(1)]);
//! if let Value::List(ref l) = list {
//!     l.borrow_mut().push(list.clone());
//! }
//! let pickled = graph_pickle::dumps(&list, 2).unwrap();
//! let restored = graph_pickle::loads(&pickled).unwrap();
//! if let Value::List(ref l) = restored {
//!     assert!(l.borrow()[1].is(&restored));
//! }
//! ```
//!
//! (Such cycles are reference cycles, and are never freed.)
//!
//! # Supported types
//!
//! * None
//! * Boolean (Rust `bool`)
//! * Integers (Rust `i64` or bigints from num)
//! * Floats (Rust `f64`)
//! * Bytes and (Unicode) strings
//! * Tuples, lists and dictionaries
//! * Globals: references to classes and functions by module and name
//! * Any other object implementing the `Object` trait, pickled through its
//!   reduce hook
//!
//! When unpickling, globals are resolved through a `ClassRegistry`.  Classes
//! that are not registered produce generic `Instance` objects holding the
//! class name and the attribute dictionary, which pickle again the same way.
//!
//! # Hooks
//!
//! - Persistent ids: `SerOptions::persistent_id` can replace any value by an
//!   id, which `DeOptions::persistent_load` maps back.
//! - Extension codes: an `ExtensionRegistry` shared by both sides makes
//!   protocol 2 write registered globals as small integers.
//! - Reducers: a `ReducerRegistry` given to `SerOptions::reducers` pickles
//!   objects of a class without going through their own reduce hooks.
//! - Untrusted input: `DeOptions::max_depth` bounds how deeply containers
//!   may nest, so that dropping a decoded value can't exhaust the stack.
//!
//! # Exported API
//!
//! `dumps`/`dump` and `loads`/`load` take and produce `Value`s with default
//! options.  The `value_to_*` and `value_from_*` functions take option
//! structs, and `Serializer`/`Deserializer` can write and read several
//! pickles on one stream.
//!
//! `Value` also implements serde's `Serialize` and `Deserialize`, to convert
//! (acyclic) graphs to and from other formats such as JSON.
//!
//! # Minimum Supported Rust Version
//!
//! The minimum supported version of the toolchain is 1.58.1.

pub use self::ser::{
    Serializer,
    SerOptions,
    value_to_writer,
    value_to_vec,
    dump,
    dumps,
};

pub use self::de::{
    Deserializer,
    DeOptions,
    PersistentLoad,
    DEFAULT_MAX_DEPTH,
    value_from_reader,
    value_from_slice,
    value_from_iter,
    load,
    loads,
};

pub use self::value::{
    Value,
    Dict,
    HashableValue,
};

pub use self::object::{
    Callable,
    Global,
    Instance,
    Object,
    Reduction,
};

pub use self::registry::{ClassRegistry, ExtensionRegistry, ReducerRegistry};

pub use self::consts::{HIGHEST_PROTOCOL, DEFAULT_PROTOCOL};

pub use self::error::{Error, ErrorCode, ErrorKind, Result};

pub mod ser;
pub mod de;
pub mod error;
pub mod value;
pub mod object;
pub mod registry;
pub mod memo;
pub mod consts;
mod value_impls;

#[cfg(test)]
#[path = "../test/mod.rs"]
mod test;
