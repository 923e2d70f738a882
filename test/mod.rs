// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.


/// Objects and classes used by the tests.
mod objects {
    use std::any::Any;
    use std::cell::Cell;
    use std::rc::Rc;
    use crate::{Callable, ClassRegistry, Dict, Global, Object, Reduction, Result, Value};

    pub fn class(module: &str, name: &str) -> Rc<Global> {
        Rc::new(Global::new(module, name))
    }

    /// Counts how often it is reduced.
    pub struct Point {
        pub x: i64,
        pub y: i64,
        pub reduced: Rc<Cell<usize>>,
    }

    impl Object for Point {
        fn class(&self) -> Rc<Global> {
            class("geometry", "Point")
        }

        fn reduce(&self) -> Option<Result<Value>> {
            self.reduced.set(self.reduced.get() + 1);
            Some(Ok(Reduction::new(Value::Global(self.class()),
                                   vec![Value::I64(self.x), Value::I64(self.y)]).into_value()))
        }

        fn equals(&self, other: &dyn Object) -> bool {
            match other.as_any().downcast_ref::<Point>() {
                Some(other) => self.x == other.x && self.y == other.y,
                None => false,
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn make_point(args: Vec<Value>) -> Result<Value> {
        let coord = |i: usize| match args.get(i) {
            Some(&Value::I64(v)) => v,
            _ => 0,
        };
        Ok(Value::object(Point { x: coord(0), y: coord(1), reduced: Rc::new(Cell::new(0)) }))
    }

    /// Restores its count through `set_state`.
    pub struct Counter {
        pub count: i64,
    }

    impl Object for Counter {
        fn class(&self) -> Rc<Global> {
            class("counters", "Counter")
        }

        fn reduce_ex(&self, _protocol: u8) -> Option<Result<Value>> {
            Some(Ok(Reduction::newobj(self.class(), vec![])
                    .state(Value::I64(self.count)).into_value()))
        }

        fn set_state(&mut self, state: &Value) -> Option<Result<()>> {
            if let Value::I64(count) = *state {
                self.count = count;
            }
            Some(Ok(()))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    pub struct CounterClass;

    impl Callable for CounterClass {
        fn call(&self, _args: Vec<Value>) -> Result<Value> {
            Ok(Value::object(Counter { count: 0 }))
        }

        fn new_object(&self, _class: &Rc<Global>, _args: Vec<Value>) -> Result<Value> {
            Ok(Value::object(Counter { count: -1 }))
        }
    }

    /// Gets its contents through `listitems` and `dictitems`.
    #[derive(Default)]
    pub struct Bag {
        pub items: Vec<Value>,
        pub pairs: Vec<(Value, Value)>,
    }

    impl Object for Bag {
        fn class(&self) -> Rc<Global> {
            class("bags", "Bag")
        }

        fn reduce(&self) -> Option<Result<Value>> {
            let mut dict = Dict::new();
            for &(ref k, ref v) in &self.pairs {
                if let Err(e) = dict.insert(k.clone(), v.clone()) {
                    return Some(Err(e));
                }
            }
            Some(Ok(Reduction::new(Value::Global(self.class()), vec![])
                    .listitems(self.items.clone())
                    .dictitems(dict)
                    .into_value()))
        }

        fn append(&mut self, item: Value) -> Result<()> {
            self.items.push(item);
            Ok(())
        }

        fn set_item(&mut self, key: Value, value: Value) -> Result<()> {
            self.pairs.push((key, value));
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Reduces to whatever it is given.
    pub struct Custom {
        pub reduced: Option<Value>,
    }

    impl Object for Custom {
        fn class(&self) -> Rc<Global> {
            class("custom", "Custom")
        }

        fn reduce(&self) -> Option<Result<Value>> {
            self.reduced.clone().map(Ok)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    pub fn registry() -> Rc<ClassRegistry> {
        let mut reg = ClassRegistry::new();
        reg.register(Global::with_callable("geometry", "Point", make_point));
        reg.register(Global::with_callable("counters", "Counter", CounterClass));
        reg.register(Global::with_callable("bags", "Bag", |_args: Vec<Value>| -> Result<Value> {
            Ok(Value::object(Bag::default()))
        }));
        Rc::new(reg)
    }
}

mod value_tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use num_bigint::BigInt;
    use rand::{RngCore, thread_rng};
    use quickcheck::{QuickCheck, StdGen};
    use crate::{dumps, loads, value_to_vec, value_from_slice, DeOptions, SerOptions};
    use crate::{Deserializer, Dict, Global, Instance, Object, Value};
    use crate::error::{ErrorCode, ErrorKind};
    use super::arby::Tree;

    const PROTOCOLS: &[u8] = &[0, 1, 2];

    fn list_items(value: &Value) -> Vec<Value> {
        match *value {
            Value::List(ref l) => l.borrow().clone(),
            ref other => panic!("not a list: {}", other),
        }
    }

    fn tuple_items(value: &Value) -> Vec<Value> {
        match *value {
            Value::Tuple(ref t) => t.to_vec(),
            ref other => panic!("not a tuple: {}", other),
        }
    }

    fn dict_of(pairs: Vec<(&str, Value)>) -> Value {
        let mut dict = Dict::new();
        for (k, v) in pairs {
            dict.insert(Value::string(k), v).unwrap();
        }
        Value::dict(dict)
    }

    fn dict_get(value: &Value, key: &str) -> Value {
        match *value {
            Value::Dict(ref d) => d.borrow().get_str(key).cloned().unwrap(),
            ref other => panic!("not a dict: {}", other),
        }
    }

    fn test_object() -> Value {
        let longish = BigInt::from(10000000000u64) * BigInt::from(10000000000u64);
        let mut dict = Dict::new();
        dict.insert(Value::None, Value::None).unwrap();
        dict.insert(Value::Bool(false),
                    Value::tuple(vec![Value::Bool(false), Value::Bool(true)])).unwrap();
        dict.insert(Value::I64(10), Value::I64(100000)).unwrap();
        dict.insert(Value::Int(longish.clone()), Value::Int(longish)).unwrap();
        dict.insert(Value::F64(1.5), Value::F64(-0.25)).unwrap();
        dict.insert(Value::bytes(&b"bytes"[..]), Value::bytes(&b"by\x00tes\n"[..])).unwrap();
        dict.insert(Value::string("string"), Value::string("str\u{e9}ng \\ \u{1F600}")).unwrap();
        dict.insert(Value::tuple(vec![Value::I64(1), Value::I64(2)]),
                    Value::tuple(vec![Value::I64(1), Value::I64(2), Value::I64(3),
                                      Value::I64(-70000), Value::I64(1 << 40)])).unwrap();
        dict.insert(Value::tuple(vec![]),
                    Value::list(vec![
                        Value::list(vec![Value::I64(1), Value::I64(2), Value::I64(3)]),
                        Value::dict(Dict::new()),
                        Value::tuple(vec![]),
                    ])).unwrap();
        Value::dict(dict)
    }

    #[test]
    fn exact_encodings() {
        assert_eq!(dumps(&Value::I64(42), 2).unwrap(), b"\x80\x02K*.");
        assert_eq!(dumps(&Value::string("ab"), 2).unwrap(),
                   b"\x80\x02X\x02\x00\x00\x00abq\x01.");
        assert_eq!(dumps(&Value::tuple(vec![Value::I64(1), Value::I64(2)]), 2).unwrap(),
                   b"\x80\x02K\x01K\x02\x86q\x01.");
        let nested = Value::list(vec![
            Value::I64(1),
            Value::list(vec![Value::I64(2), Value::I64(3)]),
        ]);
        assert_eq!(dumps(&nested, 0).unwrap(), b"(lp1\nI1\na(lp2\nI2\naI3\naa.");
        assert_eq!(dumps(&Value::tuple(vec![]), 0).unwrap(), b"(t.");
        assert_eq!(dumps(&Value::tuple(vec![]), 1).unwrap(), b").");
        assert_eq!(dumps(&Value::Bool(true), 2).unwrap(), b"\x80\x02\x88.");
        assert_eq!(dumps(&Value::Bool(false), 1).unwrap(), b"I00\n.");
        assert_eq!(dumps(&Value::I64(-1), 1).unwrap(), b"J\xff\xff\xff\xff.");
        assert_eq!(dumps(&Value::I64(1000), 1).unwrap(), b"M\xe8\x03.");
        assert_eq!(dumps(&Value::I64(1 << 40), 0).unwrap(), b"L1099511627776L\n.");
        assert_eq!(dumps(&Value::Int(BigInt::from(0)), 2).unwrap(), b"\x80\x02\x8a\x00.");
        assert_eq!(dumps(&Value::Int(BigInt::from(-256)), 2).unwrap(),
                   b"\x80\x02\x8a\x02\x00\xff.");
        assert_eq!(dumps(&Value::bytes(&b"a'b"[..]), 0).unwrap(), b"S'a\\'b'\np1\n.");
        assert_eq!(dumps(&Value::string("a\nb"), 0).unwrap(), b"Va\\u000ab\np1\n.");
        assert_eq!(dumps(&Value::F64(0.5), 0).unwrap(), b"F0.5\n.");
    }

    #[test]
    fn roundtrip() {
        let value = test_object();
        for &proto in PROTOCOLS {
            let pickled = dumps(&value, proto).unwrap();
            let tripped = loads(&pickled).unwrap();
            assert_eq!(value, tripped, "protocol {}", proto);
        }
    }

    #[test]
    fn protocols_agree() {
        let value = test_object();
        let results = PROTOCOLS.iter().map(|&proto| {
            loads(&dumps(&value, proto).unwrap()).unwrap()
        }).collect::<Vec<_>>();
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);
    }

    #[test]
    fn unpickle_python_streams() {
        // pickle.dumps({'a': [1, 2]}, 2) from Python 3
        let value = loads(b"\x80\x02}q\x00X\x01\x00\x00\x00aq\x01]q\x02(K\x01K\x02es.").unwrap();
        assert_eq!(value, dict_of(vec![("a", Value::list(vec![Value::I64(1), Value::I64(2)]))]));

        // pickle.dumps((1, u'\xe9', 2.5, None, True), 2) from Python 2
        let value = loads(b"\x80\x02(K\x01X\x02\x00\x00\x00\xc3\xa9q\x00G@\x04\x00\x00\
                            \x00\x00\x00\x00N\x88tq\x01.").unwrap();
        assert_eq!(value, Value::tuple(vec![Value::I64(1), Value::string("\u{e9}"),
                                            Value::F64(2.5), Value::None, Value::Bool(true)]));

        // An instance of a new-style class with protocol 0, from Python 2
        let value = loads(b"ccopy_reg\n_reconstructor\np0\n(c__main__\nFoo\np1\n\
                            c__builtin__\nobject\np2\nNtp3\nRp4\n(dp5\nS'x'\np6\nI1\nsb.")
            .unwrap();
        let (name, x) = value.with_object(|inst: &Instance| {
            (inst.class().qualified_name(),
             inst.dict().and_then(|d| d.get(&Value::bytes(&b"x"[..])).cloned()))
        }).unwrap();
        assert_eq!(name, "__main__.Foo");
        assert_eq!(x, Some(Value::I64(1)));
    }

    #[test]
    fn shared_references() {
        let inner = Value::list(vec![Value::I64(1)]);
        let text = Value::string("shared");
        let outer = Value::list(vec![inner.clone(), inner, text.clone(), text]);
        for &proto in PROTOCOLS {
            let tripped = loads(&dumps(&outer, proto).unwrap()).unwrap();
            let items = list_items(&tripped);
            assert!(items[0].is(&items[1]));
            assert!(items[2].is(&items[3]));
            assert!(!items[0].is(&items[2]));
            // Mutation through one reference is visible through the other.
            if let Value::List(ref l) = items[0] {
                l.borrow_mut().push(Value::None);
            }
            assert_eq!(list_items(&items[1]).len(), 2);
        }
    }

    #[test]
    fn equal_but_distinct_objects() {
        let outer = Value::list(vec![Value::list(vec![]), Value::list(vec![])]);
        let tripped = loads(&dumps(&outer, 2).unwrap()).unwrap();
        let items = list_items(&tripped);
        assert_eq!(items[0], items[1]);
        assert!(!items[0].is(&items[1]));
    }

    #[test]
    fn self_referential_list() {
        let list = Value::list(vec![Value::I64(1)]);
        if let Value::List(ref l) = list {
            l.borrow_mut().push(list.clone());
        }
        assert_eq!(format!("{}", list), "[1, [...]]");
        for &proto in PROTOCOLS {
            let tripped = loads(&dumps(&list, proto).unwrap()).unwrap();
            let items = list_items(&tripped);
            assert_eq!(items[0], Value::I64(1));
            assert!(items[1].is(&tripped));
        }
    }

    #[test]
    fn self_referential_dict() {
        let dict = Value::dict(Dict::new());
        if let Value::Dict(ref d) = dict {
            d.borrow_mut().insert(Value::string("self"), dict.clone()).unwrap();
        }
        for &proto in PROTOCOLS {
            let tripped = loads(&dumps(&dict, proto).unwrap()).unwrap();
            assert!(dict_get(&tripped, "self").is(&tripped));
        }
    }

    #[test]
    fn tuple_cycle_through_list() {
        let list = Value::list(vec![]);
        let tuple = Value::tuple(vec![list.clone()]);
        if let Value::List(ref l) = list {
            l.borrow_mut().push(tuple.clone());
        }
        assert_eq!(dumps(&tuple, 2).unwrap(), b"\x80\x02]q\x01(h\x01\x85q\x02e0h\x02.");
        assert_eq!(dumps(&tuple, 1).unwrap(), b"(]q\x01((h\x01tq\x02e1h\x02.");
        for &proto in PROTOCOLS {
            let tripped = loads(&dumps(&tuple, proto).unwrap()).unwrap();
            let inner = tuple_items(&tripped)[0].clone();
            assert!(list_items(&inner)[0].is(&tripped));
        }
        // A longer tuple in a cycle.
        let list = Value::list(vec![]);
        let tuple = Value::tuple(vec![Value::I64(1), Value::I64(2), Value::I64(3), list.clone()]);
        if let Value::List(ref l) = list {
            l.borrow_mut().push(tuple.clone());
        }
        for &proto in PROTOCOLS {
            let tripped = loads(&dumps(&tuple, proto).unwrap()).unwrap();
            let items = tuple_items(&tripped);
            assert_eq!(items[2], Value::I64(3));
            assert!(list_items(&items[3])[0].is(&tripped));
        }
    }

    #[test]
    fn batching() {
        let count_appends = |n: usize| {
            let value = Value::list(vec![Value::None; n]);
            let pickled = dumps(&value, 2).unwrap();
            pickled.iter().filter(|&&b| b == b'e').count()
        };
        assert_eq!(count_appends(0), 0);
        assert_eq!(count_appends(1024), 1);
        assert_eq!(count_appends(1025), 2);
        assert_eq!(count_appends(2048), 2);

        let mut dict = Dict::new();
        for i in 0..3000 {
            dict.insert(Value::I64(i), Value::None).unwrap();
        }
        let value = Value::dict(dict);
        for &proto in PROTOCOLS {
            assert_eq!(loads(&dumps(&value, proto).unwrap()).unwrap(), value);
        }
    }

    #[test]
    fn many_memo_entries() {
        let strings = (0..300).map(|i| Value::string(format!("s{}", i))).collect::<Vec<_>>();
        let mut items = strings.clone();
        items.extend(strings);
        let value = Value::list(items);
        for &proto in PROTOCOLS {
            let tripped = list_items(&loads(&dumps(&value, proto).unwrap()).unwrap());
            assert_eq!(tripped.len(), 600);
            for i in 0..300 {
                assert!(tripped[i].is(&tripped[i + 300]));
            }
        }
    }

    #[test]
    fn numbers() {
        let values = vec![
            Value::I64(0), Value::I64(255), Value::I64(256), Value::I64(65535),
            Value::I64(65536), Value::I64(-1), Value::I64(i32::MAX as i64),
            Value::I64(i32::MIN as i64), Value::I64(i32::MAX as i64 + 1),
            Value::I64(i64::MAX), Value::I64(i64::MIN),
            Value::Int(BigInt::from(1) << 2100), Value::Int(-(BigInt::from(1) << 100usize)),
            Value::F64(0.1), Value::F64(-0.0), Value::F64(1e300), Value::F64(5e-324),
            Value::F64(std::f64::INFINITY), Value::F64(std::f64::NEG_INFINITY),
        ];
        for &proto in PROTOCOLS {
            for value in &values {
                let tripped = loads(&dumps(value, proto).unwrap()).unwrap();
                assert_eq!(*value, tripped, "protocol {}", proto);
            }
            match loads(&dumps(&Value::F64(std::f64::NAN), proto).unwrap()).unwrap() {
                Value::F64(f) => assert!(f.is_nan()),
                other => panic!("not a float: {}", other),
            }
        }
        // Small big ints come back as i64, and compare equal.
        let small = Value::Int(BigInt::from(5));
        let tripped = loads(&dumps(&small, 2).unwrap()).unwrap();
        assert!(matches!(tripped, Value::I64(5)));
        assert_eq!(small, tripped);
    }

    #[test]
    fn text_ints() {
        assert_eq!(loads(b"I00\n.").unwrap(), Value::Bool(false));
        assert_eq!(loads(b"I01\n.").unwrap(), Value::Bool(true));
        assert_eq!(loads(b"I-17\n.").unwrap(), Value::I64(-17));
        assert_eq!(loads(b"I99999999999999999999\n.").unwrap(),
                   Value::Int("99999999999999999999".parse().unwrap()));
        assert_eq!(loads(b"L12L\n.").unwrap(), Value::I64(12));
        assert_eq!(loads(b"I12\r\n.").unwrap(), Value::I64(12));
        let err = loads(b"Ixyz\n.").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Value);
    }

    #[test]
    fn text_strings() {
        assert_eq!(loads(b"S'a\\x41\\n\\101\\q'\n.").unwrap(),
                   Value::bytes(&b"aA\nA\\q"[..]));
        assert_eq!(loads(b"S\"it's\"\n.").unwrap(), Value::bytes(&b"it's"[..]));
        assert_eq!(loads(b"Vcaf\xe9 \\u20ac \\U0001f600 a\\b\n.").unwrap(),
                   Value::string("caf\u{e9} \u{20ac} \u{1F600} a\\b"));
        for stream in &[&b"S'abc\n."[..], b"Sabc'\n.", b"S'\n.", b"S'abc\"\n."] {
            let err = loads(stream).unwrap_err();
            assert_eq!(err.code(), Some(&ErrorCode::InsecureString));
            assert_eq!(err.kind(), ErrorKind::Value);
        }
        let long = Value::bytes(vec![b'x'; 300]);
        let pickled = dumps(&long, 1).unwrap();
        assert_eq!(pickled[0], b'T');
        assert_eq!(loads(&pickled).unwrap(), long);
    }

    #[test]
    fn errors() {
        let kind = |stream: &[u8]| loads(stream).unwrap_err().kind();
        assert_eq!(kind(b"\x80\x02h\x05."), ErrorKind::BadMemoReference);
        assert_eq!(kind(b"g7\n."), ErrorKind::BadMemoReference);
        assert_eq!(kind(b"\x80\x03N."), ErrorKind::Value);
        assert_eq!(kind(b"\x80\x02t."), ErrorKind::Unpickling);
        assert_eq!(kind(b"\x80\x02a."), ErrorKind::Unpickling);
        assert_eq!(kind(b"\x80\x02K\x01a."), ErrorKind::Unpickling);
        assert_eq!(kind(b"\x80\x02}]Ns."), ErrorKind::Unpickling);
        assert_eq!(kind(b"(K\x01d."), ErrorKind::Unpickling);
        assert_eq!(kind(b"T\xff\xff\xff\xff."), ErrorKind::Unpickling);
        assert_eq!(kind(b"N.N"), ErrorKind::Unpickling);
        assert_eq!(kind(b""), ErrorKind::EndOfStream);
        assert_eq!(kind(b"\x80\x02X\x10\x00\x00\x00abc"), ErrorKind::EndOfStream);

        match loads(b"\xff") {
            Err(e) => assert_eq!(e.code(), Some(&ErrorCode::Unsupported(0xff))),
            Ok(v) => panic!("unexpected success: {}", v),
        }
        match loads(b"\x80\x02}]Ns.") {
            Err(e) => assert_eq!(e.code(), Some(&ErrorCode::ValueNotHashable)),
            Ok(v) => panic!("unexpected success: {}", v),
        }

        let err = dumps(&Value::None, 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Value);
    }

    #[test]
    fn truncated_streams() {
        let value = test_object();
        for &proto in PROTOCOLS {
            let pickled = dumps(&value, proto).unwrap();
            for end in 0..pickled.len() {
                let err = loads(&pickled[..end]).unwrap_err();
                assert!(err.kind() == ErrorKind::EndOfStream || err.kind() == ErrorKind::Unpickling,
                        "protocol {}, truncated at {}: {}", proto, end, err);
            }
        }
    }

    #[test]
    fn fuzzing() {
        // Tries to ensure that we don't panic when encountering strange streams.
        for _ in 0..1000 {
            let mut stream = [0u8; 1000];
            thread_rng().fill_bytes(&mut stream);
            if *stream.last().unwrap() == b'.' { continue; }
            // These must all fail with an error, since we skip the check if the
            // last byte is a STOP opcode.
            assert!(value_from_slice(&stream, DeOptions::new()).is_err());
        }
    }

    #[test]
    fn several_pickles_per_stream() {
        let mut stream = dumps(&Value::I64(1), 2).unwrap();
        stream.extend(dumps(&Value::string("two"), 0).unwrap());
        let mut de = Deserializer::new(&stream[..], DeOptions::new());
        assert_eq!(de.load().unwrap(), Value::I64(1));
        assert_eq!(de.load().unwrap(), Value::string("two"));
        de.end().unwrap();

        let mut reader = &b"N.K\x02."[..];
        assert_eq!(crate::load(&mut reader).unwrap(), Value::None);
        assert_eq!(crate::load(&mut reader).unwrap(), Value::I64(2));

        let mut de = Deserializer::new(&b"\xffN."[..], DeOptions::new());
        assert!(de.load().is_err());
        assert_eq!(de.load().unwrap_err().code(), Some(&ErrorCode::StreamFailed));
    }

    #[test]
    fn deep_nesting() {
        let mut value = Value::None;
        for _ in 0..200 {
            value = Value::list(vec![value]);
        }
        for &proto in PROTOCOLS {
            assert_eq!(loads(&dumps(&value, proto).unwrap()).unwrap(), value);
        }
    }

    #[test]
    fn dict_keys() {
        let mut dict = Dict::new();
        assert_eq!(dict.insert(Value::I64(1), Value::string("int")).unwrap(), None);
        assert_eq!(dict.insert(Value::F64(1.0), Value::string("float")).unwrap(),
                   Some(Value::string("int")));
        assert_eq!(dict.len(), 1);
        assert!(matches!(dict.keys().next(), Some(&Value::I64(1))));
        assert_eq!(dict.get(&Value::Int(BigInt::from(1))), Some(&Value::string("float")));
        assert!(dict.insert(Value::list(vec![]), Value::None).is_err());
        assert!(dict.insert(Value::tuple(vec![Value::dict(Dict::new())]), Value::None).is_err());

        let key = Global::new("mod", "name").into_value();
        dict.insert(key.clone(), Value::None).unwrap();
        assert!(dict.get(&key).is_some());
        assert!(dict.get(&Global::new("mod", "name").into_value()).is_none());
    }

    #[test]
    fn display() {
        let value = Value::tuple(vec![Value::I64(1)]);
        assert_eq!(format!("{}", value), "(1,)");
        let value = dict_of(vec![("a", Value::bytes(&b"x\x00"[..])),
                                 ("b", Value::Bool(true))]);
        assert_eq!(format!("{}", value), r#"{"a": b'x\x00', "b": True}"#);
        let inst = Instance::new(Rc::new(Global::new("m", "C"))).into_value();
        assert_eq!(format!("{}", inst), "<m.C {}>");
    }

    #[test]
    fn memo_table() {
        use crate::memo::PickleMemo;
        let values = (0..5000).map(|i| Value::string(i.to_string())).collect::<Vec<_>>();
        let mut memo = PickleMemo::new();
        for (i, value) in values.iter().enumerate() {
            memo.put(value.identity().unwrap(), i as u32 + 1, value.clone()).unwrap();
        }
        assert_eq!(memo.len(), 5000);
        for (i, value) in values.iter().enumerate() {
            assert_eq!(memo.find_position(value.identity().unwrap()), Some(i as u32 + 1));
        }
        assert_eq!(memo.find_position(Value::string("x").identity().unwrap()), None);
        // Putting an identity again replaces its position.
        memo.put(values[0].identity().unwrap(), 9999, values[0].clone()).unwrap();
        assert_eq!(memo.len(), 5000);
        assert_eq!(memo.find_position(values[0].identity().unwrap()), Some(9999));
    }

    #[test]
    fn qc_roundtrip() {
        fn roundtrip(original: Tree) {
            let value = original.to_value();
            for &proto in PROTOCOLS {
                let options = SerOptions::new().proto(proto);
                let vec: Vec<_> = value_to_vec(&value, options).unwrap();
                let tripped = value_from_slice(&vec, DeOptions::new()).unwrap();
                assert_eq!(value, tripped);
            }
        }
        QuickCheck::new().gen(StdGen::new(thread_rng(), 10))
                         .tests(2000)
                         .quickcheck(roundtrip as fn(_));
    }

    #[test]
    fn roundtrip_json() {
        let original: serde_json::Value = serde_json::from_str(r#"[
            {"null": null,
             "false": false,
             "true": true,
             "int": -1238571,
             "float": 1.5e10,
             "list": [false, 5, "true", 3.8]
            }
        ]"#).unwrap();
        let value: Value = serde_json::from_value(original.clone()).unwrap();
        let tripped = loads(&dumps(&value, 2).unwrap()).unwrap();
        let json = serde_json::to_value(&tripped).unwrap();
        assert_eq!(original, json);
    }

    #[test]
    fn json_of_graphs() {
        let inner = Value::list(vec![Value::I64(1)]);
        let shared = Value::list(vec![inner.clone(), inner]);
        assert_eq!(serde_json::to_string(&shared).unwrap(), "[[1],[1]]");

        let cyclic = Value::list(vec![]);
        if let Value::List(ref l) = cyclic {
            l.borrow_mut().push(cyclic.clone());
        }
        assert!(serde_json::to_string(&cyclic).is_err());

        let mut attrs = Dict::new();
        attrs.insert(Value::string("x"), Value::I64(3)).unwrap();
        let inst = Instance::with_dict(Rc::new(Global::new("m", "C")), attrs).into_value();
        assert_eq!(serde_json::to_string(&inst).unwrap(), r#"{"__class__":"m.C","x":3}"#);
    }

    #[test]
    fn persistent_ids() {
        let value = Value::list(vec![Value::string("ext-a"), Value::I64(5), Value::string("b")]);
        let options = || SerOptions::new().persistent_id(|v: &Value| Ok(match v.as_str() {
            Some(s) if s.starts_with("ext-") => Some(Value::string(format!("id:{}", &s[4..]))),
            _ => None,
        }));

        let pickled = value_to_vec(&value, options().proto_v0()).unwrap();
        assert!(pickled.windows(6).any(|w| w == b"Pid:a\n"));
        let pickled2 = value_to_vec(&value, options().proto_v2()).unwrap();
        assert!(pickled2.contains(&b'Q'));

        for stream in &[&pickled, &pickled2] {
            let de = DeOptions::new().persistent_load(|pid: Value| {
                Ok(Value::string(format!("loaded {}", pid.as_str().unwrap_or("?"))))
            });
            let tripped = list_items(&value_from_slice(stream, de).unwrap());
            assert_eq!(tripped[0], Value::string("loaded id:a"));
            assert_eq!(tripped[2], Value::string("b"));

            let ids = Rc::new(RefCell::new(vec![]));
            let de = DeOptions::new().persistent_collect(ids.clone());
            let tripped = list_items(&value_from_slice(stream, de).unwrap());
            assert_eq!(tripped[0], Value::string("id:a"));
            assert_eq!(*ids.borrow(), vec![Value::string("id:a")]);

            let err = loads(stream).unwrap_err();
            assert_eq!(err.code(), Some(&ErrorCode::NoPersistentLoad));
        }

        let bad = SerOptions::new().proto_v0().persistent_id(|_: &Value| Ok(Some(Value::I64(1))));
        let err = value_to_vec(&Value::None, bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Pickling);
    }

    #[test]
    fn extension_codes() {
        use crate::ExtensionRegistry;
        let mut reg = ExtensionRegistry::new();
        reg.add("geometry", "Origin", 0x42).unwrap();
        reg.add("geometry", "Axis", 0x1234).unwrap();
        reg.add("geometry", "Plane", 0x123456).unwrap();
        reg.add("geometry", "Origin", 0x42).unwrap();
        assert!(reg.add("geometry", "Origin", 0x43).is_err());
        assert!(reg.add("other", "Thing", 0x42).is_err());
        assert!(reg.add("other", "Thing", 0).is_err());
        let reg = Rc::new(reg);

        let origin = Global::new("geometry", "Origin").into_value();
        let value = Value::list(vec![
            origin.clone(), origin,
            Global::new("geometry", "Axis").into_value(),
            Global::new("geometry", "Plane").into_value(),
        ]);
        let pickled = value_to_vec(&value, SerOptions::new().extensions(reg.clone())).unwrap();
        assert_eq!(pickled.windows(2).filter(|w| *w == b"\x82\x42").count(), 2);
        assert!(pickled.windows(3).any(|w| w == b"\x83\x34\x12"));
        assert!(pickled.windows(5).any(|w| w == b"\x84\x56\x34\x12\x00"));

        let tripped = value_from_slice(&pickled, DeOptions::new().extensions(reg.clone())).unwrap();
        assert_eq!(tripped, value);
        let err = loads(&pickled).unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::UnregisteredExtension(0x42)));
        assert_eq!(err.kind(), ErrorKind::Value);

        // Protocol 1 has no EXT opcodes.
        let pickled = value_to_vec(&value, SerOptions::new().proto_v1().extensions(reg)).unwrap();
        assert!(!pickled.contains(&0x82));
        assert_eq!(loads(&pickled).unwrap(), value);
    }

    #[test]
    fn extension_registry() {
        use crate::ExtensionRegistry;
        let mut reg = ExtensionRegistry::new();
        reg.add("a", "b", 7).unwrap();
        assert_eq!(reg.code("a", "b"), Some(7));
        assert_eq!(reg.lookup(7), Some(("a", "b")));
        assert!(reg.remove("a", "b", 8).is_err());
        reg.remove("a", "b", 7).unwrap();
        assert!(reg.is_empty());
        assert_eq!(reg.lookup(7), None);
    }

    #[test]
    fn globals() {
        let value = Global::new("foo", "bar").into_value();
        assert_eq!(dumps(&value, 0).unwrap(), b"cfoo\nbar\np1\n.");
        let tripped = loads(b"cfoo\nbar\n.").unwrap();
        assert_eq!(tripped, value);
        match tripped {
            Value::Global(ref g) => assert!(g.callable().is_none()),
            ref other => panic!("not a global: {}", other),
        }

        let err = value_from_slice(b"cfoo\nbar\n.", DeOptions::new().deny_unknown_globals())
            .unwrap_err();
        assert_eq!(err.code(),
                   Some(&ErrorCode::UnresolvedGlobal("foo".into(), "bar".into())));

        let de = DeOptions::new().resolve_global(|module: &str, name: &str| {
            Ok(if module == "foo" { Some(Value::string(name)) } else { None })
        });
        assert_eq!(value_from_slice(b"cfoo\nbar\n.", de).unwrap(), Value::string("bar"));

        let err = dumps(&Global::new("foo", "bad\nname").into_value(), 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Pickling);

        // Calling an unresolved global fails.
        let err = loads(b"cfoo\nbar\n(K\x01tR.").unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::NotCallable("foo.bar".into())));
    }

    #[test]
    fn instances() {
        let class = Rc::new(Global::new("shapes", "Square"));
        let mut attrs = Dict::new();
        attrs.insert(Value::string("side"), Value::I64(4)).unwrap();
        attrs.insert(Value::string("name"), Value::string("sq")).unwrap();
        let inst = Instance::with_dict(class.clone(), attrs).into_value();
        if let Value::Object(ref o) = inst {
            o.borrow_mut().set_attr("me", inst.clone()).unwrap();
        }

        let pickled = dumps(&inst, 2).unwrap();
        assert!(pickled.contains(&0x81));
        for &proto in PROTOCOLS {
            let tripped = loads(&dumps(&inst, proto).unwrap()).unwrap();
            let (name, side, me_is_self) = tripped.with_object(|i: &Instance| {
                (i.class().qualified_name(), i.get_attr("side").cloned(),
                 i.get_attr("me").map(|me| me.is(&tripped)))
            }).unwrap();
            assert_eq!(name, "shapes.Square");
            assert_eq!(side, Some(Value::I64(4)));
            assert_eq!(me_is_self, Some(true));
        }

        let empty = Instance::new(class).into_value();
        for &proto in PROTOCOLS {
            assert_eq!(loads(&dumps(&empty, proto).unwrap()).unwrap(), empty);
        }
    }

    #[test]
    fn reduce_called_once_per_object() {
        use super::objects::{registry, Point};
        let counter = Rc::new(Cell::new(0));
        let p = Value::object(Point { x: 1, y: 2, reduced: counter.clone() });
        let q = Value::object(Point { x: 3, y: 4, reduced: counter.clone() });
        let value = Value::list(vec![p.clone(), p, q]);
        for &proto in PROTOCOLS {
            counter.set(0);
            let pickled = dumps(&value, proto).unwrap();
            assert_eq!(counter.get(), 2);

            let tripped = value_from_slice(&pickled, DeOptions::new().classes(registry())).unwrap();
            let items = list_items(&tripped);
            assert!(items[0].is(&items[1]));
            assert_eq!(items[0].with_object(|p: &Point| (p.x, p.y)), Some((1, 2)));
            assert_eq!(items[2].with_object(|p: &Point| (p.x, p.y)), Some((3, 4)));
            assert_eq!(tripped, value);
        }
    }

    #[test]
    fn set_state_hook() {
        use super::objects::{registry, Counter};
        let value = Value::object(Counter { count: 7 });
        for &proto in PROTOCOLS {
            let pickled = dumps(&value, proto).unwrap();
            let tripped = value_from_slice(&pickled, DeOptions::new().classes(registry())).unwrap();
            assert_eq!(tripped.with_object(|c: &Counter| c.count), Some(7));
        }
    }

    #[test]
    fn list_and_dict_items() {
        use super::objects::{registry, Bag};
        let bag = Value::object(Bag {
            items: vec![Value::I64(1), Value::string("two")],
            pairs: vec![(Value::string("k"), Value::None)],
        });
        for &proto in PROTOCOLS {
            let pickled = dumps(&bag, proto).unwrap();
            let tripped = value_from_slice(&pickled, DeOptions::new().classes(registry())).unwrap();
            let (items, pairs) = tripped.with_object(|b: &Bag| {
                (b.items.clone(), b.pairs.clone())
            }).unwrap();
            assert_eq!(items, vec![Value::I64(1), Value::string("two")]);
            assert_eq!(pairs, vec![(Value::string("k"), Value::None)]);
        }
    }

    #[test]
    fn slot_state() {
        use super::objects::Custom;
        let class = Rc::new(Global::new("slots", "Thing"));
        let slots = dict_of(vec![("a", Value::I64(1))]);
        for state in vec![Value::tuple(vec![Value::None, slots.clone()]),
                          Value::tuple(vec![dict_of(vec![("b", Value::I64(2))]), slots])] {
            let reduced = crate::Reduction::newobj(class.clone(), vec![]).state(state);
            let value = Value::object(Custom { reduced: Some(reduced.into_value()) });
            let tripped = loads(&dumps(&value, 2).unwrap()).unwrap();
            assert_eq!(tripped.with_object(|i: &Instance| i.get_attr("a").cloned()),
                       Some(Some(Value::I64(1))));
        }

        let err = loads(b"\x80\x02cslots\nThing\n)\x81K\x05b.").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unpickling);
    }

    #[test]
    fn invalid_reductions() {
        use super::objects::Custom;
        let cases = vec![
            None,
            Some(Value::I64(5)),
            Some(Value::tuple(vec![Value::None])),
            Some(Value::tuple(vec![Value::None; 6])),
            Some(Value::tuple(vec![Global::new("m", "f").into_value(), Value::I64(1)])),
            Some(Value::tuple(vec![Global::new("copyreg", "__newobj__").into_value(),
                                   Value::tuple(vec![Value::I64(1)])])),
        ];
        for reduced in cases {
            let value = Value::object(Custom { reduced });
            let err = dumps(&value, 2).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Pickling, "{}", err);
        }

        let value = Value::object(Custom { reduced: Some(Value::string("INSTANCE")) });
        let pickled = dumps(&value, 2).unwrap();
        assert_eq!(loads(&pickled).unwrap(), Global::new("custom", "INSTANCE").into_value());
    }

    #[test]
    fn inst_and_obj() {
        use super::objects::{registry, Point};
        let de = || DeOptions::new().classes(registry());
        let value = value_from_slice(b"(I1\nI2\nigeometry\nPoint\n.", de()).unwrap();
        assert_eq!(value.with_object(|p: &Point| (p.x, p.y)), Some((1, 2)));
        let value = value_from_slice(b"\x80\x02(cgeometry\nPoint\nK\x03K\x04o.", de()).unwrap();
        assert_eq!(value.with_object(|p: &Point| (p.x, p.y)), Some((3, 4)));

        let value = loads(b"(imodule\nThing\n.").unwrap();
        assert_eq!(value.with_object(|i: &Instance| i.class().qualified_name()),
                   Some("module.Thing".to_string()));
        let err = loads(b"(K\x01imodule\nThing\n.").unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::NotCallable("module.Thing".into())));
    }

    #[test]
    fn unpicklable_objects() {
        use super::objects::Custom;
        let value = Value::list(vec![Value::object(Custom { reduced: None })]);
        let err = dumps(&value, 1).unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::Unpicklable("custom.Custom".into())));
        assert_eq!(err.kind(), ErrorKind::Pickling);
    }

    #[test]
    fn nesting_limit() {
        let mut stream = vec![b'('; 200_000];
        stream.extend(vec![b'l'; 200_000]);
        let err = loads(&stream).unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::NestingTooDeep(crate::DEFAULT_MAX_DEPTH)));
        assert_eq!(err.kind(), ErrorKind::Unpickling);
        stream.push(b'.');
        let err = loads(&stream).unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::NestingTooDeep(crate::DEFAULT_MAX_DEPTH)));

        let mut value = Value::None;
        for _ in 0..10 {
            value = Value::list(vec![value]);
        }
        for &proto in PROTOCOLS {
            let pickled = dumps(&value, proto).unwrap();
            assert_eq!(value_from_slice(&pickled, DeOptions::new().max_depth(10)).unwrap(), value);
            let err = value_from_slice(&pickled, DeOptions::new().max_depth(9)).unwrap_err();
            assert_eq!(err.code(), Some(&ErrorCode::NestingTooDeep(9)));
        }
        let err = value_from_slice(b"(((K\x01ttt.", DeOptions::new().max_depth(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unpickling);
    }

    #[test]
    fn nesting_through_memo_references() {
        // Empty lists are memoized first and linked into a chain later.
        let mut stream = vec![];
        for i in 0..200_000u32 {
            stream.push(b']');
            stream.push(b'r');
            stream.extend(&i.to_le_bytes());
            stream.push(b'0');
        }
        for i in 0..199_999u32 {
            stream.push(b'j');
            stream.extend(&i.to_le_bytes());
            stream.push(b'j');
            stream.extend(&(i + 1).to_le_bytes());
            stream.extend(b"a0");
        }
        stream.extend(b"j\x00\x00\x00\x00");
        assert_eq!(loads(&stream).unwrap_err().kind(), ErrorKind::EndOfStream);
        stream.push(b'.');
        let err = loads(&stream).unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::NestingTooDeep(crate::DEFAULT_MAX_DEPTH)));
    }

    #[test]
    fn cycles_do_not_nest() {
        let list = Value::list(vec![]);
        if let Value::List(ref l) = list {
            for _ in 0..5000 {
                l.borrow_mut().push(Value::tuple(vec![list.clone()]));
            }
        }
        for &proto in PROTOCOLS {
            let tripped = loads(&dumps(&list, proto).unwrap()).unwrap();
            let items = list_items(&tripped);
            assert_eq!(items.len(), 5000);
            assert!(tuple_items(&items[4999])[0].is(&tripped));
        }
    }

    #[test]
    fn dup() {
        assert_eq!(loads(b"(K\x012t.").unwrap(),
                   Value::tuple(vec![Value::I64(1), Value::I64(1)]));
        for stream in &[&b"]q\x01h\x01\x86."[..], &b"]2\x86."[..], &b"(]2t."[..]] {
            let items = tuple_items(&loads(stream).unwrap());
            assert_eq!(items.len(), 2);
            assert!(items[0].is(&items[1]));
        }
        let value = loads(b"]2a.").unwrap();
        assert!(list_items(&value)[0].is(&value));
        assert_eq!(format!("{}", value), "[[...]]");
        assert_eq!(loads(b"2.").unwrap_err().code(), Some(&ErrorCode::StackUnderflow));
    }

    #[test]
    fn registered_reducers() {
        use crate::{ReducerRegistry, Reduction};
        use super::objects::{registry, Counter, Point};
        let mut reducers = ReducerRegistry::new();
        reducers.register("geometry", "Point", |object: &dyn Object| {
            let (x, y) = object.as_any().downcast_ref::<Point>()
                .map(|p| (p.x, p.y)).unwrap_or((0, 0));
            Ok(Reduction::new(Global::new("geometry", "Point").into_value(),
                              vec![Value::I64(y), Value::I64(x)]).into_value())
        });
        let reducers = Rc::new(reducers);
        assert_eq!(reducers.len(), 1);

        let counter = Rc::new(Cell::new(0));
        let p = Value::object(Point { x: 1, y: 2, reduced: counter.clone() });
        let value = Value::list(vec![p.clone(), p, Value::object(Counter { count: 3 })]);
        for &proto in PROTOCOLS {
            let options = SerOptions::new().proto(proto).reducers(reducers.clone());
            let pickled = value_to_vec(&value, options).unwrap();
            assert_eq!(counter.get(), 0);
            let tripped = value_from_slice(&pickled, DeOptions::new().classes(registry())).unwrap();
            let items = list_items(&tripped);
            assert!(items[0].is(&items[1]));
            assert_eq!(items[0].with_object(|p: &Point| (p.x, p.y)), Some((2, 1)));
            // Classes without a registered reducer use their own hooks.
            assert_eq!(items[2].with_object(|c: &Counter| c.count), Some(3));
        }

        let mut reducers = ReducerRegistry::new();
        reducers.register("geometry", "Point", |_: &dyn Object| Ok(Value::string("ORIGIN")));
        let point = Value::object(Point { x: 0, y: 0, reduced: counter.clone() });
        let pickled = value_to_vec(&point, SerOptions::new().reducers(Rc::new(reducers))).unwrap();
        assert_eq!(loads(&pickled).unwrap(), Global::new("geometry", "ORIGIN").into_value());
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn default_reduction_globals_written_once() {
        use super::objects::Counter;
        let class = Rc::new(Global::new("shapes", "Dot"));
        let value = Value::list(vec![Instance::new(class.clone()).into_value(),
                                     Instance::new(class).into_value()]);
        let counters = Value::list(vec![Value::object(Counter { count: 1 }),
                                        Value::object(Counter { count: 2 })]);
        for &proto in &[0, 1] {
            let pickled = dumps(&value, proto).unwrap();
            let count = |needle: &[u8]| {
                pickled.windows(needle.len()).filter(|w| *w == needle).count()
            };
            assert_eq!(count(&b"_reconstructor"[..]), 1);
            assert_eq!(count(&b"builtins\nobject"[..]), 1);
            assert_eq!(loads(&pickled).unwrap(), value);

            let pickled = dumps(&counters, proto).unwrap();
            assert_eq!(pickled.windows(10).filter(|w| *w == b"__newobj__").count(), 1);
        }
    }

    #[test]
    fn inst_persistent_ids() {
        use super::objects::{registry, Point};
        let reduced = Rc::new(Cell::new(0));
        let p = Value::object(Point { x: 1, y: 2, reduced: reduced.clone() });
        let q = Value::object(Point { x: 5, y: 6, reduced: reduced.clone() });
        let value = Value::list(vec![p, q.clone(), q, Value::string("point")]);

        let asked = Rc::new(Cell::new(0));
        let hook = {
            let asked = asked.clone();
            move |v: &Value| -> crate::Result<Option<Value>> {
                asked.set(asked.get() + 1);
                Ok(v.with_object(|p: &Point| p.x).filter(|&x| x == 1)
                   .map(|_| Value::string("point-1")))
            }
        };
        for &proto in PROTOCOLS {
            asked.set(0);
            reduced.set(0);
            let options = SerOptions::new().proto(proto).inst_persistent_id(hook.clone());
            let pickled = value_to_vec(&value, options).unwrap();
            // Asked for each object once, and never for strings.
            assert_eq!(asked.get(), 2);
            assert_eq!(reduced.get(), 1);

            let ids = Rc::new(RefCell::new(vec![]));
            let de = DeOptions::new().classes(registry()).persistent_collect(ids.clone());
            let items = list_items(&value_from_slice(&pickled, de).unwrap());
            assert_eq!(*ids.borrow(), vec![Value::string("point-1")]);
            assert_eq!(items[0], Value::string("point-1"));
            assert!(items[1].is(&items[2]));
            assert_eq!(items[3], Value::string("point"));
        }
    }
}
