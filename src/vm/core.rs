//! The built-in classes and their native methods.
//!
//! Bootstrapping creates the bare class objects; `install` then defines
//! them as globals and binds every primitive. Object's methods are bound
//! first and copied into every other table, so inheritance stays a flat
//! copy rather than a lookup chain — the same rule user classes follow at
//! creation time.

use std::cell::RefCell;

use crate::vm::fiber::Fiber;
use crate::vm::heap::{self, Heap};
use crate::vm::value::{
    ClassObj, FiberAction, Method, ObjKind, ObjRef, PrimitiveFn, PrimitiveResult, Value,
};
use crate::vm::vm::{fiber_mut, Vm};

/// The classes every value resolves to in O(1).
pub(crate) struct CoreClasses {
    pub object: ObjRef,
    pub class: ObjRef,
    pub nil: ObjRef,
    pub boolean: ObjRef,
    pub num: ObjRef,
    pub string: ObjRef,
    pub function: ObjRef,
    pub list: ObjRef,
    pub map: ObjRef,
    pub range: ObjRef,
    pub fiber: ObjRef,
}

impl CoreClasses {
    pub fn bootstrap(heap: &mut Heap) -> Self {
        let object = make_class(heap, "Object", None);
        let class = make_class(heap, "Class", Some(object.clone()));
        Self {
            nil: make_class(heap, "Nil", Some(object.clone())),
            boolean: make_class(heap, "Bool", Some(object.clone())),
            num: make_class(heap, "Num", Some(object.clone())),
            string: make_class(heap, "String", Some(object.clone())),
            function: make_class(heap, "Fn", Some(object.clone())),
            list: make_class(heap, "List", Some(object.clone())),
            map: make_class(heap, "Map", Some(object.clone())),
            range: make_class(heap, "Range", Some(object.clone())),
            fiber: make_class(heap, "Fiber", Some(object.clone())),
            object,
            class,
        }
    }

    pub fn all(&self) -> [&ObjRef; 11] {
        [
            &self.object,
            &self.class,
            &self.nil,
            &self.boolean,
            &self.num,
            &self.string,
            &self.function,
            &self.list,
            &self.map,
            &self.range,
            &self.fiber,
        ]
    }

    pub fn mark(&self) {
        for class in self.all() {
            heap::mark_object(class);
        }
    }
}

fn make_class(heap: &mut Heap, name: &str, superclass: Option<ObjRef>) -> ObjRef {
    let metaclass = heap.allocate(ObjKind::Class(ClassObj {
        name: format!("{} metaclass", name),
        superclass: None,
        metaclass: None,
        num_fields: 0,
        methods: RefCell::new(Vec::new()),
    }));
    heap.allocate(ObjKind::Class(ClassObj {
        name: name.to_string(),
        superclass,
        metaclass: Some(metaclass),
        num_fields: 0,
        methods: RefCell::new(Vec::new()),
    }))
}

/// Put a method into a class's table. Shared by core installation and the
/// host-facing registration interface.
pub(crate) fn bind(class: &ObjRef, symbol: u16, method: Method) {
    if let Some(class) = class.as_class() {
        class.set_method(symbol, method);
    }
}

fn bind_prim(vm: &mut Vm, class: &ObjRef, signature: &str, function: PrimitiveFn) {
    let symbol = vm.method_names.ensure(signature);
    bind(class, symbol, Method::Primitive(function));
}

fn bind_fiber_prim(
    vm: &mut Vm,
    class: &ObjRef,
    signature: &str,
    function: crate::vm::value::FiberPrimitiveFn,
) {
    let symbol = vm.method_names.ensure(signature);
    bind(class, symbol, Method::FiberPrimitive(function));
}

fn metaclass_of(class: &ObjRef) -> ObjRef {
    class
        .as_class()
        .and_then(|c| c.metaclass.clone())
        .expect("core class has a metaclass")
}

/// Define the core classes as globals and bind all primitives.
pub(crate) fn install(vm: &mut Vm) {
    let object = vm.core.object.clone();
    let class = vm.core.class.clone();
    let nil = vm.core.nil.clone();
    let boolean = vm.core.boolean.clone();
    let num = vm.core.num.clone();
    let string = vm.core.string.clone();
    let function = vm.core.function.clone();
    let list = vm.core.list.clone();
    let map = vm.core.map.clone();
    let range = vm.core.range.clone();
    let fiber = vm.core.fiber.clone();

    for core_class in [
        (&object, "Object"),
        (&class, "Class"),
        (&nil, "Nil"),
        (&boolean, "Bool"),
        (&num, "Num"),
        (&string, "String"),
        (&function, "Fn"),
        (&list, "List"),
        (&map, "Map"),
        (&range, "Range"),
        (&fiber, "Fiber"),
    ] {
        let (obj, name) = core_class;
        vm.define_global(name, Value::Obj((*obj).clone()));
    }

    // ===== Object =====
    bind_prim(vm, &object, "== ", obj_eqeq);
    bind_prim(vm, &object, "!= ", obj_bangeq);
    bind_prim(vm, &object, "!", obj_not);
    bind_prim(vm, &object, "toString", obj_to_string);
    bind_prim(vm, &object, "type", obj_type);

    // Every other table starts as a copy of Object's, including the
    // metaclasses, so classes and instances alike respond to the basics.
    let object_methods = object
        .as_class()
        .expect("Object is a class")
        .methods
        .borrow()
        .clone();
    for core_class in vm.core.all() {
        if !std::rc::Rc::ptr_eq(core_class, &object) {
            if let Some(c) = core_class.as_class() {
                *c.methods.borrow_mut() = object_methods.clone();
            }
        }
        if let Some(meta) = core_class.as_class().and_then(|c| c.metaclass.clone()) {
            if let Some(m) = meta.as_class() {
                *m.methods.borrow_mut() = object_methods.clone();
            }
        }
    }

    // Class objects answer for their name through their metaclass.
    for core_class in [
        &object, &class, &nil, &boolean, &num, &string, &function, &list, &map, &range, &fiber,
    ] {
        let meta = metaclass_of(core_class);
        bind_prim(vm, &meta, "name", class_name);
    }

    // ===== Nil / Bool =====
    bind_prim(vm, &nil, "toString", nil_to_string);
    bind_prim(vm, &nil, "!", nil_not);
    bind_prim(vm, &boolean, "toString", bool_to_string);
    bind_prim(vm, &boolean, "!", bool_not);

    // ===== Num =====
    bind_prim(vm, &num, "+ ", num_plus);
    bind_prim(vm, &num, "- ", num_minus);
    bind_prim(vm, &num, "* ", num_multiply);
    bind_prim(vm, &num, "/ ", num_divide);
    bind_prim(vm, &num, "% ", num_modulo);
    bind_prim(vm, &num, "-", num_negate);
    bind_prim(vm, &num, "< ", num_lt);
    bind_prim(vm, &num, "> ", num_gt);
    bind_prim(vm, &num, "<= ", num_le);
    bind_prim(vm, &num, ">= ", num_ge);
    bind_prim(vm, &num, "== ", num_eqeq);
    bind_prim(vm, &num, "!= ", num_bangeq);
    bind_prim(vm, &num, "& ", num_bitand);
    bind_prim(vm, &num, "| ", num_bitor);
    bind_prim(vm, &num, "abs", num_abs);
    bind_prim(vm, &num, "ceil", num_ceil);
    bind_prim(vm, &num, "floor", num_floor);
    bind_prim(vm, &num, "sqrt", num_sqrt);
    bind_prim(vm, &num, "toString", num_to_string);
    bind_prim(vm, &num, ".. ", num_range_inclusive);
    bind_prim(vm, &num, "... ", num_range_exclusive);

    // ===== String =====
    bind_prim(vm, &string, "+ ", string_plus);
    bind_prim(vm, &string, "== ", string_eqeq);
    bind_prim(vm, &string, "!= ", string_bangeq);
    bind_prim(vm, &string, "count", string_count);
    bind_prim(vm, &string, "contains ", string_contains);
    bind_prim(vm, &string, "toString", string_to_string);
    bind_prim(vm, &string, "[ ", string_subscript);

    // ===== Fn =====
    for arg_count in 0..=crate::vm::opcode::MAX_CALL_ARGS {
        let signature = format!("call{}", " ".repeat(arg_count));
        bind_prim(vm, &function, &signature, fn_call);
    }

    // ===== List =====
    let list_meta = metaclass_of(&list);
    bind_prim(vm, &list_meta, "new", list_new);
    bind_prim(vm, &list, "add ", list_add);
    bind_prim(vm, &list, "count", list_count);
    bind_prim(vm, &list, "clear", list_clear);
    bind_prim(vm, &list, "[ ", list_subscript);
    bind_prim(vm, &list, "[=  ", list_subscript_setter);

    // ===== Map =====
    let map_meta = metaclass_of(&map);
    bind_prim(vm, &map_meta, "new", map_new);
    bind_prim(vm, &map, "count", map_count);
    bind_prim(vm, &map, "containsKey ", map_contains_key);
    bind_prim(vm, &map, "remove ", map_remove);
    bind_prim(vm, &map, "clear", map_clear);
    bind_prim(vm, &map, "[ ", map_subscript);
    bind_prim(vm, &map, "[=  ", map_subscript_setter);

    // ===== Range =====
    bind_prim(vm, &range, "from", range_from);
    bind_prim(vm, &range, "to", range_to);
    bind_prim(vm, &range, "isInclusive", range_is_inclusive);

    // ===== Fiber =====
    let fiber_meta = metaclass_of(&fiber);
    bind_prim(vm, &fiber_meta, "new ", fiber_new);
    bind_prim(vm, &fiber_meta, "current", fiber_current);
    bind_fiber_prim(vm, &fiber_meta, "yield", fiber_yield);
    bind_fiber_prim(vm, &fiber_meta, "yield ", fiber_yield1);
    bind_fiber_prim(vm, &fiber, "call", fiber_call);
    bind_fiber_prim(vm, &fiber, "call ", fiber_call1);
    bind_fiber_prim(vm, &fiber, "run", fiber_run);
    bind_fiber_prim(vm, &fiber, "run ", fiber_run1);
    bind_fiber_prim(vm, &fiber, "try", fiber_try);
    bind_prim(vm, &fiber, "isDone", fiber_is_done);
    bind_prim(vm, &fiber, "error", fiber_error);
}

/// Only value-like keys are hashable; mutable containers and fibers key by
/// nothing.
pub(crate) fn is_hashable(value: &Value) -> bool {
    match value {
        Value::Nil | Value::Bool(_) | Value::Num(_) => true,
        Value::Obj(obj) => matches!(
            obj.kind,
            ObjKind::Str(_) | ObjKind::Range(_) | ObjKind::Class(_)
        ),
    }
}

// ========== Object ==========

fn obj_eqeq(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::Bool(args[0].same(&args[1])))
}

fn obj_bangeq(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::Bool(!args[0].same(&args[1])))
}

fn obj_not(_vm: &mut Vm, _args: &mut [Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::Bool(false))
}

fn obj_to_string(vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    let rendered = args[0].to_string();
    PrimitiveResult::Value(vm.new_string(rendered))
}

fn obj_type(vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::Obj(vm.class_of(&args[0])))
}

fn class_name(vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match args[0].as_obj().and_then(|obj| obj.as_class()) {
        Some(class) => PrimitiveResult::Value(vm.new_string(class.name.clone())),
        None => PrimitiveResult::Error("Receiver must be a class".to_string()),
    }
}

// ========== Nil / Bool ==========

fn nil_to_string(vm: &mut Vm, _args: &mut [Value]) -> PrimitiveResult {
    PrimitiveResult::Value(vm.new_string("nil"))
}

fn nil_not(_vm: &mut Vm, _args: &mut [Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::Bool(true))
}

fn bool_to_string(vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    let rendered = match args[0] {
        Value::Bool(true) => "true",
        _ => "false",
    };
    PrimitiveResult::Value(vm.new_string(rendered))
}

fn bool_not(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::Bool(args[0].is_falsey()))
}

// ========== Num ==========

fn receiver_num(args: &[Value]) -> Result<f64, String> {
    args[0]
        .as_num()
        .ok_or_else(|| "Receiver must be a number".to_string())
}

fn operand_num(args: &[Value]) -> Result<f64, String> {
    args[1]
        .as_num()
        .ok_or_else(|| "Right operand must be a number".to_string())
}

macro_rules! num_binary_op {
    ($name:ident, $op:tt) => {
        fn $name(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
            match (receiver_num(args), operand_num(args)) {
                (Ok(a), Ok(b)) => PrimitiveResult::Value(Value::Num(a $op b)),
                (Err(message), _) | (_, Err(message)) => PrimitiveResult::Error(message),
            }
        }
    };
}

macro_rules! num_compare_op {
    ($name:ident, $op:tt) => {
        fn $name(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
            match (receiver_num(args), operand_num(args)) {
                (Ok(a), Ok(b)) => PrimitiveResult::Value(Value::Bool(a $op b)),
                (Err(message), _) | (_, Err(message)) => PrimitiveResult::Error(message),
            }
        }
    };
}

num_binary_op!(num_plus, +);
num_binary_op!(num_minus, -);
num_binary_op!(num_multiply, *);
num_binary_op!(num_divide, /);
num_binary_op!(num_modulo, %);
num_compare_op!(num_lt, <);
num_compare_op!(num_gt, >);
num_compare_op!(num_le, <=);
num_compare_op!(num_ge, >=);

fn num_negate(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match receiver_num(args) {
        Ok(a) => PrimitiveResult::Value(Value::Num(-a)),
        Err(message) => PrimitiveResult::Error(message),
    }
}

fn num_eqeq(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    let result = match (args[0].as_num(), args[1].as_num()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    PrimitiveResult::Value(Value::Bool(result))
}

fn num_bangeq(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    let result = match (args[0].as_num(), args[1].as_num()) {
        (Some(a), Some(b)) => a != b,
        _ => true,
    };
    PrimitiveResult::Value(Value::Bool(result))
}

fn num_bitand(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match (receiver_num(args), operand_num(args)) {
        (Ok(a), Ok(b)) => PrimitiveResult::Value(Value::Num(((a as u32) & (b as u32)) as f64)),
        (Err(message), _) | (_, Err(message)) => PrimitiveResult::Error(message),
    }
}

fn num_bitor(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match (receiver_num(args), operand_num(args)) {
        (Ok(a), Ok(b)) => PrimitiveResult::Value(Value::Num(((a as u32) | (b as u32)) as f64)),
        (Err(message), _) | (_, Err(message)) => PrimitiveResult::Error(message),
    }
}

fn num_abs(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match receiver_num(args) {
        Ok(a) => PrimitiveResult::Value(Value::Num(a.abs())),
        Err(message) => PrimitiveResult::Error(message),
    }
}

fn num_ceil(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match receiver_num(args) {
        Ok(a) => PrimitiveResult::Value(Value::Num(a.ceil())),
        Err(message) => PrimitiveResult::Error(message),
    }
}

fn num_floor(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match receiver_num(args) {
        Ok(a) => PrimitiveResult::Value(Value::Num(a.floor())),
        Err(message) => PrimitiveResult::Error(message),
    }
}

fn num_sqrt(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match receiver_num(args) {
        Ok(a) => PrimitiveResult::Value(Value::Num(a.sqrt())),
        Err(message) => PrimitiveResult::Error(message),
    }
}

fn num_to_string(vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match receiver_num(args) {
        Ok(a) => PrimitiveResult::Value(vm.new_string(crate::vm::value::format_num(a))),
        Err(message) => PrimitiveResult::Error(message),
    }
}

fn num_range_inclusive(vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match (receiver_num(args), operand_num(args)) {
        (Ok(a), Ok(b)) => PrimitiveResult::Value(vm.new_range(a, b, true)),
        (Err(message), _) | (_, Err(message)) => PrimitiveResult::Error(message),
    }
}

fn num_range_exclusive(vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match (receiver_num(args), operand_num(args)) {
        (Ok(a), Ok(b)) => PrimitiveResult::Value(vm.new_range(a, b, false)),
        (Err(message), _) | (_, Err(message)) => PrimitiveResult::Error(message),
    }
}

// ========== String ==========

fn receiver_str(args: &[Value]) -> Result<String, String> {
    args[0]
        .as_obj()
        .and_then(|obj| obj.as_str())
        .map(|s| s.value.clone())
        .ok_or_else(|| "Receiver must be a string".to_string())
}

fn string_plus(vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    let a = match receiver_str(args) {
        Ok(a) => a,
        Err(message) => return PrimitiveResult::Error(message),
    };
    match args[1].as_obj().and_then(|obj| obj.as_str()) {
        Some(b) => {
            let joined = format!("{}{}", a, b.value);
            PrimitiveResult::Value(vm.new_string(joined))
        }
        None => PrimitiveResult::Error("Right operand must be a string".to_string()),
    }
}

fn string_eqeq(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::Bool(args[0].content_eq(&args[1])))
}

fn string_bangeq(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::Bool(!args[0].content_eq(&args[1])))
}

fn string_count(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match receiver_str(args) {
        Ok(s) => PrimitiveResult::Value(Value::Num(s.len() as f64)),
        Err(message) => PrimitiveResult::Error(message),
    }
}

fn string_contains(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    let haystack = match receiver_str(args) {
        Ok(s) => s,
        Err(message) => return PrimitiveResult::Error(message),
    };
    match args[1].as_obj().and_then(|obj| obj.as_str()) {
        Some(needle) => {
            PrimitiveResult::Value(Value::Bool(haystack.contains(needle.value.as_str())))
        }
        None => PrimitiveResult::Error("Argument must be a string".to_string()),
    }
}

fn string_to_string(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    PrimitiveResult::Value(args[0].clone())
}

fn string_subscript(vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    let s = match receiver_str(args) {
        Ok(s) => s,
        Err(message) => return PrimitiveResult::Error(message),
    };
    let chars: Vec<char> = s.chars().collect();
    match element_index(chars.len(), &args[1]) {
        Ok(index) => PrimitiveResult::Value(vm.new_string(chars[index].to_string())),
        Err(message) => PrimitiveResult::Error(message),
    }
}

// ========== Fn ==========

fn fn_call(vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    let closure = match args[0].as_obj().filter(|obj| obj.as_closure().is_some()) {
        Some(obj) => obj.clone(),
        None => return PrimitiveResult::Error("Receiver must be a function".to_string()),
    };
    let arity = closure
        .as_closure()
        .and_then(|c| c.function.as_fn())
        .map(|f| f.arity as usize)
        .unwrap_or(0);
    if args.len() - 1 < arity {
        return PrimitiveResult::Error("Function expects more arguments".to_string());
    }

    let base = {
        let fiber_ref = vm.current_fiber();
        let mut fiber = fiber_mut(&fiber_ref);
        let base = fiber.stack.len() - args.len();
        // Extra arguments are ignored; drop them so the callee's local
        // slots line up with its frame.
        fiber.stack.truncate(base + 1 + arity);
        base
    };
    match vm.push_frame(closure, base) {
        Ok(()) => PrimitiveResult::Call,
        Err(message) => PrimitiveResult::Error(message),
    }
}

// ========== List ==========

/// Resolve a subscript into an element index, counting negative indices
/// back from the end.
fn element_index(len: usize, subscript: &Value) -> Result<usize, String> {
    let n = subscript
        .as_num()
        .ok_or_else(|| "Subscript must be a number".to_string())?;
    if n.fract() != 0.0 {
        return Err("Subscript must be an integer".to_string());
    }
    let mut index = n as isize;
    if index < 0 {
        index += len as isize;
    }
    if index < 0 || index >= len as isize {
        return Err("Subscript out of bounds".to_string());
    }
    Ok(index as usize)
}

fn list_new(vm: &mut Vm, _args: &mut [Value]) -> PrimitiveResult {
    PrimitiveResult::Value(vm.new_list(Vec::new()))
}

fn list_add(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match args[0].as_obj().and_then(|obj| obj.as_list()) {
        Some(list) => {
            list.borrow_mut().push(args[1].clone());
            PrimitiveResult::Value(args[1].clone())
        }
        None => PrimitiveResult::Error("Receiver must be a list".to_string()),
    }
}

fn list_count(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match args[0].as_obj().and_then(|obj| obj.as_list()) {
        Some(list) => PrimitiveResult::Value(Value::Num(list.borrow().len() as f64)),
        None => PrimitiveResult::Error("Receiver must be a list".to_string()),
    }
}

fn list_clear(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match args[0].as_obj().and_then(|obj| obj.as_list()) {
        Some(list) => {
            list.borrow_mut().clear();
            PrimitiveResult::Value(Value::Nil)
        }
        None => PrimitiveResult::Error("Receiver must be a list".to_string()),
    }
}

fn list_subscript(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match args[0].as_obj().and_then(|obj| obj.as_list()) {
        Some(list) => {
            let list = list.borrow();
            match element_index(list.len(), &args[1]) {
                Ok(index) => PrimitiveResult::Value(list[index].clone()),
                Err(message) => PrimitiveResult::Error(message),
            }
        }
        None => PrimitiveResult::Error("Receiver must be a list".to_string()),
    }
}

fn list_subscript_setter(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match args[0].as_obj().and_then(|obj| obj.as_list()) {
        Some(list) => {
            let mut list = list.borrow_mut();
            let len = list.len();
            match element_index(len, &args[1]) {
                Ok(index) => {
                    list[index] = args[2].clone();
                    PrimitiveResult::Value(args[2].clone())
                }
                Err(message) => PrimitiveResult::Error(message),
            }
        }
        None => PrimitiveResult::Error("Receiver must be a list".to_string()),
    }
}

// ========== Map ==========

fn map_new(vm: &mut Vm, _args: &mut [Value]) -> PrimitiveResult {
    PrimitiveResult::Value(vm.new_map(Default::default()))
}

fn map_key(value: &Value) -> Result<crate::vm::value::MapKey, String> {
    if is_hashable(value) {
        Ok(crate::vm::value::MapKey(value.clone()))
    } else {
        Err("Key must be hashable".to_string())
    }
}

fn map_count(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match args[0].as_obj().and_then(|obj| obj.as_map()) {
        Some(map) => PrimitiveResult::Value(Value::Num(map.borrow().len() as f64)),
        None => PrimitiveResult::Error("Receiver must be a map".to_string()),
    }
}

fn map_contains_key(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    let map = match args[0].as_obj().and_then(|obj| obj.as_map()) {
        Some(map) => map,
        None => return PrimitiveResult::Error("Receiver must be a map".to_string()),
    };
    match map_key(&args[1]) {
        Ok(key) => PrimitiveResult::Value(Value::Bool(map.borrow().contains_key(&key))),
        Err(message) => PrimitiveResult::Error(message),
    }
}

fn map_remove(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    let map = match args[0].as_obj().and_then(|obj| obj.as_map()) {
        Some(map) => map,
        None => return PrimitiveResult::Error("Receiver must be a map".to_string()),
    };
    match map_key(&args[1]) {
        Ok(key) => {
            let removed = map.borrow_mut().shift_remove(&key);
            PrimitiveResult::Value(removed.unwrap_or(Value::Nil))
        }
        Err(message) => PrimitiveResult::Error(message),
    }
}

fn map_clear(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match args[0].as_obj().and_then(|obj| obj.as_map()) {
        Some(map) => {
            map.borrow_mut().clear();
            PrimitiveResult::Value(Value::Nil)
        }
        None => PrimitiveResult::Error("Receiver must be a map".to_string()),
    }
}

fn map_subscript(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    let map = match args[0].as_obj().and_then(|obj| obj.as_map()) {
        Some(map) => map,
        None => return PrimitiveResult::Error("Receiver must be a map".to_string()),
    };
    match map_key(&args[1]) {
        Ok(key) => {
            let value = map.borrow().get(&key).cloned().unwrap_or(Value::Nil);
            PrimitiveResult::Value(value)
        }
        Err(message) => PrimitiveResult::Error(message),
    }
}

fn map_subscript_setter(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    let map = match args[0].as_obj().and_then(|obj| obj.as_map()) {
        Some(map) => map,
        None => return PrimitiveResult::Error("Receiver must be a map".to_string()),
    };
    match map_key(&args[1]) {
        Ok(key) => {
            map.borrow_mut().insert(key, args[2].clone());
            PrimitiveResult::Value(args[2].clone())
        }
        Err(message) => PrimitiveResult::Error(message),
    }
}

// ========== Range ==========

fn receiver_range(args: &[Value]) -> Result<(f64, f64, bool), String> {
    args[0]
        .as_obj()
        .and_then(|obj| obj.as_range())
        .map(|r| (r.from, r.to, r.inclusive))
        .ok_or_else(|| "Receiver must be a range".to_string())
}

fn range_from(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match receiver_range(args) {
        Ok((from, _, _)) => PrimitiveResult::Value(Value::Num(from)),
        Err(message) => PrimitiveResult::Error(message),
    }
}

fn range_to(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match receiver_range(args) {
        Ok((_, to, _)) => PrimitiveResult::Value(Value::Num(to)),
        Err(message) => PrimitiveResult::Error(message),
    }
}

fn range_is_inclusive(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match receiver_range(args) {
        Ok((_, _, inclusive)) => PrimitiveResult::Value(Value::Bool(inclusive)),
        Err(message) => PrimitiveResult::Error(message),
    }
}

// ========== Fiber ==========

fn receiver_fiber(args: &[Value]) -> Result<ObjRef, String> {
    args[0]
        .as_obj()
        .filter(|obj| obj.as_fiber().is_some())
        .cloned()
        .ok_or_else(|| "Receiver must be a fiber".to_string())
}

fn fiber_new(vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    let closure = match args[1].as_obj().filter(|obj| obj.as_closure().is_some()) {
        Some(obj) => obj.clone(),
        None => return PrimitiveResult::Error("Argument must be a function".to_string()),
    };
    let arity = closure
        .as_closure()
        .and_then(|c| c.function.as_fn())
        .map(|f| f.arity)
        .unwrap_or(0);
    if arity > 1 {
        return PrimitiveResult::Error(
            "Fiber function cannot take more than one parameter".to_string(),
        );
    }
    let fiber = vm.allocate(ObjKind::Fiber(RefCell::new(Fiber::new(closure))));
    PrimitiveResult::Value(Value::Obj(fiber))
}

fn fiber_current(vm: &mut Vm, _args: &mut [Value]) -> PrimitiveResult {
    PrimitiveResult::Value(Value::Obj(vm.current_fiber()))
}

fn fiber_is_done(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match receiver_fiber(args) {
        Ok(fiber) => {
            let done = fiber_mut(&fiber).is_done();
            PrimitiveResult::Value(Value::Bool(done))
        }
        Err(message) => PrimitiveResult::Error(message),
    }
}

fn fiber_error(_vm: &mut Vm, args: &mut [Value]) -> PrimitiveResult {
    match receiver_fiber(args) {
        Ok(fiber) => {
            let error = fiber_mut(&fiber).error.clone();
            PrimitiveResult::Value(error.unwrap_or(Value::Nil))
        }
        Err(message) => PrimitiveResult::Error(message),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FiberMode {
    Call,
    Try,
    Run,
}

fn fiber_call(vm: &mut Vm, args: &[Value]) -> FiberAction {
    run_fiber(vm, args, FiberMode::Call, false, "call")
}

fn fiber_call1(vm: &mut Vm, args: &[Value]) -> FiberAction {
    run_fiber(vm, args, FiberMode::Call, true, "call")
}

fn fiber_run(vm: &mut Vm, args: &[Value]) -> FiberAction {
    run_fiber(vm, args, FiberMode::Run, false, "run")
}

fn fiber_run1(vm: &mut Vm, args: &[Value]) -> FiberAction {
    run_fiber(vm, args, FiberMode::Run, true, "run")
}

fn fiber_try(vm: &mut Vm, args: &[Value]) -> FiberAction {
    run_fiber(vm, args, FiberMode::Try, false, "try")
}

/// Shared resume logic for `call`, `try`, and `run`.
///
/// `call`/`try` record the current fiber as the target's caller; `run`
/// hands the target the current fiber's own caller instead, so completion
/// and yields resume the original caller — fiber tail calls. A fresh
/// target receives the seed value as its function argument; a suspended
/// one receives it in its resume slot.
fn run_fiber(
    vm: &mut Vm,
    args: &[Value],
    mode: FiberMode,
    has_value: bool,
    verb: &str,
) -> FiberAction {
    let target = match receiver_fiber(args) {
        Ok(target) => target,
        Err(message) => return FiberAction::Error(message),
    };

    {
        let fiber = fiber_mut(&target);
        if fiber.error.is_some() {
            return FiberAction::Error(format!("Cannot {} an aborted fiber", verb));
        }
        if fiber.frames.is_empty() {
            return FiberAction::Error(format!("Cannot {} a finished fiber", verb));
        }
        // The caller graph must stay a tree: a fiber that already has a
        // caller, or is on the running chain, cannot be called again.
        if fiber.caller.is_some() {
            return FiberAction::Error("Fiber has already been called".to_string());
        }
    }
    if vm.is_current_fiber(&target) {
        return FiberAction::Error("Fiber has already been called".to_string());
    }
    if vm.is_root_fiber(&target) {
        return FiberAction::Error(format!("Cannot {} the root fiber", verb));
    }

    let current = vm.current_fiber();
    {
        let caller = match mode {
            FiberMode::Call | FiberMode::Try => Some(current.clone()),
            FiberMode::Run => fiber_mut(&current).caller.take(),
        };
        let mut fiber = fiber_mut(&target);
        fiber.caller = caller;
        fiber.caller_is_trying = mode == FiberMode::Try;
    }

    let value = if has_value {
        // Pop the seed argument so the receiver slot becomes the resume
        // slot for when the current fiber is resumed.
        let mut fiber = fiber_mut(&current);
        Some(fiber.pop())
    } else {
        None
    };

    {
        let mut fiber = fiber_mut(&target);
        if fiber.is_fresh() {
            let arity = fiber.frames[0]
                .closure
                .as_closure()
                .and_then(|c| c.function.as_fn())
                .map(|f| f.arity)
                .unwrap_or(0);
            if arity == 1 {
                fiber.push(value.unwrap_or(Value::Nil));
            }
        } else {
            fiber.set_resume_value(value.unwrap_or(Value::Nil));
        }
    }

    FiberAction::Switch(target)
}

fn fiber_yield(vm: &mut Vm, args: &[Value]) -> FiberAction {
    yield_impl(vm, args, false)
}

fn fiber_yield1(vm: &mut Vm, args: &[Value]) -> FiberAction {
    yield_impl(vm, args, true)
}

/// Hand a value back to the caller and suspend. Clears the caller link, so
/// the yielding fiber becomes callable again.
fn yield_impl(vm: &mut Vm, _args: &[Value], has_value: bool) -> FiberAction {
    let current = vm.current_fiber();
    let caller = fiber_mut(&current).caller.take();
    let Some(caller) = caller else {
        return FiberAction::Error("No fiber to yield to".to_string());
    };

    let value = if has_value {
        // Pop the yielded value; the receiver slot underneath becomes this
        // fiber's resume slot.
        fiber_mut(&current).pop()
    } else {
        Value::Nil
    };
    fiber_mut(&caller).set_resume_value(value);
    FiberAction::Switch(caller)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashable_kinds() {
        let mut vm = Vm::new();
        assert!(is_hashable(&Value::Nil));
        assert!(is_hashable(&Value::Bool(true)));
        assert!(is_hashable(&Value::Num(1.5)));
        assert!(is_hashable(&vm.new_string("k")));
        assert!(is_hashable(&vm.new_range(0.0, 1.0, true)));
        assert!(!is_hashable(&vm.new_list(vec![])));
    }

    #[test]
    fn test_element_index_semantics() {
        assert_eq!(element_index(3, &Value::Num(0.0)), Ok(0));
        assert_eq!(element_index(3, &Value::Num(-1.0)), Ok(2));
        assert!(element_index(3, &Value::Num(3.0)).is_err());
        assert!(element_index(3, &Value::Num(1.5)).is_err());
        assert!(element_index(3, &Value::Bool(true)).is_err());
    }

    #[test]
    fn test_core_classes_share_object_methods() {
        let mut vm = Vm::new();
        // toString is bound on Object and copied everywhere, so every kind
        // of value responds to it.
        for source in ["1.toString", "true.toString", "nil.toString", "[].toString"] {
            assert!(vm.interpret("core", source).is_ok(), "{} failed", source);
        }
    }

    #[test]
    fn test_class_values_answer_name() {
        let mut vm = Vm::new();
        let result = vm.interpret("core", "Num.name").unwrap();
        assert_eq!(result.to_string(), "Num");
    }
}
