//! The VM: owns the heap, the symbol tables, the core classes, and the
//! bytecode dispatch loop.
//!
//! The interpreter always executes the current fiber's top call frame.
//! Method dispatch indexes the receiver class's flat method table; fiber
//! primitives switch which fiber is current instead of recursing into the
//! interpreter. Runtime errors land in the failing fiber's error slot and
//! travel up the caller chain; only a chain with no `try` caller turns into
//! a fatal `RuntimeError`.

use std::cell::{RefCell, RefMut};
use std::rc::Rc;

use crate::error::{RuntimeError, TernError, TraceFrame};
use crate::vm::chunk::Chunk;
use crate::vm::core::{self, CoreClasses};
use crate::vm::fiber::{CallFrame, Fiber};
use crate::vm::heap::{self, Heap};
use crate::vm::opcode::OpCode;
use crate::vm::symbol::SymbolTable;
use crate::vm::value::{
    ClassObj, ClosureObj, FiberAction, FiberPrimitiveFn, FnObj, InstanceObj, MapKey, Method,
    ObjKind, ObjRef, PrimitiveFn, PrimitiveResult, StrObj, TernMap, UpvalueState, Value,
};

/// Maximum call frames per fiber.
const FRAMES_MAX: usize = 256;

/// One virtual machine instance. All shared state — the heap, the method
/// and global symbol tables, the core classes — is owned here, never
/// process-wide, so multiple VMs coexist without aliasing.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) globals: Vec<Value>,
    pub(crate) global_names: SymbolTable,
    pub(crate) method_names: SymbolTable,
    pub(crate) core: CoreClasses,
    /// The fiber currently executing, while a run is in progress.
    pub(crate) fiber: Option<ObjRef>,
    /// The fiber `interpret` started; it can never be re-called.
    pub(crate) root_fiber: Option<ObjRef>,
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let core = CoreClasses::bootstrap(&mut heap);
        let mut vm = Self {
            heap,
            globals: Vec::new(),
            global_names: SymbolTable::new(),
            method_names: SymbolTable::new(),
            core,
            fiber: None,
            root_fiber: None,
        };
        core::install(&mut vm);
        vm
    }

    /// Compile and run a module. Returns the value of the module's last
    /// expression. Globals persist across calls on the same VM.
    pub fn interpret(&mut self, module: &str, source: &str) -> Result<Value, TernError> {
        let function = crate::compiler::compile(self, module, source)?;
        self.globals.resize(self.global_names.len(), Value::Nil);

        let closure = self.heap.allocate(ObjKind::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));
        let fiber = self
            .heap
            .allocate(ObjKind::Fiber(RefCell::new(Fiber::new(closure))));

        self.root_fiber = Some(fiber.clone());
        self.fiber = Some(fiber);
        let result = self.run();
        self.fiber = None;
        self.root_fiber = None;

        Ok(result?)
    }

    // ========== External interface ==========

    /// Seed or overwrite a top-level variable by name.
    pub fn define_global(&mut self, name: &str, value: Value) {
        let slot = self.global_names.ensure(name) as usize;
        if self.globals.len() <= slot {
            self.globals.resize(slot + 1, Value::Nil);
        }
        self.globals[slot] = value;
    }

    /// Read a top-level variable by name.
    pub fn global(&self, name: &str) -> Option<Value> {
        let slot = self.global_names.lookup(name)? as usize;
        self.globals.get(slot).cloned()
    }

    /// Bind a native method on a class, by class name and mangled signature.
    pub fn bind_primitive(
        &mut self,
        class: &str,
        signature: &str,
        function: PrimitiveFn,
    ) -> Result<(), TernError> {
        let class = self.lookup_class(class)?;
        let symbol = self.method_names.ensure(signature);
        core::bind(&class, symbol, Method::Primitive(function));
        Ok(())
    }

    /// Bind a native method on a class's metaclass (a static method).
    pub fn bind_static_primitive(
        &mut self,
        class: &str,
        signature: &str,
        function: PrimitiveFn,
    ) -> Result<(), TernError> {
        let class = self.lookup_class(class)?;
        let metaclass = class
            .as_class()
            .and_then(|c| c.metaclass.clone())
            .ok_or_else(|| runtime_error(format!("Class '{}' has no metaclass", class)))?;
        let symbol = self.method_names.ensure(signature);
        core::bind(&metaclass, symbol, Method::Primitive(function));
        Ok(())
    }

    /// Bind a fiber-switching native method on a class.
    pub fn bind_fiber_primitive(
        &mut self,
        class: &str,
        signature: &str,
        function: FiberPrimitiveFn,
    ) -> Result<(), TernError> {
        let class = self.lookup_class(class)?;
        let symbol = self.method_names.ensure(signature);
        core::bind(&class, symbol, Method::FiberPrimitive(function));
        Ok(())
    }

    fn lookup_class(&self, name: &str) -> Result<ObjRef, TernError> {
        let value = self
            .global(name)
            .ok_or_else(|| runtime_error(format!("Unknown class '{}'", name)))?;
        match value.as_obj() {
            Some(obj) if obj.as_class().is_some() => Ok(obj.clone()),
            _ => Err(runtime_error(format!("'{}' is not a class", name))),
        }
    }

    // ========== Allocation ==========

    /// Runtime allocation: collects first when the heap has crossed its
    /// threshold, so every allocation site is a potential collection point.
    /// Callers must hold no fiber borrows and must keep in-flight objects
    /// reachable or pinned.
    pub(crate) fn allocate(&mut self, kind: ObjKind) -> ObjRef {
        if self.heap.should_collect() {
            self.collect();
        }
        self.heap.allocate(kind)
    }

    /// Compile-time allocation: never collects. Objects created here become
    /// reachable through function constant pools.
    pub(crate) fn make_string(&mut self, text: impl Into<String>) -> Value {
        Value::Obj(self.heap.allocate(ObjKind::Str(StrObj::new(text))))
    }

    pub fn new_string(&mut self, text: impl Into<String>) -> Value {
        let obj = self.allocate(ObjKind::Str(StrObj::new(text)));
        Value::Obj(obj)
    }

    pub fn new_range(&mut self, from: f64, to: f64, inclusive: bool) -> Value {
        let obj = self.allocate(ObjKind::Range(crate::vm::value::RangeObj {
            from,
            to,
            inclusive,
        }));
        Value::Obj(obj)
    }

    pub fn new_list(&mut self, elements: Vec<Value>) -> Value {
        let obj = self.allocate(ObjKind::List(RefCell::new(elements)));
        Value::Obj(obj)
    }

    pub fn new_map(&mut self, map: TernMap) -> Value {
        let obj = self.allocate(ObjKind::Map(RefCell::new(map)));
        Value::Obj(obj)
    }

    /// Mark from all roots, then sweep. Roots: globals, core classes, the
    /// current and root fibers (caller chains follow from fiber marking),
    /// and the pin stack.
    pub(crate) fn collect(&mut self) {
        for value in &self.globals {
            heap::mark_value(value);
        }
        self.core.mark();
        if let Some(fiber) = &self.fiber {
            heap::mark_object(fiber);
        }
        if let Some(fiber) = &self.root_fiber {
            heap::mark_object(fiber);
        }
        self.heap.mark_pinned();
        self.heap.sweep();
    }

    // ========== Object model ==========

    /// Map a value to its class in O(1).
    pub(crate) fn class_of(&self, value: &Value) -> ObjRef {
        match value {
            Value::Nil => self.core.nil.clone(),
            Value::Bool(_) => self.core.boolean.clone(),
            Value::Num(_) => self.core.num.clone(),
            Value::Obj(obj) => match &obj.kind {
                ObjKind::Str(_) => self.core.string.clone(),
                ObjKind::Fn(_) | ObjKind::Closure(_) => self.core.function.clone(),
                ObjKind::Upvalue(_) => self.core.object.clone(),
                ObjKind::Class(class) => class
                    .metaclass
                    .clone()
                    .unwrap_or_else(|| self.core.class.clone()),
                ObjKind::Instance(instance) => instance.class.clone(),
                ObjKind::List(_) => self.core.list.clone(),
                ObjKind::Map(_) => self.core.map.clone(),
                ObjKind::Range(_) => self.core.range.clone(),
                ObjKind::Fiber(_) => self.core.fiber.clone(),
            },
        }
    }

    /// Create a class and its metaclass. Method tables are copied from the
    /// superclass (and its metaclass) here, once, so later dispatch is a
    /// flat index.
    pub(crate) fn create_class(
        &mut self,
        name: String,
        superclass: ObjRef,
        declared_fields: usize,
    ) -> Result<ObjRef, String> {
        let (super_fields, super_methods, super_meta_methods) = {
            let sup = superclass
                .as_class()
                .ok_or_else(|| "Must inherit from a class".to_string())?;
            let meta_methods = sup
                .metaclass
                .as_ref()
                .and_then(|m| m.as_class())
                .map(|m| m.methods.borrow().clone())
                .unwrap_or_default();
            (sup.num_fields, sup.methods.borrow().clone(), meta_methods)
        };

        // The superclass may live only in locals here; keep it safe across
        // the allocations below.
        self.heap.pin(superclass.clone());
        let metaclass = self.allocate(ObjKind::Class(ClassObj {
            name: format!("{} metaclass", name),
            superclass: Some(self.core.class.clone()),
            metaclass: None,
            num_fields: 0,
            methods: RefCell::new(super_meta_methods),
        }));
        self.heap.pin(metaclass.clone());

        let class = self.allocate(ObjKind::Class(ClassObj {
            name,
            superclass: Some(superclass),
            metaclass: Some(metaclass),
            num_fields: super_fields + declared_fields,
            methods: RefCell::new(super_methods),
        }));
        self.heap.unpin();
        self.heap.unpin();
        Ok(class)
    }

    /// Bind a compiled method to a class. Instance methods get their field
    /// access offsets shifted past the inherited fields; since functions
    /// are immutable, an adjusted copy is bound instead of the original.
    fn bind_block_method(
        &mut self,
        class_ref: &ObjRef,
        symbol: u16,
        closure: ObjRef,
        is_static: bool,
    ) -> Result<(), String> {
        let class = class_ref
            .as_class()
            .ok_or_else(|| "Methods can only be bound to a class".to_string())?;

        if is_static {
            let metaclass = class
                .metaclass
                .clone()
                .ok_or_else(|| "Class has no metaclass".to_string())?;
            let metaclass = metaclass
                .as_class()
                .ok_or_else(|| "Corrupt metaclass".to_string())?;
            metaclass.set_method(symbol, Method::Block(closure));
            return Ok(());
        }

        let field_offset = class
            .superclass
            .as_ref()
            .and_then(|s| s.as_class())
            .map(|s| s.num_fields)
            .unwrap_or(0);

        let bound = if field_offset > 0 {
            self.offset_field_access(&closure, field_offset)?
        } else {
            closure
        };
        class.set_method(symbol, Method::Block(bound));
        Ok(())
    }

    /// Copy a method closure with every field-access operand shifted by the
    /// inherited field count.
    fn offset_field_access(&mut self, closure: &ObjRef, offset: usize) -> Result<ObjRef, String> {
        let (mut chunk, name, arity, upvalue_count, upvalues) = {
            let closure_obj = closure
                .as_closure()
                .ok_or_else(|| "Method is not a closure".to_string())?;
            let function = closure_obj
                .function
                .as_fn()
                .ok_or_else(|| "Closure has no function".to_string())?;
            (
                function.chunk.clone(),
                function.name.clone(),
                function.arity,
                function.upvalue_count,
                closure_obj.upvalues.clone(),
            )
        };

        let mut ip = 0;
        while ip < chunk.code.len() {
            let op = OpCode::from_u8(chunk.code[ip]).ok_or_else(|| "Corrupt bytecode".to_string())?;
            match op {
                OpCode::LoadField | OpCode::StoreField => {
                    let shifted = chunk.code[ip + 1] as usize + offset;
                    if shifted > u8::MAX as usize {
                        return Err("Too many fields in class".to_string());
                    }
                    chunk.code[ip + 1] = shifted as u8;
                    ip += 2;
                }
                OpCode::Closure => {
                    // Skip the capture byte pairs of nested functions; their
                    // bodies cannot touch fields directly.
                    let constant = chunk.read_u16(ip + 1) as usize;
                    let captures = chunk.constants[constant]
                        .as_obj()
                        .and_then(|o| o.as_fn())
                        .map(|f| f.upvalue_count)
                        .unwrap_or(0);
                    ip += 3 + captures * 2;
                }
                _ => ip += 1 + op.operand_size(),
            }
        }

        let function = self.allocate(ObjKind::Fn(FnObj {
            name,
            arity,
            upvalue_count,
            chunk,
        }));
        self.heap.pin(function.clone());
        let bound = self.allocate(ObjKind::Closure(ClosureObj { function, upvalues }));
        self.heap.unpin();
        Ok(bound)
    }

    // ========== Interpreter loop ==========

    fn run(&mut self) -> Result<Value, RuntimeError> {
        loop {
            let op = OpCode::from_u8(self.read_byte()).expect("invalid opcode in bytecode");
            match op {
                OpCode::Constant => {
                    let index = self.read_u16();
                    let value = self.read_constant(index);
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => {
                    let value = self.peek(0);
                    self.push(value);
                }

                OpCode::LoadLocal => {
                    let slot = self.read_byte() as usize;
                    let fiber_ref = self.current_fiber();
                    let fiber = fiber_mut(&fiber_ref);
                    let base = fiber.frames.last().expect("no call frame").stack_start;
                    let value = fiber.stack[base + slot].clone();
                    drop(fiber);
                    self.push(value);
                }
                OpCode::StoreLocal => {
                    let slot = self.read_byte() as usize;
                    let fiber_ref = self.current_fiber();
                    let mut fiber = fiber_mut(&fiber_ref);
                    let base = fiber.frames.last().expect("no call frame").stack_start;
                    let value = fiber.peek(0).clone();
                    fiber.stack[base + slot] = value;
                }
                OpCode::LoadUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame_upvalue(index);
                    let value = self.read_upvalue(&upvalue);
                    self.push(value);
                }
                OpCode::StoreUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.frame_upvalue(index);
                    let value = self.peek(0);
                    self.write_upvalue(&upvalue, value);
                }
                OpCode::LoadGlobal => {
                    let slot = self.read_u16() as usize;
                    let value = self.globals[slot].clone();
                    self.push(value);
                }
                OpCode::StoreGlobal => {
                    let slot = self.read_u16() as usize;
                    let value = self.peek(0);
                    self.globals[slot] = value;
                }
                OpCode::LoadField => {
                    let index = self.read_byte() as usize;
                    let receiver = self.frame_receiver();
                    match field_of(&receiver, index) {
                        Ok(value) => self.push(value),
                        Err(message) => self.throw(message)?,
                    }
                }
                OpCode::StoreField => {
                    let index = self.read_byte() as usize;
                    let receiver = self.frame_receiver();
                    let value = self.peek(0);
                    if let Err(message) = set_field_of(&receiver, index, value) {
                        self.throw(message)?;
                    }
                }

                OpCode::BuildList => {
                    let count = self.read_byte() as usize;
                    // Elements stay on the stack, and therefore reachable,
                    // until the list object exists.
                    let elements = self.peek_window(count);
                    let list = self.new_list(elements);
                    self.truncate_top(count);
                    self.push(list);
                }
                OpCode::BuildMap => {
                    let count = self.read_byte() as usize;
                    let pairs = self.peek_window(count * 2);
                    let mut map = TernMap::default();
                    let mut bad_key = false;
                    for pair in pairs.chunks(2) {
                        if !core::is_hashable(&pair[0]) {
                            bad_key = true;
                            break;
                        }
                        map.insert(MapKey(pair[0].clone()), pair[1].clone());
                    }
                    if bad_key {
                        self.throw("Key must be hashable".to_string())?;
                    } else {
                        let map = self.new_map(map);
                        self.truncate_top(count * 2);
                        self.push(map);
                    }
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as isize;
                    self.adjust_ip(offset);
                }
                OpCode::JumpIf => {
                    let offset = self.read_u16() as isize;
                    let condition = self.pop();
                    if condition.is_falsey() {
                        self.adjust_ip(offset);
                    }
                }
                OpCode::And => {
                    let offset = self.read_u16() as isize;
                    if self.peek(0).is_falsey() {
                        self.adjust_ip(offset);
                    } else {
                        self.pop();
                    }
                }
                OpCode::Or => {
                    let offset = self.read_u16() as isize;
                    if self.peek(0).is_falsey() {
                        self.pop();
                    } else {
                        self.adjust_ip(offset);
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as isize;
                    self.adjust_ip(-offset);
                }

                OpCode::Call0
                | OpCode::Call1
                | OpCode::Call2
                | OpCode::Call3
                | OpCode::Call4
                | OpCode::Call5
                | OpCode::Call6
                | OpCode::Call7
                | OpCode::Call8 => {
                    let arg_count = op.call_args().expect("call opcode without arity");
                    let symbol = self.read_u16();
                    self.call_method(arg_count, symbol)?;
                }

                OpCode::Closure => {
                    let index = self.read_u16();
                    let function = self.read_constant(index);
                    self.make_closure(function)?;
                }
                OpCode::CloseUpvalue => {
                    let fiber_ref = self.current_fiber();
                    let top = fiber_mut(&fiber_ref).stack.len() - 1;
                    close_upvalues(&fiber_ref, top);
                    self.pop();
                }

                OpCode::Class => {
                    let declared_fields = self.read_byte() as usize;
                    let name = self.pop();
                    let superclass = self.core.object.clone();
                    self.finish_class(name, superclass, declared_fields)?;
                }
                OpCode::Subclass => {
                    let declared_fields = self.read_byte() as usize;
                    let superclass = self.pop();
                    let name = self.pop();
                    match superclass.as_obj() {
                        Some(obj) if obj.as_class().is_some() => {
                            let superclass = obj.clone();
                            self.finish_class(name, superclass, declared_fields)?;
                        }
                        _ => self.throw("Must inherit from a class".to_string())?,
                    }
                }
                OpCode::Method | OpCode::StaticMethod => {
                    let symbol = self.read_u16();
                    // Bind before popping so the closure stays rooted across
                    // any collection the binding's allocations trigger.
                    let closure = self.peek(0);
                    let class = self.peek(1);
                    let result = match (closure.as_obj(), class.as_obj()) {
                        (Some(method), Some(class_ref)) => self.bind_block_method(
                            &class_ref.clone(),
                            symbol,
                            method.clone(),
                            op == OpCode::StaticMethod,
                        ),
                        _ => Err("Invalid method definition".to_string()),
                    };
                    match result {
                        Ok(()) => {
                            self.pop();
                        }
                        Err(message) => self.throw(message)?,
                    }
                }
                OpCode::Construct => {
                    let receiver = self.frame_receiver();
                    let class_ref = receiver
                        .as_obj()
                        .filter(|obj| obj.as_class().is_some())
                        .cloned();
                    match class_ref {
                        Some(class_ref) => {
                            let num_fields = class_ref
                                .as_class()
                                .map(|c| c.num_fields)
                                .unwrap_or(0);
                            let instance = self.allocate(ObjKind::Instance(InstanceObj::new(
                                class_ref, num_fields,
                            )));
                            self.store_frame_receiver(Value::Obj(instance));
                        }
                        None => {
                            self.throw("Can only construct an instance of a class".to_string())?;
                        }
                    }
                }

                OpCode::Is => {
                    let class = self.pop();
                    let value = self.pop();
                    match class.as_obj().filter(|obj| obj.as_class().is_some()) {
                        Some(target) => {
                            let result = self.is_instance_of(&value, target);
                            self.push(Value::Bool(result));
                        }
                        None => self.throw("Right operand must be a class".to_string())?,
                    }
                }

                OpCode::End => {
                    if let Some(result) = self.end_frame() {
                        return Ok(result);
                    }
                }
            }
        }
    }

    /// Pop the current frame. Returns the whole run's result when the last
    /// frame of a caller-less fiber ends.
    fn end_frame(&mut self) -> Option<Value> {
        let fiber_ref = self.current_fiber();
        let (result, base) = {
            let mut fiber = fiber_mut(&fiber_ref);
            let result = fiber.pop();
            let frame = fiber.frames.pop().expect("frame stack underflow");
            (result, frame.stack_start)
        };
        close_upvalues(&fiber_ref, base);

        let finished = fiber_mut(&fiber_ref).frames.is_empty();
        if finished {
            // The fiber completed; hand the result to whoever called it.
            let caller = {
                let mut fiber = fiber_mut(&fiber_ref);
                fiber.stack.clear();
                fiber.caller.take()
            };
            match caller {
                Some(caller) => {
                    fiber_mut(&caller).set_resume_value(result);
                    self.fiber = Some(caller);
                    None
                }
                None => Some(result),
            }
        } else {
            // Truncate exactly to the call's argument window and leave the
            // result in the call-site slot.
            let mut fiber = fiber_mut(&fiber_ref);
            fiber.stack.truncate(base);
            fiber.push(result);
            None
        }
    }

    /// Dispatch a method call: index the receiver class's method table and
    /// act on the entry's variant.
    fn call_method(&mut self, arg_count: usize, symbol: u16) -> Result<(), RuntimeError> {
        let fiber_ref = self.current_fiber();
        let (receiver, base) = {
            let fiber = fiber_mut(&fiber_ref);
            let base = fiber.stack.len() - arg_count - 1;
            (fiber.stack[base].clone(), base)
        };

        let class = self.class_of(&receiver);
        let method = class
            .as_class()
            .map(|c| c.method(symbol))
            .unwrap_or(Method::None);

        match method {
            Method::None => {
                let class_name = class
                    .as_class()
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                let signature = self
                    .method_names
                    .name(symbol)
                    .unwrap_or("?")
                    .trim_end()
                    .to_string();
                self.throw(format!(
                    "{} does not implement '{}'",
                    class_name, signature
                ))
            }
            Method::Primitive(function) => {
                let mut args = {
                    let fiber = fiber_mut(&fiber_ref);
                    fiber.stack[base..].to_vec()
                };
                match function(self, &mut args) {
                    PrimitiveResult::Value(value) => {
                        let mut fiber = fiber_mut(&fiber_ref);
                        fiber.stack.truncate(base);
                        fiber.push(value);
                        Ok(())
                    }
                    PrimitiveResult::Error(message) => self.throw(message),
                    PrimitiveResult::Call => Ok(()),
                }
            }
            Method::FiberPrimitive(function) => {
                let args = {
                    let fiber = fiber_mut(&fiber_ref);
                    fiber.stack[base..].to_vec()
                };
                match function(self, &args) {
                    FiberAction::Switch(next) => {
                        self.fiber = Some(next);
                        Ok(())
                    }
                    FiberAction::Error(message) => self.throw(message),
                }
            }
            Method::Block(closure) => match self.push_frame(closure, base) {
                Ok(()) => Ok(()),
                Err(message) => self.throw(message),
            },
        }
    }

    /// Push a call frame for a closure over an argument window that starts
    /// at `base` on the current fiber.
    pub(crate) fn push_frame(&mut self, closure: ObjRef, base: usize) -> Result<(), String> {
        let fiber_ref = self.current_fiber();
        let mut fiber = fiber_mut(&fiber_ref);
        if fiber.frames.len() >= FRAMES_MAX {
            return Err("Stack overflow".to_string());
        }
        fiber.frames.push(CallFrame {
            closure,
            ip: 0,
            stack_start: base,
        });
        Ok(())
    }

    fn finish_class(
        &mut self,
        name: Value,
        superclass: ObjRef,
        declared_fields: usize,
    ) -> Result<(), RuntimeError> {
        let name = match name.as_obj().and_then(|obj| obj.as_str()) {
            Some(s) => s.value.clone(),
            None => return self.throw("Class name must be a string".to_string()),
        };
        match self.create_class(name, superclass, declared_fields) {
            Ok(class) => {
                self.push(Value::Obj(class));
                Ok(())
            }
            Err(message) => self.throw(message),
        }
    }

    fn make_closure(&mut self, function: Value) -> Result<(), RuntimeError> {
        let function_ref = match function.as_obj() {
            Some(obj) if obj.as_fn().is_some() => obj.clone(),
            _ => return self.throw("Closure target is not a function".to_string()),
        };
        let upvalue_count = function_ref
            .as_fn()
            .map(|f| f.upvalue_count)
            .unwrap_or(0);

        let fiber_ref = self.current_fiber();
        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            if is_local {
                let base = {
                    let fiber = fiber_mut(&fiber_ref);
                    fiber.frames.last().expect("no call frame").stack_start
                };
                upvalues.push(self.capture_upvalue(&fiber_ref, base + index));
            } else {
                let parent = {
                    let fiber = fiber_mut(&fiber_ref);
                    let frame = fiber.frames.last().expect("no call frame");
                    frame
                        .closure
                        .as_closure()
                        .expect("frame closure is not a closure")
                        .upvalues[index]
                        .clone()
                };
                upvalues.push(parent);
            }
        }

        let closure = self.allocate(ObjKind::Closure(ClosureObj {
            function: function_ref,
            upvalues,
        }));
        self.push(Value::Obj(closure));
        Ok(())
    }

    /// Find or create the open upvalue aliasing a stack slot of a fiber.
    /// Two closures capturing the same local share one upvalue object, so
    /// they keep sharing the closed cell after the frame exits.
    fn capture_upvalue(&mut self, fiber_ref: &ObjRef, slot: usize) -> ObjRef {
        {
            let fiber = fiber_mut(fiber_ref);
            for upvalue in &fiber.open_upvalues {
                let matches = upvalue
                    .as_upvalue()
                    .map(|state| {
                        matches!(
                            &*state.borrow(),
                            UpvalueState::Open { slot: open_slot, .. } if *open_slot == slot
                        )
                    })
                    .unwrap_or(false);
                if matches {
                    return upvalue.clone();
                }
            }
        }

        let upvalue = self.allocate(ObjKind::Upvalue(RefCell::new(UpvalueState::Open {
            fiber: fiber_ref.clone(),
            slot,
        })));
        fiber_mut(fiber_ref).open_upvalues.push(upvalue.clone());
        upvalue
    }

    fn read_upvalue(&self, upvalue: &ObjRef) -> Value {
        let state = upvalue.as_upvalue().expect("not an upvalue");
        let state = state.borrow();
        match &*state {
            UpvalueState::Open { fiber, slot } => fiber_mut(fiber).stack[*slot].clone(),
            UpvalueState::Closed(value) => value.clone(),
        }
    }

    fn write_upvalue(&self, upvalue: &ObjRef, value: Value) {
        let state = upvalue.as_upvalue().expect("not an upvalue");
        let target = {
            let borrowed = state.borrow();
            match &*borrowed {
                UpvalueState::Open { fiber, slot } => Some((fiber.clone(), *slot)),
                UpvalueState::Closed(_) => None,
            }
        };
        match target {
            Some((fiber, slot)) => fiber_mut(&fiber).stack[slot] = value,
            None => *state.borrow_mut() = UpvalueState::Closed(value),
        }
    }

    fn is_instance_of(&self, value: &Value, target: &ObjRef) -> bool {
        let mut class = self.class_of(value);
        loop {
            if Rc::ptr_eq(&class, target) {
                return true;
            }
            let superclass = class.as_class().and_then(|c| c.superclass.clone());
            match superclass {
                Some(superclass) => class = superclass,
                None => return false,
            }
        }
    }

    // ========== Error propagation ==========

    /// Raise a runtime error in the current fiber. The error travels up the
    /// caller chain; a fiber called with `try` delivers it to its caller as
    /// a plain value, otherwise reaching the root is fatal.
    pub(crate) fn throw(&mut self, message: String) -> Result<(), RuntimeError> {
        let error_value = self.new_string(message.clone());
        let origin = self.current_fiber();
        let trace = self.capture_trace(&origin);

        let mut current = origin;
        loop {
            let (trying, caller) = {
                let mut fiber = fiber_mut(&current);
                if fiber.error.is_none() {
                    fiber.error = Some(error_value.clone());
                }
                (fiber.caller_is_trying, fiber.caller.take())
            };

            if trying {
                let caller = caller.expect("trying fiber has no caller");
                fiber_mut(&caller).set_resume_value(error_value);
                self.fiber = Some(caller);
                return Ok(());
            }
            match caller {
                Some(next) => current = next,
                None => return Err(RuntimeError::new(message, trace)),
            }
        }
    }

    fn capture_trace(&self, fiber_ref: &ObjRef) -> Vec<TraceFrame> {
        let fiber = fiber_mut(fiber_ref);
        fiber
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let ip = frame.ip.saturating_sub(1);
                let (function, line) = frame
                    .closure
                    .as_closure()
                    .and_then(|c| c.function.as_fn())
                    .map(|f| (f.name.clone(), f.chunk.line_at(ip)))
                    .unwrap_or_else(|| ("?".to_string(), 0));
                TraceFrame { function, line }
            })
            .collect()
    }

    // ========== Fiber / stack helpers ==========

    pub(crate) fn current_fiber(&self) -> ObjRef {
        self.fiber.clone().expect("no fiber is running")
    }

    pub(crate) fn is_root_fiber(&self, fiber: &ObjRef) -> bool {
        self.root_fiber
            .as_ref()
            .map(|root| Rc::ptr_eq(root, fiber))
            .unwrap_or(false)
    }

    pub(crate) fn is_current_fiber(&self, fiber: &ObjRef) -> bool {
        self.fiber
            .as_ref()
            .map(|current| Rc::ptr_eq(current, fiber))
            .unwrap_or(false)
    }

    fn read_byte(&mut self) -> u8 {
        let fiber_ref = self.current_fiber();
        let mut fiber = fiber_mut(&fiber_ref);
        let frame = fiber.frames.last_mut().expect("no call frame");
        let byte = chunk_of(&frame.closure).code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let low = self.read_byte() as u16;
        let high = self.read_byte() as u16;
        low | (high << 8)
    }

    fn read_constant(&self, index: u16) -> Value {
        let fiber_ref = self.current_fiber();
        let fiber = fiber_mut(&fiber_ref);
        let frame = fiber.frames.last().expect("no call frame");
        chunk_of(&frame.closure).constants[index as usize].clone()
    }

    fn adjust_ip(&mut self, delta: isize) {
        let fiber_ref = self.current_fiber();
        let mut fiber = fiber_mut(&fiber_ref);
        let frame = fiber.frames.last_mut().expect("no call frame");
        frame.ip = (frame.ip as isize + delta) as usize;
    }

    fn frame_upvalue(&self, index: usize) -> ObjRef {
        let fiber_ref = self.current_fiber();
        let fiber = fiber_mut(&fiber_ref);
        let frame = fiber.frames.last().expect("no call frame");
        frame
            .closure
            .as_closure()
            .expect("frame closure is not a closure")
            .upvalues[index]
            .clone()
    }

    fn frame_receiver(&self) -> Value {
        let fiber_ref = self.current_fiber();
        let fiber = fiber_mut(&fiber_ref);
        let base = fiber.frames.last().expect("no call frame").stack_start;
        fiber.stack[base].clone()
    }

    fn store_frame_receiver(&self, value: Value) {
        let fiber_ref = self.current_fiber();
        let mut fiber = fiber_mut(&fiber_ref);
        let base = fiber.frames.last().expect("no call frame").stack_start;
        fiber.stack[base] = value;
    }

    fn push(&mut self, value: Value) {
        let fiber_ref = self.current_fiber();
        fiber_mut(&fiber_ref).push(value);
    }

    fn pop(&mut self) -> Value {
        let fiber_ref = self.current_fiber();
        let value = fiber_mut(&fiber_ref).pop();
        value
    }

    fn peek(&self, distance: usize) -> Value {
        let fiber_ref = self.current_fiber();
        let value = fiber_mut(&fiber_ref).peek(distance).clone();
        value
    }

    fn peek_window(&self, count: usize) -> Vec<Value> {
        let fiber_ref = self.current_fiber();
        let fiber = fiber_mut(&fiber_ref);
        let start = fiber.stack.len() - count;
        fiber.stack[start..].to_vec()
    }

    fn truncate_top(&mut self, count: usize) {
        let fiber_ref = self.current_fiber();
        let mut fiber = fiber_mut(&fiber_ref);
        let len = fiber.stack.len();
        fiber.stack.truncate(len - count);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrow a fiber object's state mutably. Borrows are always short-lived:
/// no helper holds one across an allocation or a nested call.
pub(crate) fn fiber_mut(obj: &ObjRef) -> RefMut<'_, Fiber> {
    obj.as_fiber()
        .expect("object is not a fiber")
        .borrow_mut()
}

fn chunk_of(closure: &ObjRef) -> &Chunk {
    let closure = closure
        .as_closure()
        .expect("frame closure is not a closure");
    &closure
        .function
        .as_fn()
        .expect("closure target is not a function")
        .chunk
}

/// Close every open upvalue aliasing a slot at or above `from_slot`,
/// copying the slot's value into the upvalue. Closed upvalues never reopen.
pub(crate) fn close_upvalues(fiber_ref: &ObjRef, from_slot: usize) {
    let fiber = fiber_mut(fiber_ref);
    for upvalue in fiber.open_upvalues.iter() {
        let Some(state) = upvalue.as_upvalue() else { continue };
        let close_slot = match &*state.borrow() {
            UpvalueState::Open { slot, .. } if *slot >= from_slot => Some(*slot),
            _ => None,
        };
        if let Some(slot) = close_slot {
            let value = fiber.stack[slot].clone();
            *state.borrow_mut() = UpvalueState::Closed(value);
        }
    }
    drop(fiber);
    let mut fiber = fiber_mut(fiber_ref);
    fiber.open_upvalues.retain(|upvalue| {
        upvalue
            .as_upvalue()
            .map(|state| state.borrow().is_open())
            .unwrap_or(false)
    });
}

fn field_of(receiver: &Value, index: usize) -> Result<Value, String> {
    let instance = receiver
        .as_obj()
        .and_then(|obj| obj.as_instance())
        .ok_or_else(|| "Only instances have fields".to_string())?;
    instance
        .fields
        .borrow()
        .get(index)
        .cloned()
        .ok_or_else(|| "Invalid field access".to_string())
}

fn set_field_of(receiver: &Value, index: usize, value: Value) -> Result<(), String> {
    let instance = receiver
        .as_obj()
        .and_then(|obj| obj.as_instance())
        .ok_or_else(|| "Only instances have fields".to_string())?;
    let mut fields = instance.fields.borrow_mut();
    match fields.get_mut(index) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err("Invalid field access".to_string()),
    }
}

fn runtime_error(message: String) -> TernError {
    TernError::Runtime(RuntimeError::new(message, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str) -> Result<Value, TernError> {
        Vm::new().interpret("test", source)
    }

    fn eval_num(source: &str) -> f64 {
        match eval(source).expect("program should run") {
            Value::Num(n) => n,
            other => panic!("expected number, got {:?}", other),
        }
    }

    fn eval_str(source: &str) -> String {
        match eval(source).expect("program should run") {
            Value::Obj(obj) => obj.as_str().expect("expected string").value.clone(),
            other => panic!("expected string, got {:?}", other),
        }
    }

    fn eval_bool(source: &str) -> bool {
        match eval(source).expect("program should run") {
            Value::Bool(b) => b,
            other => panic!("expected bool, got {:?}", other),
        }
    }

    fn runtime_message(source: &str) -> String {
        match eval(source) {
            Err(TernError::Runtime(err)) => err.message,
            other => panic!("expected runtime error, got {:?}", other.map(|v| v.to_string())),
        }
    }

    // ===== Round-trips =====

    #[test]
    fn test_literal_arithmetic_round_trip() {
        assert_eq!(eval_num("1 + 2"), 3.0);
        assert_eq!(eval_num("2 * 3 + 4"), 10.0);
        assert_eq!(eval_num("2 + 3 * 4"), 14.0);
        assert_eq!(eval_num("(2 + 3) * 4"), 20.0);
        assert_eq!(eval_num("10 / 4"), 2.5);
        assert_eq!(eval_num("7 % 4"), 3.0);
        assert_eq!(eval_num("-(3) + 5"), 2.0);
    }

    #[test]
    fn test_string_to_string_round_trip() {
        assert_eq!(eval_str("\"hello\".toString"), "hello");
        assert_eq!(eval_str("\"con\" + \"cat\""), "concat");
        assert_eq!(eval_str("(1 + 2).toString"), "3");
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert!(eval_bool("1 < 2"));
        assert!(!eval_bool("2 <= 1"));
        assert!(eval_bool("2 == 2"));
        assert!(eval_bool("1 != 2"));
        assert!(eval_bool("\"a\" == \"a\""));
        assert!(eval_bool("true && true"));
        assert!(!eval_bool("true && false"));
        assert!(eval_bool("false || true"));
        assert!(eval_bool("!false"));
        // Short-circuit: the right side must not run.
        assert_eq!(eval_num("var x = 1 false && (x = 2) x"), 1.0);
        assert_eq!(eval_num("var y = 1 true || (y = 2) y"), 1.0);
    }

    #[test]
    fn test_globals_and_locals() {
        assert_eq!(eval_num("var a = 5 var b = a + 1 b"), 6.0);
        assert_eq!(eval_num("var a = 1 { var b = 2 a = a + b } a"), 3.0);
    }

    #[test]
    fn test_if_and_while() {
        assert_eq!(eval_num("var x = 0 if (true) x = 1 else x = 2 x"), 1.0);
        assert_eq!(eval_num("var x = 0 if (false) x = 1 else x = 2 x"), 2.0);
        assert_eq!(
            eval_num("var i = 0 var sum = 0 while (i < 5) { sum = sum + i i = i + 1 } sum"),
            10.0
        );
    }

    #[test]
    fn test_function_values_and_calls() {
        assert_eq!(eval_num("var add = fn (a, b) { a + b } add(1, 2)"), 3.0);
        assert_eq!(eval_num("var f = fn { 42 } f()"), 42.0);
        assert_eq!(eval_num("var f = fn (x) { x * 2 } f.call(21)"), 42.0);
    }

    #[test]
    fn test_implicit_last_expression_return() {
        assert_eq!(eval_num("var f = fn { 1 2 3 } f()"), 3.0);
        assert_eq!(eval_num("var f = fn { if (true) { } 7 } f()"), 7.0);
    }

    #[test]
    fn test_explicit_return() {
        assert_eq!(
            eval_num("var f = fn (x) { if (x > 0) { return 1 } 0 - 1 } f(5)"),
            1.0
        );
        assert_eq!(eval(
            "var f = fn { return } f()"
        ).unwrap(), Value::Nil);
    }

    // ===== Classes =====

    #[test]
    fn test_counter_scenario() {
        let source = "class Counter { new() { _n = 0 } inc() { _n = _n + 1 } get() { _n } } \
                      var c = Counter.new() c.inc() c.inc() c.get()";
        assert_eq!(eval_num(source), 2.0);
    }

    #[test]
    fn test_constructor_arguments_and_getters() {
        let source = "class Point { new(x, y) { _x = x _y = y } x { _x } y { _y } \
                      sum { _x + _y } } var p = Point.new(3, 4) p.sum";
        assert_eq!(eval_num(source), 7.0);
    }

    #[test]
    fn test_setter_methods() {
        let source = "class Box { new() { _v = 0 } v { _v } v=(value) { _v = value } } \
                      var b = Box.new() b.v = 9 b.v";
        assert_eq!(eval_num(source), 9.0);
    }

    #[test]
    fn test_inheritance_and_override() {
        let source = "class Animal { new() { } speak() { \"generic\" } kind() { \"animal\" } } \
                      class Dog is Animal { new() { } speak() { \"woof\" } } \
                      var d = Dog.new() d.speak() + \"/\" + d.kind()";
        assert_eq!(eval_str(source), "woof/animal");
    }

    #[test]
    fn test_subclass_responds_to_all_ancestor_methods() {
        let source = "class A { new() { } a() { 1 } } \
                      class B is A { new() { } b() { 2 } } \
                      class C is B { new() { } c() { 3 } } \
                      var c = C.new() c.a() + c.b() + c.c()";
        assert_eq!(eval_num(source), 6.0);
    }

    #[test]
    fn test_override_shadows_for_future_calls() {
        // Redefining in a subclass shadows the ancestor implementation.
        let source = "class A { new() { } m() { 1 } } \
                      class B is A { new() { } m() { 2 } } \
                      var a = A.new() var b = B.new() a.m() * 10 + b.m()";
        assert_eq!(eval_num(source), 12.0);
    }

    #[test]
    fn test_inherited_fields_do_not_collide() {
        let source = "class A { new() { _x = 1 } x { _x } } \
                      class B is A { new() { _y = 2 } y { _y } both { _y } } \
                      var b = B.new() b.y";
        // B's _y must not overwrite A's _x slot.
        assert_eq!(eval_num(source), 2.0);
    }

    #[test]
    fn test_static_methods() {
        let source = "class MathUtil { static double(x) { x * 2 } } MathUtil.double(21)";
        assert_eq!(eval_num(source), 42.0);
    }

    #[test]
    fn test_operator_overload() {
        let source = "class Vec { new(x) { _x = x } x { _x } +(other) { Vec.new(_x + other.x) } } \
                      var v = Vec.new(1) + Vec.new(2) v.x";
        assert_eq!(eval_num(source), 3.0);
    }

    #[test]
    fn test_mixed_fix_method() {
        let source = "class Cond { static pick(c) else(b) { if (c) { return \"then\" } b } } \
                      Cond.pick(false) else(\"other\")";
        assert_eq!(eval_str(source), "other");
    }

    #[test]
    fn test_is_operator() {
        let source = "class A { new() { } } class B is A { new() { } } var b = B.new() b is A";
        assert!(eval_bool(source));
        assert!(eval_bool("1 is Num"));
        assert!(eval_bool("\"s\" is String"));
        assert!(!eval_bool("1 is String"));
        assert!(eval_bool("1 is Object"));
    }

    #[test]
    fn test_method_not_implemented_error() {
        let message = runtime_message("1.frob");
        assert_eq!(message, "Num does not implement 'frob'");
    }

    // ===== Closures =====

    #[test]
    fn test_closure_captures_after_frame_exit() {
        let source = "var make = fn { var n = 10 fn { n } } var f = make() f()";
        assert_eq!(eval_num(source), 10.0);
    }

    #[test]
    fn test_closures_share_open_and_closed_cell() {
        // Two closures over the same local observe each other's writes both
        // while the frame is live and after it has returned: one shared
        // closed cell, not two copies.
        let source = "var make = fn { var n = 0 \
                        var inc = fn { n = n + 1 n } \
                        var get = fn { n } \
                        inc() \
                        [inc, get] } \
                      var pair = make() \
                      pair[0].call() \
                      pair[0].call() \
                      pair[1].call()";
        assert_eq!(eval_num(source), 3.0);
    }

    #[test]
    fn test_counter_closure_pair_independent_instances() {
        let source = "var make = fn { var n = 0 fn { n = n + 1 n } } \
                      var a = make() var b = make() a() a() b() a() * 10 + b()";
        // a has been called 3 times, b twice.
        assert_eq!(eval_num(source), 32.0);
    }

    #[test]
    fn test_upvalue_chain_through_nested_fns() {
        let source = "var f = fn (x) { fn { fn { x } } } f(7)()()";
        assert_eq!(eval_num(source), 7.0);
    }

    // ===== Lists, maps, ranges =====

    #[test]
    fn test_list_literals_and_subscript() {
        assert_eq!(eval_num("var l = [1, 2, 3] l[0] + l[2]"), 4.0);
        assert_eq!(eval_num("var l = [1, 2, 3] l[-1]"), 3.0);
        assert_eq!(eval_num("var l = [1] l[0] = 9 l[0]"), 9.0);
        assert_eq!(eval_num("var l = [] l.add(5) l.count"), 1.0);
    }

    #[test]
    fn test_list_index_out_of_bounds() {
        let message = runtime_message("[1, 2][5]");
        assert_eq!(message, "Subscript out of bounds");
    }

    #[test]
    fn test_map_literals_and_access() {
        assert_eq!(eval_num("var m = {\"a\": 1, \"b\": 2} m[\"b\"]"), 2.0);
        assert_eq!(eval(
            "var m = {} m[\"missing\"]"
        ).unwrap(), Value::Nil);
        assert_eq!(eval_num("var m = {} m[\"k\"] = 3 m[\"k\"]"), 3.0);
        assert_eq!(eval_num("var m = {1: \"one\"} m.count"), 1.0);
        assert!(eval_bool("var m = {\"k\": 1} m.containsKey(\"k\")"));
    }

    #[test]
    fn test_unhashable_map_key() {
        let message = runtime_message("var m = {} m[[1]] = 2");
        assert_eq!(message, "Key must be hashable");
    }

    #[test]
    fn test_ranges() {
        assert_eq!(eval_num("(1..4).from"), 1.0);
        assert_eq!(eval_num("(1..4).to"), 4.0);
        assert!(eval_bool("(1..4).isInclusive"));
        assert!(!eval_bool("(1...4).isInclusive"));
    }

    // ===== Fibers =====

    #[test]
    fn test_fiber_call_and_yield() {
        let source = "var f = Fiber.new(fn { Fiber.yield(1) Fiber.yield(2) 3 }) \
                      f.call() + f.call() * 10 + f.call() * 100";
        assert_eq!(eval_num(source), 321.0);
    }

    #[test]
    fn test_fiber_seeds_value_into_resume(){
        let source = "var f = Fiber.new(fn (start) { var got = Fiber.yield(start + 1) got * 2 }) \
                      var first = f.call(10) first + f.call(100)";
        // first = 11, then the fiber resumes with 100 and returns 200.
        assert_eq!(eval_num(source), 211.0);
    }

    #[test]
    fn test_fiber_is_done_and_completion_value() {
        let source = "var f = Fiber.new(fn { 7 }) var v = f.call() \
                      var out = 0 - 1 if (f.isDone) { out = v } out";
        assert_eq!(eval_num(source), 7.0);
    }

    #[test]
    fn test_fiber_is_not_done_while_suspended() {
        let source = "var f = Fiber.new(fn { Fiber.yield(1) 2 }) f.call() \
                      var out = 0 if (f.isDone) { out = 1 } out";
        assert_eq!(eval_num(source), 0.0);
    }

    #[test]
    fn test_calling_running_fiber_fails() {
        let source = "var f = Fiber.new(fn { Fiber.current.call() }) f.call()";
        let message = runtime_message(source);
        assert_eq!(message, "Fiber has already been called");
    }

    #[test]
    fn test_calling_unfinished_fiber_twice_fails() {
        // g was called by the root and is suspended waiting on f's yield;
        // calling it again from f must fail, not corrupt the frame stack.
        let source = "var g = nil \
                      var f = Fiber.new(fn { g.call() }) \
                      g = Fiber.new(fn { f.call() }) \
                      g.call()";
        let message = runtime_message(source);
        assert_eq!(message, "Fiber has already been called");
    }

    #[test]
    fn test_calling_finished_fiber_fails() {
        let source = "var f = Fiber.new(fn { 1 }) f.call() f.call()";
        let message = runtime_message(source);
        assert_eq!(message, "Cannot call a finished fiber");
    }

    #[test]
    fn test_yield_without_caller_fails() {
        let message = runtime_message("Fiber.yield(1)");
        assert_eq!(message, "No fiber to yield to");
    }

    #[test]
    fn test_try_returns_error_as_value() {
        let source = "var f = Fiber.new(fn { 1.frob }) var err = f.try() err";
        assert_eq!(eval_str(source), "Num does not implement 'frob'");
    }

    #[test]
    fn test_try_leaves_caller_error_state_clean() {
        // After a try that caught an error, the caller keeps running and
        // can do normal work.
        let source = "var f = Fiber.new(fn { 1.frob }) f.try() \
                      var g = Fiber.new(fn { 5 }) g.call()";
        assert_eq!(eval_num(source), 5.0);
    }

    #[test]
    fn test_fiber_error_getter() {
        let source = "var f = Fiber.new(fn { [1][9] }) f.try() f.error";
        assert_eq!(eval_str(source), "Subscript out of bounds");
    }

    #[test]
    fn test_uncaught_fiber_error_is_fatal() {
        let source = "var f = Fiber.new(fn { 1.frob }) f.call()";
        let message = runtime_message(source);
        assert_eq!(message, "Num does not implement 'frob'");
    }

    #[test]
    fn test_run_transfers_to_original_caller() {
        // The documented tail-call semantics: when the root calls A and A
        // runs B, B's completion returns straight to the root, not to A.
        let source = "var log = [] \
                      var b = Fiber.new(fn { log.add(\"b\") 2 }) \
                      var a = Fiber.new(fn { log.add(\"a\") b.run() log.add(\"a-after\") }) \
                      var got = a.call() \
                      log.add(\"root\") \
                      log.count * 100 + got";
        // a-after never runs: log is [a, b, root] and the root receives b's
        // value.
        assert_eq!(eval_num(source), 302.0);
    }

    #[test]
    fn test_run_yield_resumes_original_caller() {
        let source = "var b = Fiber.new(fn { Fiber.yield(9) }) \
                      var a = Fiber.new(fn { b.run() }) \
                      a.call()";
        assert_eq!(eval_num(source), 9.0);
    }

    #[test]
    fn test_fiber_error_stops_resumption() {
        let source = "var f = Fiber.new(fn { 1.frob }) f.try() f.call()";
        let message = runtime_message(source);
        assert_eq!(message, "Cannot call an aborted fiber");
    }

    // ===== Errors =====

    #[test]
    fn test_runtime_error_carries_stack_trace() {
        let source = "class T { new() { } boom() { 1.frob } } var t = T.new() t.boom()";
        match eval(source) {
            Err(TernError::Runtime(err)) => {
                assert_eq!(err.message, "Num does not implement 'frob'");
                assert!(err.trace.iter().any(|f| f.function.contains("boom")));
                assert!(err.stack_trace().contains("[line 1]"));
            }
            other => panic!("expected runtime error, got {:?}", other.map(|v| v.to_string())),
        }
    }

    #[test]
    fn test_wrong_operand_type_errors() {
        assert_eq!(runtime_message("1 + \"x\""), "Right operand must be a number");
        assert_eq!(runtime_message("\"x\" + 1"), "Right operand must be a string");
    }

    #[test]
    fn test_stack_overflow_is_reported() {
        let source = "var f = nil f = fn { f() } f()";
        assert_eq!(runtime_message(source), "Stack overflow");
    }

    // ===== GC =====

    #[test]
    fn test_gc_soundness_under_allocation_churn() {
        // Allocate many short-lived lists while holding one fiber reference
        // plus a long-lived list; everything reachable must survive the
        // collections this churn triggers.
        let source = "var keep = [1, 2, 3] \
                      var fib = Fiber.new(fn { Fiber.yield(keep[0]) keep[1] }) \
                      var first = fib.call() \
                      var i = 0 \
                      while (i < 3000) { var junk = [i, [i], \"tmp\"] i = i + 1 } \
                      first + fib.call() + keep[2]";
        let mut vm = Vm::new();
        let result = vm.interpret("gc", source).expect("program should run");
        assert_eq!(result, Value::Num(6.0));
        assert!(vm.heap.collections() > 0, "the churn should trigger the collector");
    }

    #[test]
    fn test_gc_closed_upvalues_survive_collection() {
        let source = "var make = fn { var n = 41 fn { n = n + 1 n } } \
                      var f = make() \
                      var i = 0 \
                      while (i < 3000) { var junk = [i, \"x\"] i = i + 1 } \
                      f()";
        assert_eq!(eval_num(source), 42.0);
    }

    // ===== VM instance isolation =====

    #[test]
    fn test_globals_persist_across_interprets() {
        let mut vm = Vm::new();
        vm.interpret("a", "var x = 40").unwrap();
        let result = vm.interpret("b", "x + 2").unwrap();
        assert_eq!(result, Value::Num(42.0));
    }

    #[test]
    fn test_vm_instances_do_not_alias() {
        let mut a = Vm::new();
        let mut b = Vm::new();
        a.interpret("a", "var x = 1").unwrap();
        // x exists only in the first VM.
        assert!(b.interpret("b", "x").is_err());
    }

    #[test]
    fn test_define_and_read_globals_from_host() {
        let mut vm = Vm::new();
        vm.define_global("seeded", Value::Num(5.0));
        let result = vm.interpret("host", "var out = seeded * 2 out").unwrap();
        assert_eq!(result, Value::Num(10.0));
        assert_eq!(vm.global("out"), Some(Value::Num(10.0)));
    }

    #[test]
    fn test_host_bound_primitive() {
        let mut vm = Vm::new();
        vm.interpret("defs", "class Host { }").unwrap();
        vm.bind_static_primitive("Host", "greet", |vm, _args| {
            PrimitiveResult::Value(vm.new_string("hi"))
        })
        .unwrap();
        let result = vm.interpret("use", "Host.greet").unwrap();
        assert_eq!(result.to_string(), "hi");
    }
}
