//! Runtime values and heap object kinds for the Tern VM.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::vm::chunk::Chunk;
use crate::vm::fiber::Fiber;
use crate::vm::vm::Vm;

/// A reference-counted handle to a heap object. The heap keeps one handle
/// per live object; everything else shares it.
pub type ObjRef = Rc<Obj>;

/// The map representation: insertion-ordered, keyed by hashable values.
pub type TernMap = IndexMap<MapKey, Value, ahash::RandomState>;

/// A runtime value: the closed sum of nil, booleans, 64-bit floats, and
/// heap object references. Integers are not a distinct runtime type.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Num(f64),
    Obj(ObjRef),
}

impl Value {
    /// Only nil and false are falsey.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Identity: same variant, numbers by value, objects by reference.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Value equality as the `==` method sees it: identity, except strings
    /// and ranges compare by content.
    pub fn content_eq(&self, other: &Value) -> bool {
        if self.same(other) {
            return true;
        }
        match (self, other) {
            (Value::Obj(a), Value::Obj(b)) => match (&a.kind, &b.kind) {
                (ObjKind::Str(x), ObjKind::Str(y)) => x.value == y.value,
                (ObjKind::Range(x), ObjKind::Range(y)) => {
                    x.from == y.from && x.to == y.to && x.inclusive == y.inclusive
                }
                _ => false,
            },
            _ => false,
        }
    }

    pub fn as_obj(&self) -> Option<&ObjRef> {
        match self {
            Value::Obj(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "Nil",
            Value::Bool(_) => "Bool",
            Value::Num(_) => "Num",
            Value::Obj(obj) => obj.kind_name(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.content_eq(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Num(n) => write!(f, "{}", format_num(*n)),
            Value::Obj(obj) => write!(f, "{}", obj),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Obj(obj) if matches!(obj.kind, ObjKind::Str(_)) => write!(f, "\"{}\"", obj),
            other => write!(f, "{}", other),
        }
    }
}

/// Print a number the way the language does: integral values without a
/// trailing ".0".
pub fn format_num(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// A heap object: common header (mark bit; the kind tag is the enum
/// discriminant) plus kind-specific payload.
pub struct Obj {
    pub mark: Cell<bool>,
    pub kind: ObjKind,
}

impl Obj {
    pub fn new(kind: ObjKind) -> Self {
        Self {
            mark: Cell::new(false),
            kind,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            ObjKind::Str(_) => "String",
            ObjKind::Fn(_) => "Fn",
            ObjKind::Closure(_) => "Fn",
            ObjKind::Upvalue(_) => "Upvalue",
            ObjKind::Class(_) => "Class",
            ObjKind::Instance(_) => "Instance",
            ObjKind::List(_) => "List",
            ObjKind::Map(_) => "Map",
            ObjKind::Range(_) => "Range",
            ObjKind::Fiber(_) => "Fiber",
        }
    }

    pub fn as_str(&self) -> Option<&StrObj> {
        match &self.kind {
            ObjKind::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_fn(&self) -> Option<&FnObj> {
        match &self.kind {
            ObjKind::Fn(func) => Some(func),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&ClosureObj> {
        match &self.kind {
            ObjKind::Closure(closure) => Some(closure),
            _ => None,
        }
    }

    pub fn as_upvalue(&self) -> Option<&RefCell<UpvalueState>> {
        match &self.kind {
            ObjKind::Upvalue(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ClassObj> {
        match &self.kind {
            ObjKind::Class(class) => Some(class),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&InstanceObj> {
        match &self.kind {
            ObjKind::Instance(instance) => Some(instance),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&RefCell<Vec<Value>>> {
        match &self.kind {
            ObjKind::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&RefCell<TernMap>> {
        match &self.kind {
            ObjKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_range(&self) -> Option<&RangeObj> {
        match &self.kind {
            ObjKind::Range(range) => Some(range),
            _ => None,
        }
    }

    pub fn as_fiber(&self) -> Option<&RefCell<Fiber>> {
        match &self.kind {
            ObjKind::Fiber(fiber) => Some(fiber),
            _ => None,
        }
    }
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ObjKind::Str(s) => write!(f, "{}", s.value),
            ObjKind::Fn(func) => write!(f, "<fn {}>", func.name),
            ObjKind::Closure(closure) => match closure.function.as_fn() {
                Some(func) => write!(f, "<fn {}>", func.name),
                None => write!(f, "<fn>"),
            },
            ObjKind::Upvalue(_) => write!(f, "<upvalue>"),
            ObjKind::Class(class) => write!(f, "{}", class.name),
            ObjKind::Instance(instance) => {
                match instance.class.as_class() {
                    Some(class) => write!(f, "instance of {}", class.name),
                    None => write!(f, "instance"),
                }
            }
            ObjKind::List(list) => {
                write!(f, "[")?;
                for (i, element) in list.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", element)?;
                }
                write!(f, "]")
            }
            ObjKind::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {:?}", key.0, value)?;
                }
                write!(f, "}}")
            }
            ObjKind::Range(range) => {
                let dots = if range.inclusive { ".." } else { "..." };
                write!(
                    f,
                    "{}{}{}",
                    format_num(range.from),
                    dots,
                    format_num(range.to)
                )
            }
            ObjKind::Fiber(_) => write!(f, "<fiber>"),
        }
    }
}

impl fmt::Debug for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Kind-specific payload for heap objects.
pub enum ObjKind {
    Str(StrObj),
    Fn(FnObj),
    Closure(ClosureObj),
    Upvalue(RefCell<UpvalueState>),
    Class(ClassObj),
    Instance(InstanceObj),
    List(RefCell<Vec<Value>>),
    Map(RefCell<TernMap>),
    Range(RangeObj),
    Fiber(RefCell<Fiber>),
}

/// An immutable string with its FNV-1a hash cached at construction.
pub struct StrObj {
    pub value: String,
    pub hash: u32,
}

impl StrObj {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let hash = fnv1a(value.as_bytes());
        Self { value, hash }
    }
}

/// FNV-1a over a byte slice.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// A compiled function: bytecode, constants, arity, capture count.
/// Immutable once compilation completes.
pub struct FnObj {
    pub name: String,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
}

/// A function paired with its captured upvalues.
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// The two states of a captured variable. `Open` aliases a live stack slot
/// of the owning fiber; once that frame exits the upvalue closes over a
/// private copy. The transition is one-way.
pub enum UpvalueState {
    Open { fiber: ObjRef, slot: usize },
    Closed(Value),
}

impl UpvalueState {
    pub fn is_open(&self) -> bool {
        matches!(self, UpvalueState::Open { .. })
    }
}

/// A class: flat method table indexed by symbol, single superclass,
/// metaclass for statics, and the instance field count including inherited
/// fields. The method table is copied from the superclass at creation so
/// dispatch never walks a chain.
pub struct ClassObj {
    pub name: String,
    pub superclass: Option<ObjRef>,
    /// The metaclass holding this class's static methods. `None` only for
    /// metaclasses themselves.
    pub metaclass: Option<ObjRef>,
    pub num_fields: usize,
    pub methods: RefCell<Vec<Method>>,
}

impl ClassObj {
    /// Look up a method by symbol. Symbols past the table end simply do not
    /// resolve; the table itself is never grown by lookups.
    pub fn method(&self, symbol: u16) -> Method {
        self.methods
            .borrow()
            .get(symbol as usize)
            .cloned()
            .unwrap_or(Method::None)
    }

    /// Bind a method implementation for a symbol, filling intervening
    /// entries with `None`.
    pub fn set_method(&self, symbol: u16, method: Method) {
        let mut methods = self.methods.borrow_mut();
        if methods.len() <= symbol as usize {
            methods.resize(symbol as usize + 1, Method::None);
        }
        methods[symbol as usize] = method;
    }
}

/// An instance: its class plus an inline field array sized to the class's
/// field count.
pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: RefCell<Vec<Value>>,
}

impl InstanceObj {
    pub fn new(class: ObjRef, num_fields: usize) -> Self {
        Self {
            class,
            fields: RefCell::new(vec![Value::Nil; num_fields]),
        }
    }
}

/// A numeric range: from, to, and whether `to` is included.
pub struct RangeObj {
    pub from: f64,
    pub to: f64,
    pub inclusive: bool,
}

/// A native method: operates on the argument window (receiver first) and
/// reports a value, an error, or that it pushed a call frame.
pub type PrimitiveFn = fn(&mut Vm, &mut [Value]) -> PrimitiveResult;

/// A fiber-switching native method: never recurses into the interpreter,
/// instead telling the dispatch loop which fiber becomes current.
pub type FiberPrimitiveFn = fn(&mut Vm, &[Value]) -> FiberAction;

/// One entry in a class's method table.
#[derive(Clone)]
pub enum Method {
    /// No implementation bound for this symbol.
    None,
    /// A synchronous native method.
    Primitive(PrimitiveFn),
    /// A native method that requests a fiber switch.
    FiberPrimitive(FiberPrimitiveFn),
    /// A user-defined method: a closure over compiled bytecode.
    Block(ObjRef),
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::None => write!(f, "Method::None"),
            Method::Primitive(_) => write!(f, "Method::Primitive"),
            Method::FiberPrimitive(_) => write!(f, "Method::FiberPrimitive"),
            Method::Block(_) => write!(f, "Method::Block"),
        }
    }
}

/// Outcome of a synchronous primitive.
pub enum PrimitiveResult {
    /// The call's result; replaces the argument window.
    Value(Value),
    /// A runtime error to raise in the current fiber.
    Error(String),
    /// The primitive pushed a new call frame on the current fiber; the
    /// dispatch loop continues into it.
    Call,
}

/// Outcome of a fiber primitive.
pub enum FiberAction {
    /// Make this fiber current.
    Switch(ObjRef),
    /// A runtime error to raise in the current fiber.
    Error(String),
}

/// A map key wrapping a hashable value. Strings hash with their cached
/// FNV-1a hash and compare by content; numbers compare by canonical bit
/// pattern so keys are consistent under hashing; other objects use
/// reference identity.
#[derive(Clone, Debug)]
pub struct MapKey(pub Value);

fn canonical_num_bits(n: f64) -> u64 {
    // Fold -0.0 into 0.0 so the two hash and compare alike.
    if n == 0.0 {
        0
    } else {
        n.to_bits()
    }
}

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => canonical_num_bits(*a) == canonical_num_bits(*b),
            (Value::Obj(a), Value::Obj(b)) => match (&a.kind, &b.kind) {
                (ObjKind::Str(x), ObjKind::Str(y)) => x.hash == y.hash && x.value == y.value,
                (ObjKind::Range(x), ObjKind::Range(y)) => {
                    x.from == y.from && x.to == y.to && x.inclusive == y.inclusive
                }
                _ => Rc::ptr_eq(a, b),
            },
            _ => false,
        }
    }
}

impl Eq for MapKey {}

impl std::hash::Hash for MapKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::Nil => state.write_u8(0),
            Value::Bool(b) => {
                state.write_u8(1);
                state.write_u8(*b as u8);
            }
            Value::Num(n) => {
                state.write_u8(2);
                state.write_u64(canonical_num_bits(*n));
            }
            Value::Obj(obj) => match &obj.kind {
                ObjKind::Str(s) => {
                    state.write_u8(3);
                    state.write_u32(s.hash);
                }
                ObjKind::Range(r) => {
                    state.write_u8(4);
                    state.write_u64(canonical_num_bits(r.from));
                    state.write_u64(canonical_num_bits(r.to));
                    state.write_u8(r.inclusive as u8);
                }
                _ => {
                    state.write_u8(5);
                    state.write_usize(Rc::as_ptr(obj) as usize);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_falsiness() {
        assert!(Value::Nil.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(!Value::Bool(true).is_falsey());
        assert!(!Value::Num(0.0).is_falsey());
    }

    #[test]
    fn test_identity_vs_content() {
        let a = Rc::new(Obj::new(ObjKind::Str(StrObj::new("hi"))));
        let b = Rc::new(Obj::new(ObjKind::Str(StrObj::new("hi"))));
        let va = Value::Obj(a.clone());
        let vb = Value::Obj(b);
        assert!(!va.same(&vb));
        assert!(va.content_eq(&vb));
        assert!(va.same(&Value::Obj(a)));
    }

    #[test]
    fn test_num_formatting() {
        assert_eq!(format_num(3.0), "3");
        assert_eq!(format_num(3.5), "3.5");
        assert_eq!(format_num(-2.0), "-2");
    }

    #[test]
    fn test_string_hash_consistency() {
        let a = StrObj::new("counter");
        let b = StrObj::new("counter");
        assert_eq!(a.hash, b.hash);
        // Known FNV-1a value for the empty string is the offset basis.
        assert_eq!(StrObj::new("").hash, 2166136261);
    }

    #[test]
    fn test_method_table_fill() {
        let class = ClassObj {
            name: "T".to_string(),
            superclass: None,
            metaclass: None,
            num_fields: 0,
            methods: RefCell::new(Vec::new()),
        };
        assert!(matches!(class.method(3), Method::None));
        class.set_method(3, Method::Primitive(|_, _| PrimitiveResult::Value(Value::Nil)));
        assert!(matches!(class.method(3), Method::Primitive(_)));
        assert!(matches!(class.method(1), Method::None));
        assert!(matches!(class.method(200), Method::None));
    }

    #[test]
    fn test_map_key_semantics() {
        let s1 = MapKey(Value::Obj(Rc::new(Obj::new(ObjKind::Str(StrObj::new("k"))))));
        let s2 = MapKey(Value::Obj(Rc::new(Obj::new(ObjKind::Str(StrObj::new("k"))))));
        assert_eq!(s1, s2);
        assert_eq!(
            MapKey(Value::Num(0.0)),
            MapKey(Value::Num(-0.0))
        );
        let list = Value::Obj(Rc::new(Obj::new(ObjKind::List(RefCell::new(vec![])))));
        assert_eq!(MapKey(list.clone()), MapKey(list.clone()));
    }
}
