//! Single-pass compiler: a Pratt parser that emits bytecode directly.
//!
//! There is no AST. Each token kind maps to an optional prefix and infix
//! parse action plus a binding precedence; parse actions write instructions
//! into the function currently being compiled. Nested function and method
//! bodies push a fresh `FunctionCompiler`; variable references that miss the
//! current scope walk the enclosing compilers and become upvalue captures.
//!
//! Statements are juxtaposed: an expression statement simply ends when the
//! next token has no infix role. The value of the last expression in a body
//! is that body's result.

pub mod precedence;
pub mod signature;

use crate::compiler::precedence::{get_precedence, Precedence};
use crate::compiler::signature::Signature;
use crate::error::{CompileError, Diagnostics};
use crate::lexer::{Scanner, Token, TokenKind};
use crate::vm::chunk::Chunk;
use crate::vm::opcode::{OpCode, MAX_CALL_ARGS};
use crate::vm::value::{FnObj, ObjKind, ObjRef, Value};
use crate::vm::vm::Vm;

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Local slots are addressed with a single byte.
pub const MAX_LOCALS: usize = 256;
/// Upvalue indices are addressed with a single byte.
pub const MAX_UPVALUES: usize = 256;

/// Compile a module's source into a function object ready to run.
///
/// All diagnostics are accumulated; if any were produced the unit is
/// discarded and they are returned together.
pub fn compile(vm: &mut Vm, module: &str, source: &str) -> Result<ObjRef, Diagnostics> {
    Compiler::new(vm, module, source).compile()
}

/// What kind of function body is being compiled; drives receiver naming,
/// field access checks, and implicit return values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    StaticMethod,
    Constructor,
}

/// A local variable in a scope.
#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: usize,
    is_captured: bool,
    initialized: bool,
}

/// Descriptor for one captured variable, consumed by the `Closure` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDescriptor {
    /// True when the capture refers to a local of the immediately enclosing
    /// function; false when it re-captures one of its upvalues.
    is_local: bool,
    index: u8,
}

/// Per-function compilation state. The compiler keeps a stack of these,
/// innermost last; the link to the lexically enclosing function is the
/// previous element.
struct FunctionCompiler {
    name: String,
    arity: u8,
    fn_type: FunctionType,
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDescriptor>,
    scope_depth: usize,
}

impl FunctionCompiler {
    fn new(name: String, fn_type: FunctionType, arity: u8) -> Self {
        // Slot 0 belongs to the receiver: `this` in methods, the closure
        // itself everywhere else.
        let receiver = match fn_type {
            FunctionType::Method | FunctionType::StaticMethod | FunctionType::Constructor => {
                "this"
            }
            _ => "",
        };
        Self {
            name,
            arity,
            fn_type,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: receiver.to_string(),
                depth: 0,
                is_captured: false,
                initialized: true,
            }],
            upvalues: Vec::new(),
            scope_depth: 1,
        }
    }
}

/// State for the class declaration being compiled, if any.
struct ClassCompiler {
    name: String,
    /// Field names in declaration order; an instance field's index is its
    /// position here. Offsets for inherited fields are applied when the
    /// method is bound to its class at runtime.
    fields: Vec<String>,
}

/// The single-pass compiler.
pub struct Compiler<'vm, 'src> {
    vm: &'vm mut Vm,
    scanner: Scanner<'src>,
    module: String,
    previous: Token,
    current: Token,
    errors: Vec<CompileError>,
    compilers: Vec<FunctionCompiler>,
    classes: Vec<ClassCompiler>,
}

impl<'vm, 'src> Compiler<'vm, 'src> {
    pub fn new(vm: &'vm mut Vm, module: &str, source: &'src str) -> Self {
        Self {
            vm,
            scanner: Scanner::new(source),
            module: module.to_string(),
            previous: Token::eof(0, 1, 1),
            current: Token::eof(0, 1, 1),
            errors: Vec::new(),
            compilers: vec![FunctionCompiler::new(
                "<main>".to_string(),
                FunctionType::Script,
                0,
            )],
            classes: Vec::new(),
        }
    }

    /// Compile the whole unit. The program's result is the value of its
    /// last expression statement, or nil.
    pub fn compile(mut self) -> Result<ObjRef, Diagnostics> {
        self.advance();

        let left_value = self.compile_body(&TokenKind::Eof);
        if !left_value {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::End);

        let script = self
            .compilers
            .pop()
            .expect("script compiler missing");
        if !self.errors.is_empty() {
            return Err(Diagnostics(self.errors));
        }

        Ok(self.vm.heap.allocate(ObjKind::Fn(FnObj {
            name: script.name,
            arity: 0,
            upvalue_count: 0,
            chunk: script.chunk,
        })))
    }

    // ========== Statements ==========

    /// Compile statements until the terminator. Returns whether the last
    /// statement left its value on the stack.
    fn compile_body(&mut self, terminator: &TokenKind) -> bool {
        let mut last_was_expr = false;
        while !self.check(terminator) && !self.check(&TokenKind::Eof) {
            last_was_expr = self.declaration_recovering();
            if last_was_expr && !self.check(terminator) && !self.check(&TokenKind::Eof) {
                self.emit_op(OpCode::Pop);
            }
        }
        last_was_expr
    }

    /// Compile one declaration, recording the diagnostic and resynchronizing
    /// on error so the rest of the unit still gets checked.
    fn declaration_recovering(&mut self) -> bool {
        match self.declaration() {
            Ok(left_value) => left_value,
            Err(err) => {
                self.errors.push(err);
                self.synchronize();
                false
            }
        }
    }

    /// Skip forward to a likely statement boundary after an error.
    fn synchronize(&mut self) {
        while !self.check(&TokenKind::Eof) {
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Var
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::RightBrace => return,
                _ => self.advance(),
            }
        }
    }

    fn declaration(&mut self) -> CompileResult<bool> {
        if self.match_token(&TokenKind::Class) {
            self.class_declaration()?;
            Ok(false)
        } else if self.match_token(&TokenKind::Var) {
            self.var_declaration()?;
            Ok(false)
        } else {
            self.statement()
        }
    }

    /// Compile one statement. Returns whether it left a value on the stack
    /// (only expression statements do).
    fn statement(&mut self) -> CompileResult<bool> {
        if self.match_token(&TokenKind::If) {
            self.if_statement()?;
            Ok(false)
        } else if self.match_token(&TokenKind::While) {
            self.while_statement()?;
            Ok(false)
        } else if self.match_token(&TokenKind::Return) {
            self.return_statement()?;
            Ok(false)
        } else if self.match_token(&TokenKind::LeftBrace) {
            self.block_statement()?;
            Ok(false)
        } else {
            self.expression()?;
            Ok(true)
        }
    }

    /// Compile a statement used as a branch or loop body, discarding any
    /// expression value so the stack stays balanced.
    fn statement_discarding(&mut self) -> CompileResult<()> {
        if self.statement()? {
            self.emit_op(OpCode::Pop);
        }
        Ok(())
    }

    fn var_declaration(&mut self) -> CompileResult<()> {
        let name = self.consume_identifier("Expected variable name")?;

        if self.is_global_scope() {
            // Declare before the initializer so functions can close over a
            // recursive definition through its global slot.
            if self.vm.global_names.lookup(&name).is_some() {
                return Err(self.error(format!("Variable '{}' is already defined", name)));
            }
            let slot = self.vm.global_names.ensure(&name);
            if self.match_token(&TokenKind::Equal) {
                self.expression()?;
            } else {
                self.emit_op(OpCode::Nil);
            }
            self.emit_op(OpCode::StoreGlobal);
            self.emit_u16(slot);
            self.emit_op(OpCode::Pop);
        } else {
            self.declare_local(&name)?;
            if self.match_token(&TokenKind::Equal) {
                self.expression()?;
            } else {
                self.emit_op(OpCode::Nil);
            }
            // The initializer's value stays on the stack as the local's slot.
            self.mark_initialized();
        }
        Ok(())
    }

    fn if_statement(&mut self) -> CompileResult<()> {
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'if'")?;
        self.expression()?;
        self.consume(&TokenKind::RightParen, "Expected ')' after condition")?;

        let then_jump = self.emit_jump(OpCode::JumpIf);
        self.statement_discarding()?;

        if self.match_token(&TokenKind::Else) {
            let else_jump = self.emit_jump(OpCode::Jump);
            self.patch_jump(then_jump);
            self.statement_discarding()?;
            self.patch_jump(else_jump);
        } else {
            self.patch_jump(then_jump);
        }
        Ok(())
    }

    fn while_statement(&mut self) -> CompileResult<()> {
        let loop_start = self.current_offset();
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'while'")?;
        self.expression()?;
        self.consume(&TokenKind::RightParen, "Expected ')' after condition")?;

        let exit_jump = self.emit_jump(OpCode::JumpIf);
        self.statement_discarding()?;
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        Ok(())
    }

    fn return_statement(&mut self) -> CompileResult<()> {
        match self.current_fn().fn_type {
            FunctionType::Script => {
                return Err(self.error("Cannot return from top-level code"));
            }
            FunctionType::Constructor => {
                // A constructor always returns its instance; a bare return
                // is allowed as an early exit.
                if !self.check(&TokenKind::RightBrace) {
                    return Err(self.error("Cannot return a value from a constructor"));
                }
                self.emit_op(OpCode::LoadLocal);
                self.emit_byte(0);
            }
            _ => {
                if self.check(&TokenKind::RightBrace) {
                    self.emit_op(OpCode::Nil);
                } else {
                    self.expression()?;
                }
            }
        }
        self.emit_op(OpCode::End);
        Ok(())
    }

    fn block_statement(&mut self) -> CompileResult<()> {
        self.begin_scope();
        let left_value = self.compile_body(&TokenKind::RightBrace);
        if left_value {
            self.emit_op(OpCode::Pop);
        }
        self.consume(&TokenKind::RightBrace, "Expected '}' after block")?;
        self.end_scope();
        Ok(())
    }

    // ========== Classes ==========

    fn class_declaration(&mut self) -> CompileResult<()> {
        let name = self.consume_identifier("Expected class name")?;

        let global_slot = if self.is_global_scope() {
            if self.vm.global_names.lookup(&name).is_some() {
                return Err(self.error(format!("Variable '{}' is already defined", name)));
            }
            Some(self.vm.global_names.ensure(&name))
        } else {
            None
        };

        let name_value = self.vm.make_string(&name);
        self.emit_constant(name_value);

        let has_superclass = self.match_token(&TokenKind::Is);
        if has_superclass {
            // The superclass is an arbitrary expression, evaluated at class
            // definition time.
            self.parse_precedence(Precedence::Call)?;
        }

        self.emit_op(if has_superclass {
            OpCode::Subclass
        } else {
            OpCode::Class
        });
        let fields_offset = self.current_offset();
        self.emit_byte(0xff);

        if global_slot.is_none() {
            // The class value on the stack is the local's slot; declare it
            // before methods so they can refer to the class by name.
            self.declare_local(&name)?;
            self.mark_initialized();
        }

        self.classes.push(ClassCompiler {
            name,
            fields: Vec::new(),
        });

        self.consume(&TokenKind::LeftBrace, "Expected '{' before class body")?;
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            self.method()?;
        }
        self.consume(&TokenKind::RightBrace, "Expected '}' after class body")?;

        let class = self.classes.pop().expect("class compiler missing");
        if class.fields.len() > u8::MAX as usize {
            return Err(self.error("Too many fields in class"));
        }
        let num_fields = class.fields.len() as u8;
        self.current_fn_mut()
            .chunk
            .patch_byte(fields_offset, num_fields);

        if let Some(slot) = global_slot {
            self.emit_op(OpCode::StoreGlobal);
            self.emit_u16(slot);
            self.emit_op(OpCode::Pop);
        }
        Ok(())
    }

    fn method(&mut self) -> CompileResult<()> {
        let is_static = self.match_token(&TokenKind::Static);
        let (sig, params) = self.method_signature()?;

        let is_constructor = !is_static && sig.parts[0].name == "new";
        let fn_type = if is_constructor {
            FunctionType::Constructor
        } else if is_static {
            FunctionType::StaticMethod
        } else {
            FunctionType::Method
        };

        let class_name = self
            .classes
            .last()
            .map(|c| c.name.clone())
            .unwrap_or_default();
        let method_name = format!("{}.{}", class_name, sig.symbol_name());

        self.function_body(method_name.clone(), fn_type, &params)?;

        let symbol = self.vm.method_names.ensure(&sig.symbol_name());
        if is_static {
            self.emit_op(OpCode::StaticMethod);
            self.emit_u16(symbol);
        } else {
            self.emit_op(OpCode::Method);
            self.emit_u16(symbol);
        }

        if is_constructor {
            self.emit_constructor_wrapper(&sig, symbol, method_name)?;
        }
        Ok(())
    }

    /// Synthesize the metaclass method backing `Klass.new(...)`: construct a
    /// fresh instance into the receiver slot, forward the arguments to the
    /// initializer bound on the instance side, and return its result (the
    /// initializer itself returns `this`).
    fn emit_constructor_wrapper(
        &mut self,
        sig: &Signature,
        symbol: u16,
        name: String,
    ) -> CompileResult<()> {
        let line = self.line();
        let arity = sig.arity();

        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Construct, line);
        for slot in 0..=arity {
            chunk.write_op(OpCode::LoadLocal, line);
            chunk.write_byte(slot, line);
        }
        chunk.write_op(OpCode::call(arity as usize), line);
        chunk.write_u16(symbol, line);
        chunk.write_op(OpCode::End, line);

        let wrapper = self.vm.heap.allocate(ObjKind::Fn(FnObj {
            name,
            arity,
            upvalue_count: 0,
            chunk,
        }));
        let constant = self.make_constant(Value::Obj(wrapper));
        self.emit_op(OpCode::Closure);
        self.emit_u16(constant);
        self.emit_op(OpCode::StaticMethod);
        self.emit_u16(symbol);
        Ok(())
    }

    /// Parse a method signature and its parameter names.
    ///
    /// Supported shapes: getters (`count`), methods with parameters
    /// (`add(x)`), mixed-fix continuations (`ifTrue(f) else(g)`), setters
    /// (`width=(w)`), operators (`+(other)`, unary `-`), and subscripts
    /// (`[index]`, `[index]=(value)`).
    fn method_signature(&mut self) -> CompileResult<(Signature, Vec<String>)> {
        let mut params = Vec::new();

        if let TokenKind::Identifier(name) = self.current.kind.clone() {
            self.advance();
            if self.match_token(&TokenKind::Equal) {
                self.consume(&TokenKind::LeftParen, "Expected '(' after setter name")?;
                let count = self.parameter_list(&mut params)?;
                if count != 1 {
                    return Err(self.error("A setter takes exactly one parameter"));
                }
                return Ok((Signature::setter(name), params));
            }
            if self.match_token(&TokenKind::LeftParen) {
                let mut sig = Signature::part(name, self.parameter_list(&mut params)?);
                while self.match_token(&TokenKind::Else) {
                    self.consume(&TokenKind::LeftParen, "Expected '(' after 'else'")?;
                    let count = self.parameter_list(&mut params)?;
                    sig.add_part("else", count);
                }
                return Ok((sig, params));
            }
            return Ok((Signature::getter(name), params));
        }

        if self.check(&TokenKind::LeftBracket) {
            self.advance();
            let count = self.subscript_parameter_list(&mut params)?;
            if self.match_token(&TokenKind::Equal) {
                self.consume(&TokenKind::LeftParen, "Expected '(' after '='")?;
                let value_count = self.parameter_list(&mut params)?;
                if value_count != 1 {
                    return Err(self.error("A subscript setter takes exactly one value parameter"));
                }
                return Ok((Signature::subscript_setter(count), params));
            }
            return Ok((Signature::subscript(count), params));
        }

        if let Some(op_name) = self.current.kind.operator_name() {
            let op_name = op_name.to_string();
            self.advance();
            if self.match_token(&TokenKind::LeftParen) {
                let count = self.parameter_list(&mut params)?;
                return Ok((Signature::part(op_name, count), params));
            }
            // No parameter list: a unary operator.
            return Ok((Signature::getter(op_name), params));
        }

        Err(self.error_at_current("Expected method name"))
    }

    /// Parse `name, name, ...)` collecting parameter names. The opening
    /// paren is already consumed.
    fn parameter_list(&mut self, params: &mut Vec<String>) -> CompileResult<u8> {
        let mut count: usize = 0;
        if !self.check(&TokenKind::RightParen) {
            loop {
                params.push(self.consume_identifier("Expected parameter name")?);
                count += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "Expected ')' after parameters")?;
        if params.len() > MAX_CALL_ARGS {
            return Err(self.error(format!(
                "Cannot have more than {} parameters",
                MAX_CALL_ARGS
            )));
        }
        Ok(count as u8)
    }

    fn subscript_parameter_list(&mut self, params: &mut Vec<String>) -> CompileResult<u8> {
        let mut count: usize = 0;
        loop {
            params.push(self.consume_identifier("Expected parameter name")?);
            count += 1;
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&TokenKind::RightBracket, "Expected ']' after parameters")?;
        Ok(count as u8)
    }

    // ========== Functions ==========

    /// Compile a `{ body }` into a new function object and emit the closure
    /// capture sequence for it in the enclosing function.
    fn function_body(
        &mut self,
        name: String,
        fn_type: FunctionType,
        params: &[String],
    ) -> CompileResult<()> {
        if params.len() > MAX_CALL_ARGS {
            return Err(self.error(format!(
                "Cannot have more than {} parameters",
                MAX_CALL_ARGS
            )));
        }
        self.compilers
            .push(FunctionCompiler::new(name, fn_type, params.len() as u8));
        for param in params {
            self.declare_local(param)?;
            self.mark_initialized();
        }

        self.consume(&TokenKind::LeftBrace, "Expected '{' before body")?;
        let left_value = self.compile_body(&TokenKind::RightBrace);
        self.consume(&TokenKind::RightBrace, "Expected '}' after body")?;

        match self.current_fn().fn_type {
            FunctionType::Constructor => {
                if left_value {
                    self.emit_op(OpCode::Pop);
                }
                self.emit_op(OpCode::LoadLocal);
                self.emit_byte(0);
            }
            _ => {
                if !left_value {
                    self.emit_op(OpCode::Nil);
                }
            }
        }
        self.emit_op(OpCode::End);

        let finished = self.compilers.pop().expect("function compiler missing");
        let upvalues = finished.upvalues.clone();
        let function = self.vm.heap.allocate(ObjKind::Fn(FnObj {
            name: finished.name,
            arity: finished.arity,
            upvalue_count: upvalues.len(),
            chunk: finished.chunk,
        }));

        let constant = self.make_constant(Value::Obj(function));
        self.emit_op(OpCode::Closure);
        self.emit_u16(constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
        Ok(())
    }

    // ========== Expressions ==========

    fn expression(&mut self) -> CompileResult<()> {
        self.parse_precedence(Precedence::Lowest)
    }

    /// The operator-precedence loop: consume a token, run its prefix action,
    /// then keep consuming tokens whose infix precedence meets the minimum.
    fn parse_precedence(&mut self, precedence: Precedence) -> CompileResult<()> {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        self.prefix(can_assign)?;

        while precedence <= get_precedence(&self.current.kind) {
            self.advance();
            self.infix(can_assign)?;
        }

        if can_assign && self.match_token(&TokenKind::Equal) {
            return Err(self.error("Invalid assignment target"));
        }
        Ok(())
    }

    fn prefix(&mut self, can_assign: bool) -> CompileResult<()> {
        match self.previous.kind.clone() {
            TokenKind::NumLiteral(n) => {
                self.emit_constant(Value::Num(n));
                Ok(())
            }
            TokenKind::StringLiteral(s) => {
                let value = self.vm.make_string(s);
                self.emit_constant(value);
                Ok(())
            }
            TokenKind::True => {
                self.emit_op(OpCode::True);
                Ok(())
            }
            TokenKind::False => {
                self.emit_op(OpCode::False);
                Ok(())
            }
            TokenKind::Nil => {
                self.emit_op(OpCode::Nil);
                Ok(())
            }
            TokenKind::Identifier(name) => self.named_variable(&name, can_assign),
            TokenKind::Field(name) => self.field_access(&name, can_assign),
            TokenKind::StaticField(_) => Err(self.error("Static fields are not supported")),
            TokenKind::This => self.this_expression(),
            TokenKind::Super => Err(self.error("Superclass method calls are not supported")),
            TokenKind::LeftParen => {
                self.expression()?;
                self.consume(&TokenKind::RightParen, "Expected ')' after expression")
            }
            TokenKind::LeftBracket => self.list_literal(),
            TokenKind::LeftBrace => self.map_literal(),
            TokenKind::Minus => self.unary("-"),
            TokenKind::Bang => self.unary("!"),
            TokenKind::Fn | TokenKind::Fun => self.fn_literal(),
            kind => Err(self.error(format!("Expected expression, found '{}'", kind))),
        }
    }

    fn infix(&mut self, can_assign: bool) -> CompileResult<()> {
        match self.previous.kind.clone() {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::Percent
            | TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::EqualEqual
            | TokenKind::BangEqual
            | TokenKind::Pipe
            | TokenKind::Amp
            | TokenKind::DotDot
            | TokenKind::DotDotDot => self.binary(),
            TokenKind::AmpAmp => self.and_expression(),
            TokenKind::PipePipe => self.or_expression(),
            TokenKind::Is => self.is_expression(),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::LeftParen => self.value_call(),
            TokenKind::LeftBracket => self.subscript(can_assign),
            kind => Err(self.error(format!("'{}' cannot be used as an operator", kind))),
        }
    }

    /// An infix operator compiles to a one-argument method call on the left
    /// operand.
    fn binary(&mut self) -> CompileResult<()> {
        let op_kind = self.previous.kind.clone();
        let name = op_kind
            .operator_name()
            .ok_or_else(|| self.error("Unknown operator"))?;
        let precedence = get_precedence(&op_kind);
        self.parse_precedence(precedence.next())?;
        self.emit_call(&Signature::part(name, 1))
    }

    /// A unary operator compiles to a zero-argument method call.
    fn unary(&mut self, name: &str) -> CompileResult<()> {
        self.parse_precedence(Precedence::Unary)?;
        self.emit_call(&Signature::getter(name))
    }

    fn and_expression(&mut self) -> CompileResult<()> {
        let end_jump = self.emit_jump(OpCode::And);
        self.parse_precedence(Precedence::And.next())?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn or_expression(&mut self) -> CompileResult<()> {
        let end_jump = self.emit_jump(OpCode::Or);
        self.parse_precedence(Precedence::Or.next())?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn is_expression(&mut self) -> CompileResult<()> {
        self.parse_precedence(Precedence::Is.next())?;
        self.emit_op(OpCode::Is);
        Ok(())
    }

    /// `.name`, `.name(args)`, `.name(args) else(args)`, `.name = value`.
    fn dot(&mut self, can_assign: bool) -> CompileResult<()> {
        let name = self.consume_identifier("Expected method name after '.'")?;

        if can_assign && self.match_token(&TokenKind::Equal) {
            self.expression()?;
            return self.emit_call(&Signature::setter(name));
        }

        if self.match_token(&TokenKind::LeftParen) {
            let mut sig = Signature::part(name, self.argument_list()?);
            while self.match_token(&TokenKind::Else) {
                self.consume(&TokenKind::LeftParen, "Expected '(' after 'else'")?;
                let count = self.argument_list()?;
                sig.add_part("else", count);
            }
            if sig.arity() as usize > MAX_CALL_ARGS {
                return Err(self.error(format!(
                    "Cannot pass more than {} arguments",
                    MAX_CALL_ARGS
                )));
            }
            return self.emit_call(&sig);
        }

        self.emit_call(&Signature::getter(name))
    }

    /// `callee(args)` dispatches the `call` method on the callee, so
    /// anything with a `call` method is callable.
    fn value_call(&mut self) -> CompileResult<()> {
        let count = self.argument_list()?;
        self.emit_call(&Signature::part("call", count))
    }

    /// `receiver[args]` and `receiver[args] = value`.
    fn subscript(&mut self, can_assign: bool) -> CompileResult<()> {
        let mut count: usize = 0;
        loop {
            self.expression()?;
            count += 1;
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&TokenKind::RightBracket, "Expected ']' after subscript")?;
        if count >= MAX_CALL_ARGS {
            return Err(self.error(format!(
                "Cannot pass more than {} arguments",
                MAX_CALL_ARGS
            )));
        }

        if can_assign && self.match_token(&TokenKind::Equal) {
            self.expression()?;
            return self.emit_call(&Signature::subscript_setter(count as u8));
        }
        self.emit_call(&Signature::subscript(count as u8))
    }

    /// Parse `expr, expr, ...)`. The opening paren is already consumed.
    fn argument_list(&mut self) -> CompileResult<u8> {
        let mut count: usize = 0;
        if !self.check(&TokenKind::RightParen) {
            loop {
                self.expression()?;
                count += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "Expected ')' after arguments")?;
        if count > MAX_CALL_ARGS {
            return Err(self.error(format!(
                "Cannot pass more than {} arguments",
                MAX_CALL_ARGS
            )));
        }
        Ok(count as u8)
    }

    fn list_literal(&mut self) -> CompileResult<()> {
        let mut count: usize = 0;
        if !self.check(&TokenKind::RightBracket) {
            loop {
                if self.check(&TokenKind::RightBracket) {
                    break;
                }
                self.expression()?;
                count += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightBracket, "Expected ']' after list elements")?;
        if count > u8::MAX as usize {
            return Err(self.error("Too many elements in list literal"));
        }
        self.emit_op(OpCode::BuildList);
        self.emit_byte(count as u8);
        Ok(())
    }

    fn map_literal(&mut self) -> CompileResult<()> {
        let mut count: usize = 0;
        if !self.check(&TokenKind::RightBrace) {
            loop {
                if self.check(&TokenKind::RightBrace) {
                    break;
                }
                self.expression()?;
                self.consume(&TokenKind::Colon, "Expected ':' after map key")?;
                self.expression()?;
                count += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightBrace, "Expected '}' after map entries")?;
        if count > u8::MAX as usize {
            return Err(self.error("Too many entries in map literal"));
        }
        self.emit_op(OpCode::BuildMap);
        self.emit_byte(count as u8);
        Ok(())
    }

    fn fn_literal(&mut self) -> CompileResult<()> {
        let mut params = Vec::new();
        if self.match_token(&TokenKind::LeftParen) {
            self.parameter_list(&mut params)?;
        }
        self.function_body("<fn>".to_string(), FunctionType::Function, &params)
    }

    fn this_expression(&mut self) -> CompileResult<()> {
        match self.current_fn().fn_type {
            FunctionType::Method | FunctionType::StaticMethod | FunctionType::Constructor => {
                self.emit_op(OpCode::LoadLocal);
                self.emit_byte(0);
                Ok(())
            }
            _ => Err(self.error("Cannot use 'this' outside of a method")),
        }
    }

    /// `_name` reads or writes an instance field of the receiver. Fields are
    /// only addressable directly inside a method body.
    fn field_access(&mut self, name: &str, can_assign: bool) -> CompileResult<()> {
        if self.classes.is_empty() {
            return Err(self.error("Cannot use a field outside of a class"));
        }
        match self.current_fn().fn_type {
            FunctionType::Method | FunctionType::Constructor => {}
            FunctionType::StaticMethod => {
                return Err(self.error("Cannot use an instance field in a static method"));
            }
            _ => {
                return Err(self.error("Cannot use a field outside of a method"));
            }
        }

        let index = self.field_index(name)?;
        if can_assign && self.match_token(&TokenKind::Equal) {
            self.expression()?;
            self.emit_op(OpCode::StoreField);
            self.emit_byte(index);
        } else {
            self.emit_op(OpCode::LoadField);
            self.emit_byte(index);
        }
        Ok(())
    }

    fn field_index(&mut self, name: &str) -> CompileResult<u8> {
        if let Some(index) = self
            .classes
            .last()
            .and_then(|class| class.fields.iter().position(|f| f == name))
        {
            return Ok(index as u8);
        }
        let full = self
            .classes
            .last()
            .map(|class| class.fields.len() >= u8::MAX as usize)
            .unwrap_or(false);
        if full {
            return Err(self.error("Too many fields in class"));
        }
        let class = self.classes.last_mut().expect("field outside class");
        class.fields.push(name.to_string());
        Ok((class.fields.len() - 1) as u8)
    }

    // ========== Variables & scopes ==========

    fn named_variable(&mut self, name: &str, can_assign: bool) -> CompileResult<()> {
        let top = self.compilers.len() - 1;

        if let Some(slot) = self.resolve_local(top, name)? {
            if can_assign && self.match_token(&TokenKind::Equal) {
                self.expression()?;
                self.emit_op(OpCode::StoreLocal);
            } else {
                self.emit_op(OpCode::LoadLocal);
            }
            self.emit_byte(slot);
            return Ok(());
        }

        if let Some(index) = self.resolve_upvalue(top, name)? {
            if can_assign && self.match_token(&TokenKind::Equal) {
                self.expression()?;
                self.emit_op(OpCode::StoreUpvalue);
            } else {
                self.emit_op(OpCode::LoadUpvalue);
            }
            self.emit_byte(index);
            return Ok(());
        }

        if let Some(slot) = self.vm.global_names.lookup(name) {
            if can_assign && self.match_token(&TokenKind::Equal) {
                self.expression()?;
                self.emit_op(OpCode::StoreGlobal);
            } else {
                self.emit_op(OpCode::LoadGlobal);
            }
            self.emit_u16(slot);
            return Ok(());
        }

        Err(self.error(format!("Undefined variable '{}'", name)))
    }

    fn resolve_local(&self, compiler: usize, name: &str) -> CompileResult<Option<u8>> {
        let fc = &self.compilers[compiler];
        for (index, local) in fc.locals.iter().enumerate().rev() {
            if local.name == name {
                if !local.initialized {
                    return Err(
                        self.error("Cannot read a local variable in its own initializer")
                    );
                }
                return Ok(Some(index as u8));
            }
        }
        Ok(None)
    }

    /// Search enclosing compilers for a variable and thread a capture chain
    /// down to the requesting one.
    fn resolve_upvalue(&mut self, compiler: usize, name: &str) -> CompileResult<Option<u8>> {
        if compiler == 0 {
            return Ok(None);
        }
        let parent = compiler - 1;

        if let Some(local) = self.resolve_local(parent, name)? {
            self.compilers[parent].locals[local as usize].is_captured = true;
            return Ok(Some(self.add_upvalue(compiler, local, true)?));
        }

        if let Some(upvalue) = self.resolve_upvalue(parent, name)? {
            return Ok(Some(self.add_upvalue(compiler, upvalue, false)?));
        }

        Ok(None)
    }

    fn add_upvalue(&mut self, compiler: usize, index: u8, is_local: bool) -> CompileResult<u8> {
        let descriptor = UpvalueDescriptor { is_local, index };
        if let Some(existing) = self.compilers[compiler]
            .upvalues
            .iter()
            .position(|u| *u == descriptor)
        {
            return Ok(existing as u8);
        }
        if self.compilers[compiler].upvalues.len() >= MAX_UPVALUES {
            return Err(self.error("Too many captured variables in function"));
        }
        self.compilers[compiler].upvalues.push(descriptor);
        Ok((self.compilers[compiler].upvalues.len() - 1) as u8)
    }

    fn is_global_scope(&self) -> bool {
        self.compilers.len() == 1 && self.current_fn().scope_depth == 1
    }

    fn declare_local(&mut self, name: &str) -> CompileResult<()> {
        let depth = self.current_fn().scope_depth;
        let fc = self.current_fn();
        if fc.locals.len() >= MAX_LOCALS {
            return Err(self.error("Too many local variables in function"));
        }
        for local in fc.locals.iter().rev() {
            if local.depth < depth {
                break;
            }
            if local.name == name {
                return Err(
                    self.error(format!("Variable '{}' is already declared in this scope", name))
                );
            }
        }
        self.current_fn_mut().locals.push(Local {
            name: name.to_string(),
            depth,
            is_captured: false,
            initialized: false,
        });
        Ok(())
    }

    fn mark_initialized(&mut self) {
        if let Some(local) = self.current_fn_mut().locals.last_mut() {
            local.initialized = true;
        }
    }

    fn begin_scope(&mut self) {
        self.current_fn_mut().scope_depth += 1;
    }

    /// Pop the scope's locals, closing any that were captured so closures
    /// keep seeing them after the slots die.
    fn end_scope(&mut self) {
        self.current_fn_mut().scope_depth -= 1;
        loop {
            let fc = self.current_fn();
            let Some(local) = fc.locals.last() else { break };
            if local.depth <= fc.scope_depth {
                break;
            }
            let captured = local.is_captured;
            self.current_fn_mut().locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    // ========== Emission ==========

    fn emit_call(&mut self, sig: &Signature) -> CompileResult<()> {
        let arity = sig.arity() as usize;
        if arity > MAX_CALL_ARGS {
            return Err(self.error(format!(
                "Cannot pass more than {} arguments",
                MAX_CALL_ARGS
            )));
        }
        let symbol = self.vm.method_names.ensure(&sig.symbol_name());
        self.emit_op(OpCode::call(arity));
        self.emit_u16(symbol);
        Ok(())
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.current_fn_mut().chunk.write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.current_fn_mut().chunk.write_byte(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.line();
        self.current_fn_mut().chunk.write_u16(value, line);
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_u16(constant);
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        self.current_fn_mut().chunk.add_constant(value)
    }

    /// Emit a jump with a placeholder offset; returns the offset to patch.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let offset = self.current_offset();
        self.emit_u16(0xffff);
        offset
    }

    fn patch_jump(&mut self, offset: usize) {
        self.current_fn_mut().chunk.patch_jump(offset);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        // Distance back from just past this operand to the loop start.
        let distance = self.current_offset() - loop_start + 2;
        assert!(distance < u16::MAX as usize, "Loop body too large");
        self.emit_u16(distance as u16);
    }

    fn current_offset(&self) -> usize {
        self.current_fn().chunk.current_offset()
    }

    // ========== Token plumbing ==========

    /// Move to the next token, reporting any error tokens the scanner
    /// produced along the way.
    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, Token::eof(0, 0, 0));
        loop {
            let token = self.scanner.next_token();
            if let TokenKind::Error(message) = &token.kind {
                self.errors.push(CompileError::new(
                    self.module.clone(),
                    token.line(),
                    message.clone(),
                ));
                continue;
            }
            self.current = token;
            break;
        }
    }

    /// Compare token kinds by shape, ignoring payloads, so one Identifier
    /// pattern matches any identifier.
    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> CompileResult<()> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error_at_current(message))
        }
    }

    fn consume_identifier(&mut self, message: &str) -> CompileResult<String> {
        if let TokenKind::Identifier(name) = self.current.kind.clone() {
            self.advance();
            Ok(name)
        } else {
            Err(self.error_at_current(message))
        }
    }

    fn current_fn(&self) -> &FunctionCompiler {
        self.compilers.last().expect("no active function compiler")
    }

    fn current_fn_mut(&mut self) -> &mut FunctionCompiler {
        self.compilers
            .last_mut()
            .expect("no active function compiler")
    }

    fn line(&self) -> usize {
        self.previous.line()
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::new(self.module.clone(), self.previous.line(), message)
    }

    fn error_at_current(&self, message: impl Into<String>) -> CompileError {
        CompileError::new(
            self.module.clone(),
            self.current.line(),
            format!("{}, found '{}'", message.into(), self.current.kind),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_source(source: &str) -> Result<(), Diagnostics> {
        let mut vm = Vm::new();
        compile(&mut vm, "test", source).map(|_| ())
    }

    #[test]
    fn test_literal_expression_compiles() {
        assert!(compile_source("1 + 2").is_ok());
    }

    #[test]
    fn test_undefined_variable_is_diagnosed() {
        let err = compile_source("missing").unwrap_err();
        assert!(err.to_string().contains("Undefined variable 'missing'"));
    }

    #[test]
    fn test_duplicate_global_is_diagnosed() {
        let err = compile_source("var a = 1 var a = 2").unwrap_err();
        assert!(err.to_string().contains("already defined"));
    }

    #[test]
    fn test_errors_accumulate() {
        // Both statements are bad; both should be reported.
        let err = compile_source("var x = missing1 var y = missing2").unwrap_err();
        assert_eq!(err.len(), 2);
    }

    #[test]
    fn test_field_outside_class_is_diagnosed() {
        let err = compile_source("_n = 1").unwrap_err();
        assert!(err.to_string().contains("field"));
    }

    #[test]
    fn test_static_field_is_rejected() {
        let err = compile_source("class A { m() { __x } }").unwrap_err();
        assert!(err.to_string().contains("Static fields"));
    }

    #[test]
    fn test_mixed_fix_signature_mangling() {
        let mut vm = Vm::new();
        let source = "class A { foo(a, b) else(c) { nil } }";
        compile(&mut vm, "test", source).unwrap();
        assert!(vm.method_names.lookup("foo  else ").is_some());
    }

    #[test]
    fn test_setter_and_operator_signatures() {
        let mut vm = Vm::new();
        let source = "class V { width=(w) { _w = w } +(other) { 0 } [i] { nil } [i]=(v) { nil } }";
        compile(&mut vm, "test", source).unwrap();
        assert!(vm.method_names.lookup("width= ").is_some());
        assert!(vm.method_names.lookup("+ ").is_some());
        assert!(vm.method_names.lookup("[ ").is_some());
        assert!(vm.method_names.lookup("[=  ").is_some());
    }

    #[test]
    fn test_counter_scenario_compiles() {
        let source = "class Counter { new() { _n = 0 } inc() { _n = _n + 1 } get() { _n } } \
                      var c = Counter.new() c.inc() c.inc() c.get()";
        assert!(compile_source(source).is_ok());
    }

    #[test]
    fn test_return_from_top_level_is_diagnosed() {
        let err = compile_source("return 1").unwrap_err();
        assert!(err.to_string().contains("top-level"));
    }

    #[test]
    fn test_constructor_cannot_return_value() {
        let err = compile_source("class A { new() { return 1 } }").unwrap_err();
        assert!(err.to_string().contains("constructor"));
    }

    #[test]
    fn test_lexer_errors_surface_as_diagnostics() {
        let err = compile_source("var x = \"unterminated").unwrap_err();
        assert!(err.to_string().contains("Unterminated string"));
    }

    #[test]
    fn test_local_self_read_is_diagnosed() {
        let err = compile_source("fn { var a = a }").unwrap_err();
        assert!(err.to_string().contains("own initializer"));
    }
}
