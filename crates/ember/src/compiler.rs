//! The single-pass compiler: tokens to bytecode, no AST.
//!
//! A Pratt parser drives code generation directly. Lexical scope is resolved
//! while parsing: locals live in fixed per-function slot arrays, upvalues
//! close over enclosing compiler records, and anything unresolved is a
//! global referenced by name constant.
//!
//! Parse errors set panic mode, which throttles cascading diagnostics until
//! `synchronize` reaches a statement boundary. If anything was reported the
//! compile produces no function.

use crate::{
    bytecode::{Chunk, Opcode, disassemble},
    error::{CompileError, CompileErrors},
    heap::HeapId,
    object::{Function, ObjData},
    scanner::{Scanner, Token, TokenKind},
    value::Value,
    vm::Vm,
};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_CASES: usize = 256;
/// Sentinel constant index meaning "no catch clause" on PushHandler.
pub(crate) const HANDLER_NO_CATCH: u8 = u8::MAX;
/// Sentinel offset meaning "no finally block" on PushHandler.
pub(crate) const HANDLER_NO_FINALLY: u16 = u16::MAX;

/// Compiles a script to its top-level function.
pub(crate) fn compile(vm: &mut Vm<'_>, source: &str) -> Result<HeapId, CompileErrors> {
    let mut parser = Parser::new(vm, source);
    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }
    let (function, _) = parser.end_compiler();
    let had_error = parser.had_error;
    let errors = parser.errors;
    vm.compiler_roots.clear();
    if had_error {
        Err(CompileErrors { errors })
    } else {
        Ok(function)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call | Self::Primary => Self::Primary,
        }
    }
}

#[derive(Debug)]
struct Local {
    name: String,
    /// Scope depth, or -1 while declared but not yet initialized.
    depth: i32,
    is_captured: bool,
    mutable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CompilerUpvalue {
    index: u8,
    is_local: bool,
    mutable: bool,
}

/// Per-function compiler record; records chain through `enclosing`.
#[derive(Debug)]
struct Compiler {
    enclosing: Option<Box<Compiler>>,
    function: HeapId,
    kind: FunctionKind,
    is_async: bool,
    locals: Vec<Local>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
}

/// Per-class compiler record, for `this`/`super` validity checks.
#[derive(Debug)]
struct ClassCompiler {
    enclosing: Option<Box<ClassCompiler>>,
    has_superclass: bool,
    is_trait: bool,
}

struct ParseRule<'src, 'vm, 'out> {
    prefix: Option<fn(&mut Parser<'src, 'vm, 'out>, bool)>,
    infix: Option<fn(&mut Parser<'src, 'vm, 'out>, bool)>,
    precedence: Precedence,
}

struct Parser<'src, 'vm, 'out> {
    vm: &'vm mut Vm<'out>,
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    compiler: Box<Compiler>,
    class_compiler: Option<Box<ClassCompiler>>,
}

impl<'src, 'vm, 'out> Parser<'src, 'vm, 'out> {
    fn new(vm: &'vm mut Vm<'out>, source: &'src str) -> Self {
        let function = vm.allocate(
            ObjData::Function(Function {
                name: None,
                arity: 0,
                upvalue_count: 0,
                is_generator: false,
                is_async: false,
                chunk: Chunk::new(),
            }),
            None,
        );
        vm.compiler_roots.push(function);
        let compiler = Box::new(Compiler {
            enclosing: None,
            function,
            kind: FunctionKind::Script,
            is_async: false,
            locals: vec![Local {
                name: String::new(),
                depth: 0,
                is_captured: false,
                mutable: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        });
        let placeholder = Token { kind: TokenKind::Eof, lexeme: "", line: 1 };
        Self {
            vm,
            scanner: Scanner::new(source),
            previous: placeholder,
            current: placeholder,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            compiler,
            class_compiler: None,
        }
    }

    // === Token plumbing ===

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.vm.config.debug_token {
                tracing::trace!(
                    kind = ?self.current.kind,
                    lexeme = self.current.lexeme,
                    line = self.current.line,
                    "token"
                );
            }
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_owned();
            self.error_at_current(&message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // === Error reporting ===

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = match token.kind {
            TokenKind::Eof => "end".to_owned(),
            TokenKind::Error => String::new(),
            _ => token.lexeme.to_owned(),
        };
        self.errors.push(CompileError { line: token.line, at, message: message.to_owned() });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Trait
                | TokenKind::Namespace
                | TokenKind::Fun
                | TokenKind::Async
                | TokenKind::Var
                | TokenKind::Val
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Switch
                | TokenKind::Print
                | TokenKind::Throw
                | TokenKind::Try
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // === Emission ===

    fn chunk_mut(&mut self) -> &mut Chunk {
        let function = self.compiler.function;
        &mut self.vm.heap.function_mut(function).chunk
    }

    fn chunk_len(&self) -> usize {
        self.vm.heap.function(self.compiler.function).chunk.code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: Opcode) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, first: Opcode, second: Opcode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: Opcode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.chunk_mut().add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op_byte(Opcode::Constant, index);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let id = self.vm.intern_string(name);
        self.make_constant(Value::Obj(id))
    }

    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk_len() - offset - 2;
        if jump > usize::from(u16::MAX) {
            self.error("Too much code to jump over.");
        }
        let bytes = (jump as u16).to_be_bytes();
        let chunk = self.chunk_mut();
        chunk.code[offset] = bytes[0];
        chunk.code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Opcode::Loop);
        let offset = self.chunk_len() - loop_start + 2;
        if offset > usize::from(u16::MAX) {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    fn emit_return(&mut self) {
        if self.compiler.kind == FunctionKind::Initializer {
            self.emit_op_byte(Opcode::GetLocal, 0);
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.emit_op(Opcode::Return);
    }

    // === Compiler records ===

    fn init_compiler(&mut self, kind: FunctionKind, is_async: bool) {
        let name = if kind == FunctionKind::Script {
            None
        } else {
            Some(self.vm.intern_string(self.previous.lexeme))
        };
        if let Some(name) = name {
            self.vm.protect(Value::Obj(name));
        }
        let function = self.vm.allocate(
            ObjData::Function(Function {
                name,
                arity: 0,
                upvalue_count: 0,
                is_generator: false,
                is_async,
                chunk: Chunk::new(),
            }),
            None,
        );
        if name.is_some() {
            self.vm.unprotect();
        }
        self.vm.compiler_roots.push(function);

        let this_slot = matches!(kind, FunctionKind::Method | FunctionKind::Initializer);
        let slot_zero = Local {
            name: if this_slot { "this".to_owned() } else { String::new() },
            depth: 0,
            is_captured: false,
            mutable: false,
        };
        let fresh = Box::new(Compiler {
            enclosing: None,
            function,
            kind,
            is_async,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        });
        let enclosing = std::mem::replace(&mut self.compiler, fresh);
        self.compiler.enclosing = Some(enclosing);
    }

    fn end_compiler(&mut self) -> (HeapId, Vec<CompilerUpvalue>) {
        self.emit_return();
        let function = self.compiler.function;
        let upvalues = std::mem::take(&mut self.compiler.upvalues);
        self.vm.heap.function_mut(function).upvalue_count = upvalues.len() as u8;

        if self.vm.config.debug_print_code && !self.had_error {
            let f = self.vm.heap.function(function);
            let name = match f.name {
                Some(name) => self.vm.heap.string_value(name).to_owned(),
                None => "<script>".to_owned(),
            };
            let listing = disassemble(&self.vm.heap, &f.chunk, &name);
            tracing::debug!("\n{listing}");
        }

        self.vm.compiler_roots.pop();
        if let Some(enclosing) = self.compiler.enclosing.take() {
            self.compiler = enclosing;
        }
        (function, upvalues)
    }

    fn begin_scope(&mut self) {
        self.compiler.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.compiler.scope_depth -= 1;
        while let Some(local) = self.compiler.locals.last() {
            if local.depth <= self.compiler.scope_depth {
                break;
            }
            if local.is_captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
            self.compiler.locals.pop();
        }
    }

    // === Variable resolution ===

    fn add_local(&mut self, name: &str, mutable: bool) {
        if self.compiler.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.compiler.locals.push(Local {
            name: name.to_owned(),
            depth: -1,
            is_captured: false,
            mutable,
        });
    }

    fn declare_variable(&mut self, mutable: bool) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        for local in self.compiler.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.compiler.scope_depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
                break;
            }
        }
        self.add_local(name, mutable);
    }

    fn parse_variable(&mut self, message: &str, mutable: bool) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable(mutable);
        if self.compiler.scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.to_owned();
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        if let Some(local) = self.compiler.locals.last_mut() {
            local.depth = self.compiler.scope_depth;
        }
    }

    fn define_variable(&mut self, global: u8, mutable: bool) {
        if self.compiler.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        let op = if mutable { Opcode::DefineGlobal } else { Opcode::DefineGlobalVal };
        self.emit_op_byte(op, global);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        enum Resolved {
            Local(u8, bool),
            Upvalue(u8, bool),
            Global(u8),
        }

        let resolved = match resolve_local(&self.compiler, name.lexeme) {
            Err(message) => {
                self.error(message);
                return;
            }
            Ok(Some(slot)) => {
                let mutable = self.compiler.locals[usize::from(slot)].mutable;
                Resolved::Local(slot, mutable)
            }
            Ok(None) => match resolve_upvalue(&mut self.compiler, name.lexeme) {
                Err(message) => {
                    self.error(message);
                    return;
                }
                Ok(Some((index, mutable))) => Resolved::Upvalue(index, mutable),
                Ok(None) => {
                    let constant = self.identifier_constant(name.lexeme);
                    Resolved::Global(constant)
                }
            },
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            match resolved {
                Resolved::Local(_, false) | Resolved::Upvalue(_, false) => {
                    self.error(&format!("Cannot assign to val '{}'.", name.lexeme));
                    // Still compile the right-hand side to keep parsing sane.
                    self.expression();
                }
                Resolved::Local(slot, true) => {
                    self.expression();
                    self.emit_op_byte(Opcode::SetLocal, slot);
                }
                Resolved::Upvalue(index, true) => {
                    self.expression();
                    self.emit_op_byte(Opcode::SetUpvalue, index);
                }
                Resolved::Global(constant) => {
                    self.expression();
                    self.emit_op_byte(Opcode::SetGlobal, constant);
                }
            }
        } else {
            match resolved {
                Resolved::Local(slot, _) => self.emit_op_byte(Opcode::GetLocal, slot),
                Resolved::Upvalue(index, _) => self.emit_op_byte(Opcode::GetUpvalue, index),
                Resolved::Global(constant) => self.emit_op_byte(Opcode::GetGlobal, constant),
            }
        }
    }

    // === Expressions ===

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            let infix = Self::rule(self.previous.kind)
                .infix
                .expect("token with infix precedence must have an infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn rule(kind: TokenKind) -> ParseRule<'src, 'vm, 'out> {
        use TokenKind as T;
        let (prefix, infix, precedence): (
            Option<fn(&mut Self, bool)>,
            Option<fn(&mut Self, bool)>,
            Precedence,
        ) = match kind {
            T::LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            T::LeftBracket => (Some(Self::collection), Some(Self::subscript), Precedence::Call),
            T::Dot => (None, Some(Self::dot), Precedence::Call),
            T::Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            T::Plus => (None, Some(Self::binary), Precedence::Term),
            T::Slash | T::Star | T::Percent => (None, Some(Self::binary), Precedence::Factor),
            T::Bang => (Some(Self::unary), None, Precedence::None),
            T::BangEqual | T::EqualEqual => (None, Some(Self::binary), Precedence::Equality),
            T::Greater | T::GreaterEqual | T::Less | T::LessEqual => {
                (None, Some(Self::binary), Precedence::Comparison)
            }
            T::Identifier => (Some(Self::variable), None, Precedence::None),
            T::String => (Some(Self::string), None, Precedence::None),
            T::Interpolation => (Some(Self::interpolation), None, Precedence::None),
            T::Int => (Some(Self::integer), None, Precedence::None),
            T::Float => (Some(Self::float), None, Precedence::None),
            T::And => (None, Some(Self::and), Precedence::And),
            T::Or => (None, Some(Self::or), Precedence::Or),
            T::False | T::True | T::Nil => (Some(Self::literal), None, Precedence::None),
            T::Super => (Some(Self::super_), None, Precedence::None),
            T::This => (Some(Self::this), None, Precedence::None),
            T::Yield => (Some(Self::yield_), None, Precedence::None),
            T::Await => (Some(Self::await_), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
        ParseRule { prefix, infix, precedence }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(Opcode::Not),
            TokenKind::Minus => self.emit_op(Opcode::Negate),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let precedence = Self::rule(operator).precedence;
        self.parse_precedence(precedence.next());
        match operator {
            TokenKind::BangEqual => self.emit_ops(Opcode::Equal, Opcode::Not),
            TokenKind::EqualEqual => self.emit_op(Opcode::Equal),
            TokenKind::Greater => self.emit_op(Opcode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(Opcode::Less, Opcode::Not),
            TokenKind::Less => self.emit_op(Opcode::Less),
            TokenKind::LessEqual => self.emit_ops(Opcode::Greater, Opcode::Not),
            TokenKind::Plus => self.emit_op(Opcode::Add),
            TokenKind::Minus => self.emit_op(Opcode::Subtract),
            TokenKind::Star => self.emit_op(Opcode::Multiply),
            TokenKind::Slash => self.emit_op(Opcode::Divide),
            TokenKind::Percent => self.emit_op(Opcode::Modulo),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(Opcode::False),
            TokenKind::True => self.emit_op(Opcode::True),
            TokenKind::Nil => self.emit_op(Opcode::Nil),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn integer(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        if let Ok(value) = lexeme.parse::<i32>() {
            self.emit_constant(Value::Int(value));
        } else if let Ok(value) = lexeme.parse::<f64>() {
            // Out of i32 range: fall back to a float literal.
            self.emit_constant(Value::Float(value));
        } else {
            self.error("Invalid integer literal.");
        }
    }

    fn float(&mut self, _can_assign: bool) {
        match self.previous.lexeme.parse::<f64>() {
            Ok(value) => self.emit_constant(Value::Float(value)),
            Err(_) => self.error("Invalid float literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let text = unescape(self.previous.lexeme);
        let id = self.vm.intern_string(&text);
        self.emit_constant(Value::Obj(id));
    }

    /// An interpolated string compiles to left-folded concatenation:
    /// `"a ${x} b ${y}"` becomes `(("a " + x) + " b ") + y` plus the tail.
    fn interpolation(&mut self, _can_assign: bool) {
        let text = unescape(self.previous.lexeme);
        let id = self.vm.intern_string(&text);
        self.emit_constant(Value::Obj(id));
        loop {
            self.expression();
            self.emit_op(Opcode::Add);
            if self.match_token(TokenKind::Interpolation) {
                let text = unescape(self.previous.lexeme);
                let id = self.vm.intern_string(&text);
                self.emit_constant(Value::Obj(id));
                self.emit_op(Opcode::Add);
            } else {
                self.consume(TokenKind::String, "Expect end of string interpolation.");
                let text = unescape(self.previous.lexeme);
                if !text.is_empty() {
                    let id = self.vm.intern_string(&text);
                    self.emit_constant(Value::Obj(id));
                    self.emit_op(Opcode::Add);
                }
                break;
            }
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous;
        self.named_variable(name, can_assign);
    }

    fn this(&mut self, _can_assign: bool) {
        if self.class_compiler.is_none() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        let token = self.previous;
        self.named_variable(token, false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match &self.class_compiler {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a trait.");
            }
            Some(_) => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let method = self.previous.lexeme.to_owned();
        let name = self.identifier_constant(&method);

        self.named_variable(Token::synthetic("this"), false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op_byte(Opcode::SuperInvoke, name);
            self.emit_byte(argc);
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op_byte(Opcode::GetSuper, name);
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op_byte(Opcode::Call, argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.to_owned();
        let constant = self.identifier_constant(&name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(Opcode::SetProperty, constant);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op_byte(Opcode::Invoke, constant);
            self.emit_byte(argc);
        } else {
            self.emit_op_byte(Opcode::GetProperty, constant);
        }
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(Opcode::SetIndex);
        } else {
            self.emit_op(Opcode::GetIndex);
        }
    }

    /// `[a, b]` array literal, `["k": v]` dictionary literal, `[:]` empty
    /// dictionary.
    fn collection(&mut self, _can_assign: bool) {
        if self.match_token(TokenKind::Colon) {
            self.consume(TokenKind::RightBracket, "Expect ']' after ':' in empty dictionary.");
            self.emit_op_byte(Opcode::Dictionary, 0);
            return;
        }
        if self.match_token(TokenKind::RightBracket) {
            self.emit_op_byte(Opcode::Array, 0);
            return;
        }

        self.expression();
        if self.match_token(TokenKind::Colon) {
            // Dictionary literal: first value, then more pairs.
            self.expression();
            let mut count: usize = 1;
            while self.match_token(TokenKind::Comma) {
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' between dictionary key and value.");
                self.expression();
                count += 1;
            }
            self.consume(TokenKind::RightBracket, "Expect ']' after dictionary literal.");
            if count > usize::from(u8::MAX) {
                self.error("Can't have more than 255 entries in a dictionary literal.");
            }
            self.emit_op_byte(Opcode::Dictionary, count as u8);
        } else {
            let mut count: usize = 1;
            while self.match_token(TokenKind::Comma) {
                self.expression();
                count += 1;
            }
            self.consume(TokenKind::RightBracket, "Expect ']' after array literal.");
            if count > usize::from(u8::MAX) {
                self.error("Can't have more than 255 elements in an array literal.");
            }
            self.emit_op_byte(Opcode::Array, count as u8);
        }
    }

    fn yield_(&mut self, _can_assign: bool) {
        match self.compiler.kind {
            FunctionKind::Script => {
                self.error("Can't yield from top-level code.");
                return;
            }
            FunctionKind::Initializer => {
                self.error("Can't yield from an initializer.");
                return;
            }
            _ => {}
        }
        if self.compiler.is_async {
            self.error("Can't yield in an async function.");
            return;
        }
        let function = self.compiler.function;
        self.vm.heap.function_mut(function).is_generator = true;
        if self.check(TokenKind::Semicolon) || self.check(TokenKind::RightParen) {
            self.emit_op(Opcode::Nil);
        } else {
            self.parse_precedence(Precedence::Assignment);
        }
        self.emit_op(Opcode::Yield);
    }

    fn await_(&mut self, _can_assign: bool) {
        if !self.compiler.is_async {
            self.error("Can't await outside an async function.");
            return;
        }
        self.parse_precedence(Precedence::Unary);
        self.emit_op(Opcode::Await);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc.min(255) as u8
    }

    // === Declarations ===

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Trait) {
            self.trait_declaration();
        } else if self.match_token(TokenKind::Namespace) {
            self.namespace_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration(false);
        } else if self.match_token(TokenKind::Async) {
            self.consume(TokenKind::Fun, "Expect 'fun' after 'async'.");
            self.fun_declaration(true);
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(true);
        } else if self.match_token(TokenKind::Val) {
            self.var_declaration(false);
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, mutable: bool) {
        let global = self.parse_variable("Expect variable name.", mutable);
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global, mutable);
    }

    fn fun_declaration(&mut self, is_async: bool) {
        let global = self.parse_variable("Expect function name.", true);
        self.mark_initialized();
        self.function(FunctionKind::Function, is_async);
        self.define_variable(global, true);
    }

    fn function(&mut self, kind: FunctionKind, is_async: bool) {
        self.init_compiler(kind, is_async);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        let mut arity: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                if arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                arity += 1;
                let constant = self.parse_variable("Expect parameter name.", true);
                self.define_variable(constant, true);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        let function = self.compiler.function;
        self.vm.heap.function_mut(function).arity = arity.min(255) as u8;

        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op_byte(Opcode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        if class_name.lexeme == "Object" {
            self.error("Cannot redeclare root class Object.");
        }
        let name_constant = {
            let name = class_name.lexeme.to_owned();
            self.identifier_constant(&name)
        };
        self.declare_variable(true);
        self.emit_op_byte(Opcode::Class, name_constant);
        self.define_variable(name_constant, true);

        let enclosing_class = self.class_compiler.take();
        self.class_compiler = Some(Box::new(ClassCompiler {
            enclosing: enclosing_class,
            has_superclass: true,
            is_trait: false,
        }));

        self.begin_scope();
        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            if self.previous.lexeme == class_name.lexeme {
                self.error("A class can't inherit from itself.");
            }
            self.variable(false);
        } else {
            // Every class without an explicit superclass inherits Object.
            self.named_variable(Token::synthetic("Object"), false);
        }
        self.add_local("super", false);
        self.mark_initialized();

        self.named_variable(class_name, false);
        self.emit_op(Opcode::Inherit);

        if self.match_token(TokenKind::With) {
            self.named_variable(class_name, false);
            let count = self.trait_list();
            self.emit_op_byte(Opcode::ImplementTraits, count);
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(Opcode::Pop);
        self.end_scope();

        let class = self.class_compiler.take().expect("class compiler present");
        self.class_compiler = class.enclosing;
    }

    fn trait_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect trait name.");
        let trait_name = self.previous;
        let name_constant = {
            let name = trait_name.lexeme.to_owned();
            self.identifier_constant(&name)
        };
        self.declare_variable(true);
        self.emit_op_byte(Opcode::Trait, name_constant);
        self.define_variable(name_constant, true);

        let enclosing_class = self.class_compiler.take();
        self.class_compiler = Some(Box::new(ClassCompiler {
            enclosing: enclosing_class,
            has_superclass: false,
            is_trait: true,
        }));

        if self.match_token(TokenKind::With) {
            self.named_variable(trait_name, false);
            let count = self.trait_list();
            self.emit_op_byte(Opcode::ImplementTraits, count);
        }

        self.named_variable(trait_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before trait body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after trait body.");
        self.emit_op(Opcode::Pop);

        let class = self.class_compiler.take().expect("class compiler present");
        self.class_compiler = class.enclosing;
    }

    fn trait_list(&mut self) -> u8 {
        let mut count: usize = 0;
        loop {
            self.consume(TokenKind::Identifier, "Expect trait name after 'with'.");
            let name = self.previous;
            self.named_variable(name, false);
            count += 1;
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        if count > usize::from(u8::MAX) {
            self.error("Can't implement more than 255 traits.");
        }
        count.min(255) as u8
    }

    fn method(&mut self) {
        let is_static = self.match_token(TokenKind::Static);
        let is_async = self.match_token(TokenKind::Async);
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.to_owned();
        let constant = self.identifier_constant(&name);

        let is_initializer = name == "init" && !is_static;
        if is_initializer {
            let in_trait = self.class_compiler.as_ref().is_some_and(|c| c.is_trait);
            if in_trait {
                self.error("Traits may not declare initializers.");
            }
            if is_async {
                self.error("Initializers may not be async.");
            }
        }
        let kind = if is_initializer { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind, is_async);
        let op = if is_static { Opcode::StaticMethod } else { Opcode::Method };
        self.emit_op_byte(op, constant);
    }

    fn namespace_declaration(&mut self) {
        if self.compiler.kind != FunctionKind::Script || self.compiler.scope_depth > 0 {
            self.error("Namespaces may only be declared at top level.");
        }
        let mut depth: usize = 0;
        loop {
            self.consume(TokenKind::Identifier, "Expect namespace name.");
            let name = self.previous.lexeme.to_owned();
            let constant = self.identifier_constant(&name);
            self.emit_op_byte(Opcode::BeginNamespace, constant);
            depth += 1;
            if !self.match_token(TokenKind::Dot) {
                break;
            }
        }
        self.consume(TokenKind::LeftBrace, "Expect '{' after namespace name.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after namespace body.");
        for _ in 0..depth {
            self.emit_op(Opcode::EndNamespace);
        }
    }

    // === Statements ===

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Throw) {
            self.throw_statement();
        } else if self.match_token(TokenKind::Try) {
            self.try_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(Opcode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Opcode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.statement();
        let else_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(Opcode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(true);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit_op(Opcode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(Opcode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(Opcode::Pop);
        }
        self.end_scope();
    }

    /// Switch lowering: the subject stays on the stack, each case duplicates
    /// it and compares; matching consumes it and runs the case body, then
    /// jumps to the end. No fall-through.
    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after value.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch cases.");

        // 0: before any case, 1: in cases, 2: after default.
        let mut state = 0u8;
        let mut case_ends: Vec<usize> = Vec::new();
        let mut previous_case_skip: Option<usize> = None;

        while !self.match_token(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.match_token(TokenKind::Case) || self.match_token(TokenKind::Default) {
                let case_kind = self.previous.kind;
                if state == 2 {
                    self.error("Can't have another case or default after the default case.");
                }
                if state == 1 {
                    if case_ends.len() >= MAX_CASES {
                        self.error("Too many cases in switch statement.");
                    }
                    case_ends.push(self.emit_jump(Opcode::Jump));
                    if let Some(skip) = previous_case_skip.take() {
                        self.patch_jump(skip);
                        self.emit_op(Opcode::Pop);
                    }
                }
                if case_kind == TokenKind::Case {
                    state = 1;
                    self.emit_op(Opcode::Dup);
                    self.expression();
                    self.consume(TokenKind::Colon, "Expect ':' after case value.");
                    self.emit_op(Opcode::Equal);
                    previous_case_skip = Some(self.emit_jump(Opcode::JumpIfFalse));
                    self.emit_op(Opcode::Pop);
                } else {
                    state = 2;
                    self.consume(TokenKind::Colon, "Expect ':' after default.");
                    previous_case_skip = None;
                }
            } else {
                if state == 0 {
                    self.error("Can't have statements before any case.");
                }
                self.statement();
            }
        }

        if state == 1 {
            if let Some(skip) = previous_case_skip.take() {
                self.patch_jump(skip);
                self.emit_op(Opcode::Pop);
            }
        }
        for end in case_ends {
            self.patch_jump(end);
        }
        self.emit_op(Opcode::Pop);
    }

    fn return_statement(&mut self) {
        if self.compiler.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.compiler.kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Opcode::Return);
        }
    }

    fn throw_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after thrown value.");
        self.emit_op(Opcode::Throw);
    }

    /// Handler operands are patched once the catch/finally targets are
    /// known: `[PushHandler][class idx][handler u16][finally u16]`, with
    /// absolute instruction offsets.
    fn try_statement(&mut self) {
        self.emit_op(Opcode::PushHandler);
        let operands = self.chunk_len();
        self.emit_byte(HANDLER_NO_CATCH);
        for _ in 0..4 {
            self.emit_byte(0xff);
        }

        self.consume(TokenKind::LeftBrace, "Expect '{' after 'try'.");
        self.begin_scope();
        self.block();
        self.end_scope();
        self.emit_op(Opcode::PopHandler);
        let after_try = self.emit_jump(Opcode::Jump);

        let mut has_catch = false;
        if self.match_token(TokenKind::Catch) {
            has_catch = true;
            let handler_ip = self.chunk_len();
            self.consume(TokenKind::LeftParen, "Expect '(' after 'catch'.");
            self.consume(TokenKind::Identifier, "Expect exception class or variable name.");
            let first = self.previous;
            let (class_name, variable) = if self.check(TokenKind::Identifier) {
                self.advance();
                (first.lexeme.to_owned(), self.previous)
            } else {
                ("Exception".to_owned(), first)
            };
            self.consume(TokenKind::RightParen, "Expect ')' after catch clause.");

            let class_constant = self.identifier_constant(&class_name);
            self.patch_handler_operand(operands, class_constant, handler_ip);

            self.begin_scope();
            // The VM pushes the caught exception; bind it as the clause local.
            self.add_local(variable.lexeme, false);
            self.mark_initialized();
            self.consume(TokenKind::LeftBrace, "Expect '{' after catch clause.");
            self.block();
            self.end_scope();
        }
        self.patch_jump(after_try);

        let mut has_finally = false;
        if self.match_token(TokenKind::Finally) {
            has_finally = true;
            let finally_ip = self.chunk_len();
            self.patch_finally_operand(operands, finally_ip);
            self.consume(TokenKind::LeftBrace, "Expect '{' after 'finally'.");
            self.begin_scope();
            self.block();
            self.end_scope();
            self.emit_op(Opcode::EndFinally);
        }

        if !has_catch && !has_finally {
            self.error("Expect 'catch' or 'finally' after try block.");
        }
    }

    fn patch_handler_operand(&mut self, operands: usize, class_constant: u8, handler_ip: usize) {
        if handler_ip > usize::from(u16::MAX) {
            self.error("Too much code in try statement.");
            return;
        }
        let bytes = (handler_ip as u16).to_be_bytes();
        let chunk = self.chunk_mut();
        chunk.code[operands] = class_constant;
        chunk.code[operands + 1] = bytes[0];
        chunk.code[operands + 2] = bytes[1];
    }

    fn patch_finally_operand(&mut self, operands: usize, finally_ip: usize) {
        if finally_ip > usize::from(HANDLER_NO_FINALLY) {
            self.error("Too much code in try statement.");
            return;
        }
        let bytes = (finally_ip as u16).to_be_bytes();
        let chunk = self.chunk_mut();
        chunk.code[operands + 3] = bytes[0];
        chunk.code[operands + 4] = bytes[1];
    }
}

// === Scope resolution helpers ===

/// Scans a compiler's locals top-down for a name.
fn resolve_local(compiler: &Compiler, name: &str) -> Result<Option<u8>, &'static str> {
    for (i, local) in compiler.locals.iter().enumerate().rev() {
        if local.name == name {
            if local.depth == -1 {
                return Err("Can't read local variable in its own initializer.");
            }
            return Ok(Some(i as u8));
        }
    }
    Ok(None)
}

/// Resolves a name through the enclosing compiler chain, adding upvalues as
/// needed. Returns the upvalue index and the binding's mutability.
fn resolve_upvalue(
    compiler: &mut Compiler,
    name: &str,
) -> Result<Option<(u8, bool)>, &'static str> {
    enum Found {
        Local(u8, bool),
        Upvalue(u8, bool),
    }

    let found = {
        let Some(enclosing) = compiler.enclosing.as_deref_mut() else {
            return Ok(None);
        };
        if let Some(slot) = resolve_local(enclosing, name)? {
            let local = &mut enclosing.locals[usize::from(slot)];
            local.is_captured = true;
            Some(Found::Local(slot, local.mutable))
        } else if let Some((index, mutable)) = resolve_upvalue(enclosing, name)? {
            Some(Found::Upvalue(index, mutable))
        } else {
            None
        }
    };

    match found {
        None => Ok(None),
        Some(Found::Local(index, mutable)) => {
            add_upvalue(compiler, index, true, mutable).map(|i| Some((i, mutable)))
        }
        Some(Found::Upvalue(index, mutable)) => {
            add_upvalue(compiler, index, false, mutable).map(|i| Some((i, mutable)))
        }
    }
}

fn add_upvalue(
    compiler: &mut Compiler,
    index: u8,
    is_local: bool,
    mutable: bool,
) -> Result<u8, &'static str> {
    for (i, upvalue) in compiler.upvalues.iter().enumerate() {
        if upvalue.index == index && upvalue.is_local == is_local {
            return Ok(i as u8);
        }
    }
    if compiler.upvalues.len() >= MAX_UPVALUES {
        return Err("Too many closure variables in function.");
    }
    compiler.upvalues.push(CompilerUpvalue { index, is_local, mutable });
    Ok((compiler.upvalues.len() - 1) as u8)
}

/// Processes string escape sequences. Unknown escapes keep the backslash.
fn unescape(lexeme: &str) -> String {
    if !lexeme.contains('\\') {
        return lexeme.to_owned();
    }
    let mut out = String::with_capacity(lexeme.len());
    let mut chars = lexeme.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('$') => out.push('$'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
