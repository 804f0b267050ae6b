use std::io::Write;

use once_cell::sync::Lazy;

use crate::chunk::{Chunk, OpCode, MAX_CONSTANT_INDEX};
use crate::objects::object::Object;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_manager::ObjectManager;
use crate::scanner::{Scanner, Token, TokenType};
use crate::table::Table;
use crate::value::{make_number_value, make_object_value, Value};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

struct Local<'a> {
    name: Token<'a>,
    // -1 marks a declared-but-uninitialized local; resolution skips it and
    // falls through to enclosing scopes.
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Upvalue {
    index: u32,
    is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Named,
    Anonymous,
    Script,
}

/// Per-loop compile state: where `continue` jumps back to and which
/// `break` placeholders still need patching once the loop end is known.
struct LoopContext {
    continue_target: usize,
    break_jumps: Vec<usize>,
    depth: i32,
}

struct Compiler<'a> {
    function: Box<ObjectFunction>,
    function_type: FunctionType,
    locals: Vec<Local<'a>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
    loops: Vec<LoopContext>,
}

impl<'a> Compiler<'a> {
    fn new(function_type: FunctionType, name: Option<String>) -> Self {
        let mut compiler = Compiler {
            function: Box::new(ObjectFunction::new(name)),
            function_type,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        };
        // Slot zero stores the function being called.
        compiler.locals.push(Local {
            name: Token::synthetic(TokenType::Eof),
            depth: 0,
            is_captured: false,
        });
        compiler
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl From<u8> for Precedence {
    fn from(value: u8) -> Self {
        match value {
            0 => Precedence::None,
            1 => Precedence::Assignment,
            2 => Precedence::Or,
            3 => Precedence::And,
            4 => Precedence::Equality,
            5 => Precedence::Comparison,
            6 => Precedence::Term,
            7 => Precedence::Factor,
            8 => Precedence::Unary,
            9 => Precedence::Call,
            10 => Precedence::Primary,
            _ => unreachable!("Invalid precedence value: {}", value),
        }
    }
}

type ParseFn = fn(&mut Parser<'_>, bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence) -> Self {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }
}

static RULES: Lazy<[ParseRule; TokenType::Eof as usize + 1]> = Lazy::new(|| {
    let mut rules = [ParseRule::new(None, None, Precedence::None); TokenType::Eof as usize + 1];

    rules[TokenType::LeftParen as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.grouping()),
        Some(|parser, _can_assign| parser.call()),
        Precedence::Call,
    );
    rules[TokenType::LeftBracket as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.list()),
        Some(|parser, can_assign| parser.index(can_assign)),
        Precedence::Call,
    );
    rules[TokenType::LeftBrace as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.dict()), None, Precedence::None);
    rules[TokenType::Dot as usize] = ParseRule::new(
        None,
        Some(|parser, can_assign| parser.dot(can_assign)),
        Precedence::Call,
    );
    rules[TokenType::Minus as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.unary()),
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Term,
    );
    rules[TokenType::Plus as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Term,
    );
    rules[TokenType::Slash as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Factor,
    );
    rules[TokenType::Star as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Factor,
    );
    rules[TokenType::Bang as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.unary()), None, Precedence::None);
    rules[TokenType::BangEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Equality,
    );
    rules[TokenType::EqualEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Equality,
    );
    rules[TokenType::Greater as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );
    rules[TokenType::GreaterEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );
    rules[TokenType::Less as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );
    rules[TokenType::LessEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );
    rules[TokenType::Identifier as usize] = ParseRule::new(
        Some(|parser, can_assign| parser.variable(can_assign)),
        None,
        Precedence::None,
    );
    rules[TokenType::String as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.string()), None, Precedence::None);
    rules[TokenType::Number as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.number()), None, Precedence::None);
    rules[TokenType::And as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.and()),
        Precedence::And,
    );
    rules[TokenType::Or as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.or()),
        Precedence::Or,
    );
    rules[TokenType::True as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.literal()), None, Precedence::None);
    rules[TokenType::False as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.literal()), None, Precedence::None);
    rules[TokenType::Nil as usize] =
        ParseRule::new(Some(|parser, _can_assign| parser.literal()), None, Precedence::None);
    rules[TokenType::Fun as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.anonymous_function()),
        None,
        Precedence::None,
    );
    rules[TokenType::Await as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.await_expression()),
        None,
        Precedence::None,
    );
    rules[TokenType::Yield as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.yield_expression()),
        None,
        Precedence::None,
    );

    rules
});

pub struct Parser<'a> {
    scanner: Scanner<'a>,
    tokens: Vec<Token<'a>>,
    current: usize,
    had_error: bool,
    panic_mode: bool,
    compilers: Vec<Compiler<'a>>,
    object_manager: &'a mut ObjectManager,
    strings: &'a mut Table,
}

impl<'a> Parser<'a> {
    pub fn new(
        object_manager: &'a mut ObjectManager,
        strings: &'a mut Table,
        source: &'a str,
    ) -> Parser<'a> {
        let mut parser = Parser {
            scanner: Scanner::new(source),
            tokens: Vec::new(),
            current: 0,
            had_error: false,
            panic_mode: false,
            compilers: Vec::new(),
            object_manager,
            strings,
        };
        parser.compilers.push(Compiler::new(FunctionType::Script, None));
        parser
    }

    pub fn compile(mut self) -> Option<Box<ObjectFunction>> {
        while !self.match_token(TokenType::Eof) {
            self.declaration();
        }

        let function = self.end_compiler();
        if self.had_error {
            None
        } else {
            Some(function)
        }
    }

    // ---- token plumbing -------------------------------------------------

    fn token_at(&mut self, index: usize) -> Token<'a> {
        while self.tokens.len() <= index {
            if let Some(last) = self.tokens.last() {
                if last.token_type == TokenType::Eof {
                    // Don't read past the end; hand back Eof forever.
                    return *self.tokens.last().expect("token buffer is empty");
                }
            }
            let token = self.scanner.scan_token();
            self.tokens.push(token);
        }
        self.tokens[index]
    }

    fn current_token(&mut self) -> Token<'a> {
        self.token_at(self.current)
    }

    fn prev_token(&self) -> Token<'a> {
        self.tokens[self.current - 1]
    }

    fn advance(&mut self) {
        self.current += 1;
        loop {
            let token = self.current_token();
            if token.token_type != TokenType::Error {
                break;
            }
            self.error_at_current(token.value);
            self.tokens.remove(self.current);
        }
    }

    fn skip_newlines(&mut self) -> usize {
        let mut skipped = 0;
        while self.current_token().token_type == TokenType::Newline {
            self.current += 1;
            skipped += 1;
        }
        skipped
    }

    fn backtrack(&mut self, count: usize) {
        self.current -= count;
    }

    /// A newline satisfies a semicolon check; any other mismatch un-skips
    /// the newlines it stepped over.
    fn check(&mut self, token_type: TokenType) -> bool {
        let skipped = self.skip_newlines();
        if skipped != 0 && (token_type == TokenType::Newline || token_type == TokenType::Semicolon)
        {
            self.backtrack(skipped);
            return true;
        }
        let matched = self.current_token().token_type == token_type;
        if !matched {
            self.backtrack(skipped);
        }
        matched
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, token_type: TokenType, message: &str) {
        if self.match_token(token_type) {
            return;
        }
        self.error_at_current(message);
    }

    // ---- compiler stack accessors ---------------------------------------

    fn current_compiler(&self) -> &Compiler<'a> {
        self.compilers.last().expect("no compiler")
    }

    fn current_compiler_mut(&mut self) -> &mut Compiler<'a> {
        self.compilers.last_mut().expect("no compiler")
    }

    fn current_function(&self) -> &ObjectFunction {
        &self.current_compiler().function
    }

    fn current_function_mut(&mut self) -> &mut ObjectFunction {
        &mut self.current_compiler_mut().function
    }

    fn current_chunk(&self) -> &Chunk {
        &self.current_function().chunk
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        &mut self.current_function_mut().chunk
    }

    // ---- emitters -------------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.prev_token().line;
        self.current_chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.to_byte());
    }

    fn emit_bytes(&mut self, byte1: u8, byte2: u8) {
        self.emit_byte(byte1);
        self.emit_byte(byte2);
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.prev_token().line;
        let index = self.current_chunk_mut().write_constant(value, line);
        if index > MAX_CONSTANT_INDEX {
            self.error("Too many constants in one chunk.");
        }
    }

    fn make_constant(&mut self, value: Value) -> usize {
        if let Some(index) = self.current_chunk().find_constant(&value) {
            return index;
        }
        let index = self.current_chunk_mut().add_constant(value);
        if index > MAX_CONSTANT_INDEX {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index
    }

    /// Emit an opcode with an index operand, switching to the long form
    /// (24-bit little-endian) when the index does not fit in a byte.
    fn emit_index_op(&mut self, short: OpCode, long: OpCode, index: usize) {
        if index <= u8::MAX as usize {
            self.emit_bytes(short.to_byte(), index as u8);
        } else {
            self.emit_byte(long.to_byte());
            self.emit_byte((index & 0xff) as u8);
            self.emit_byte(((index >> 8) & 0xff) as u8);
            self.emit_byte(((index >> 16) & 0xff) as u8);
        }
    }

    /// Emit a forward jump with a 4-byte big-endian placeholder; returns
    /// the operand offset for patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 4
    }

    fn patch_jump(&mut self, offset: usize) {
        // -4 adjusts for the operand bytes themselves.
        let jump = self.current_chunk().len() - offset - 4;
        if jump > u32::MAX as usize {
            self.error("Too much code to jump over.");
        }

        let chunk = self.current_chunk_mut();
        chunk.write_by_offset(offset, ((jump >> 24) & 0xff) as u8);
        chunk.write_by_offset(offset + 1, ((jump >> 16) & 0xff) as u8);
        chunk.write_by_offset(offset + 2, ((jump >> 8) & 0xff) as u8);
        chunk.write_by_offset(offset + 3, (jump & 0xff) as u8);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);

        // +4 skips the operand of the Loop instruction itself.
        let offset = self.current_chunk().len() - loop_start + 4;
        if offset > u32::MAX as usize {
            self.error("Loop body too large.");
        }

        self.emit_byte(((offset >> 24) & 0xff) as u8);
        self.emit_byte(((offset >> 16) & 0xff) as u8);
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // ---- compiler stack -------------------------------------------------

    fn init_compiler(&mut self, function_type: FunctionType) {
        // For declarations this runs right after the name was consumed, so
        // the name is sitting in the previous token.
        let name = match function_type {
            FunctionType::Named => Some(self.prev_token().value.to_string()),
            FunctionType::Anonymous => Some(String::new()),
            FunctionType::Script => None,
        };
        self.compilers.push(Compiler::new(function_type, name));
    }

    fn end_compiler(&mut self) -> Box<ObjectFunction> {
        self.emit_return();

        let upvalue_count = self.current_compiler().upvalues.len();
        self.current_function_mut().upvalue_count = upvalue_count;

        debug_feature::disassemble_function(self);

        let compiler = self.compilers.pop().expect("no compiler");
        compiler.function
    }

    // ---- declarations ---------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else if self.match_token(TokenType::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenType::Coroutine) {
            self.coroutine_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        self.parse_variable("Expect variable name.");

        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable();
    }

    fn fun_declaration(&mut self) {
        self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Named);
        self.define_variable();
    }

    fn coroutine_declaration(&mut self) {
        self.parse_variable("Expect coroutine name.");
        self.mark_initialized();
        self.function(FunctionType::Named);
        self.emit_op(OpCode::Coroutine);
        self.define_variable();
    }

    fn parse_variable(&mut self, message: &str) {
        self.consume(TokenType::Identifier, message);
        self.declare_variable();
    }

    fn declare_variable(&mut self) {
        let name = self.prev_token();

        #[cfg(not(feature = "allow_shadowing"))]
        {
            let scope_depth = self.current_compiler().scope_depth;
            let mut duplicate = false;
            for local in self.current_compiler().locals.iter().rev() {
                if local.depth != -1 && local.depth < scope_depth {
                    break;
                }
                if identifiers_equal(&name, &local.name) {
                    duplicate = true;
                    break;
                }
            }
            if duplicate {
                self.error("Already a variable with this name in this scope.");
            }
        }

        self.add_local(name);
    }

    fn add_local(&mut self, name: Token<'a>) {
        if self.current_compiler().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }

        self.current_compiler_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let scope_depth = self.current_compiler().scope_depth;
        if let Some(local) = self.current_compiler_mut().locals.last_mut() {
            local.depth = scope_depth;
        }
    }

    fn define_variable(&mut self) {
        // Every variable is a local; top-level code runs in frame zero.
        self.mark_initialized();
    }

    fn function(&mut self, function_type: FunctionType) {
        self.init_compiler(function_type);
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                if self.current_function().arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.current_function_mut().arity += 1;
                }
                self.parse_variable("Expect parameter name.");
                self.define_variable();

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let upvalues = self.current_compiler().upvalues.clone();
        let function = self.end_compiler();
        let (function_ptr, _) = self.object_manager.adopt_function(function);
        let index = self.make_constant(make_object_value(function_ptr as *mut Object));
        self.emit_index_op(OpCode::Closure, OpCode::ClosureLong, index);

        for upvalue in &upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index as u8);
        }
    }

    fn anonymous_function(&mut self) {
        self.function(FunctionType::Anonymous);
    }

    // ---- statements -----------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::Break) {
            self.break_statement();
        } else if self.match_token(TokenType::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }

        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn begin_scope(&mut self) {
        self.current_compiler_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_compiler_mut().scope_depth -= 1;
        let scope_depth = self.current_compiler().scope_depth;
        loop {
            let (depth, captured) = match self.current_compiler().locals.last() {
                Some(local) => (local.depth, local.is_captured),
                None => break,
            };
            if depth <= scope_depth {
                break;
            }
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_compiler_mut().locals.pop();
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.expression();

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();

        self.expression();

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        let depth = self.current_compiler().scope_depth;
        self.current_compiler_mut().loops.push(LoopContext {
            continue_target: loop_start,
            break_jumps: Vec::new(),
            depth,
        });

        self.begin_scope();
        self.consume(TokenType::LeftBrace, "Expect '{' after while condition.");
        self.block();
        self.end_scope();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        let context = self
            .current_compiler_mut()
            .loops
            .pop()
            .expect("loop context missing");
        for jump in context.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        if self.match_token(TokenType::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.check(TokenType::LeftBrace) {
            // Hoist the increment clause: jump over it into the body, run
            // it on the way back around, then re-test the condition.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let depth = self.current_compiler().scope_depth;
        self.current_compiler_mut().loops.push(LoopContext {
            continue_target: loop_start,
            break_jumps: Vec::new(),
            depth,
        });

        self.consume(TokenType::LeftBrace, "Expect '{' after for clauses.");
        self.begin_scope();
        self.block();
        self.end_scope();

        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }

        let context = self
            .current_compiler_mut()
            .loops
            .pop()
            .expect("loop context missing");
        for jump in context.break_jumps {
            self.patch_jump(jump);
        }

        self.end_scope();
    }

    /// Emit pops (or upvalue closes) for locals deeper than the loop, but
    /// keep them in the compiler's list; compilation continues past the
    /// jump.
    fn discard_locals_to_depth(&mut self, depth: i32) {
        let count = self.current_compiler().locals.len();
        for index in (0..count).rev() {
            let local = &self.current_compiler().locals[index];
            let (local_depth, captured) = (local.depth, local.is_captured);
            if local_depth <= depth {
                break;
            }
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn break_statement(&mut self) {
        self.consume(TokenType::Semicolon, "Expect ';' after 'break'.");
        let Some(depth) = self.current_compiler().loops.last().map(|l| l.depth) else {
            self.error("Can't use 'break' outside of a loop.");
            return;
        };
        self.discard_locals_to_depth(depth);
        let jump = self.emit_jump(OpCode::Jump);
        self.current_compiler_mut()
            .loops
            .last_mut()
            .expect("loop context missing")
            .break_jumps
            .push(jump);
    }

    fn continue_statement(&mut self) {
        self.consume(TokenType::Semicolon, "Expect ';' after 'continue'.");
        let Some((depth, target)) = self
            .current_compiler()
            .loops
            .last()
            .map(|l| (l.depth, l.continue_target))
        else {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        };
        self.discard_locals_to_depth(depth);
        self.emit_loop(target);
    }

    fn return_statement(&mut self) {
        if self.current_compiler().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current_token().token_type != TokenType::Eof {
            if matches!(
                self.prev_token().token_type,
                TokenType::Semicolon | TokenType::Newline
            ) {
                return;
            }

            match self.current_token().token_type {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Coroutine
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Return => return,
                _ => {}
            }

            self.advance();
        }
    }

    // ---- expressions ----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.skip_newlines();
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;
        let Some(prefix) = RULES[self.prev_token().token_type as usize].prefix else {
            self.error("Expect expression.");
            return;
        };
        prefix(self, can_assign);

        while precedence as u8 <= RULES[self.current_token().token_type as usize].precedence as u8
        {
            self.advance();
            let Some(infix) = RULES[self.prev_token().token_type as usize].infix else {
                self.error("Expect expression.");
                return;
            };
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let value = self.prev_token().value.parse::<f64>().unwrap_or(0.0);
        self.emit_constant(make_number_value(value));
    }

    fn string(&mut self) {
        let lexeme = self.prev_token().value;
        // Trim the surrounding quotation marks.
        let content = &lexeme[1..lexeme.len() - 1];
        let ptr = self.object_manager.intern_copy(self.strings, content);
        self.emit_constant(make_object_value(ptr as *mut Object));
    }

    fn literal(&mut self) {
        match self.prev_token().token_type {
            TokenType::False => self.emit_op(OpCode::False),
            TokenType::True => self.emit_op(OpCode::True),
            TokenType::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("Unexpected literal token."),
        }
    }

    fn unary(&mut self) {
        let operator_type = self.prev_token().token_type;

        self.parse_precedence(Precedence::Unary);

        match operator_type {
            TokenType::Bang => self.emit_op(OpCode::Not),
            TokenType::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("Expect unary operator."),
        }
    }

    fn binary(&mut self) {
        let operator_type = self.prev_token().token_type;
        let rule = &RULES[operator_type as usize];
        self.parse_precedence((rule.precedence as u8 + 1).into());

        match operator_type {
            TokenType::BangEqual => self.emit_bytes(OpCode::Equal.to_byte(), OpCode::Not.to_byte()),
            TokenType::EqualEqual => self.emit_op(OpCode::Equal),
            TokenType::Greater => self.emit_op(OpCode::Greater),
            TokenType::GreaterEqual => {
                self.emit_bytes(OpCode::Less.to_byte(), OpCode::Not.to_byte())
            }
            TokenType::Less => self.emit_op(OpCode::Less),
            TokenType::LessEqual => {
                self.emit_bytes(OpCode::Greater.to_byte(), OpCode::Not.to_byte())
            }
            TokenType::Plus => self.emit_op(OpCode::Add),
            TokenType::Minus => self.emit_op(OpCode::Subtract),
            TokenType::Star => self.emit_op(OpCode::Multiply),
            TokenType::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("Unexpected binary operator."),
        }
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);

        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let argument_count = self.argument_list();
        self.emit_bytes(OpCode::Call.to_byte(), argument_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if count == u8::MAX as usize {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.prev_token(), can_assign);
    }

    fn named_variable(&mut self, name: Token<'a>, can_assign: bool) {
        enum Resolution {
            Local(usize),
            Upvalue(usize),
            Global(usize),
        }

        let compiler_index = self.compilers.len() - 1;
        let resolution = if let Some(slot) = self.resolve_local(compiler_index, &name) {
            Resolution::Local(slot)
        } else if let Some(slot) = self.resolve_upvalue(compiler_index, &name) {
            Resolution::Upvalue(slot)
        } else {
            Resolution::Global(self.identifier_constant(&name))
        };

        let assign = can_assign && self.match_token(TokenType::Equal);
        if assign {
            self.expression();
        }

        match resolution {
            Resolution::Local(slot) => {
                if assign {
                    self.emit_index_op(OpCode::SetLocal, OpCode::SetLocalLong, slot);
                } else {
                    self.emit_index_op(OpCode::GetLocal, OpCode::GetLocalLong, slot);
                }
            }
            Resolution::Upvalue(slot) => {
                let op = if assign {
                    OpCode::SetUpvalue
                } else {
                    OpCode::GetUpvalue
                };
                self.emit_bytes(op.to_byte(), slot as u8);
            }
            Resolution::Global(index) => {
                if assign {
                    self.emit_index_op(OpCode::SetGlobal, OpCode::SetGlobalLong, index);
                } else {
                    self.emit_index_op(OpCode::GetGlobal, OpCode::GetGlobalLong, index);
                }
            }
        }
    }

    /// Walk the function's locals top-down. A local still marked
    /// uninitialized is skipped rather than reported, so a use inside its
    /// own initializer falls through to an enclosing scope.
    fn resolve_local(&self, compiler_index: usize, name: &Token) -> Option<usize> {
        let compiler = &self.compilers[compiler_index];
        for (index, local) in compiler.locals.iter().enumerate().rev() {
            if identifiers_equal(name, &local.name) {
                if local.depth == -1 {
                    continue;
                }
                return Some(index);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, compiler_index: usize, name: &Token) -> Option<usize> {
        if compiler_index == 0 {
            return None;
        }

        if let Some(local) = self.resolve_local(compiler_index - 1, name) {
            self.compilers[compiler_index - 1].locals[local].is_captured = true;
            return Some(self.add_upvalue(compiler_index, local as u32, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(compiler_index - 1, name) {
            return Some(self.add_upvalue(compiler_index, upvalue as u32, false));
        }

        None
    }

    fn add_upvalue(&mut self, compiler_index: usize, index: u32, is_local: bool) -> usize {
        for (slot, upvalue) in self.compilers[compiler_index].upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return slot;
            }
        }

        if self.compilers[compiler_index].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }

        let upvalues = &mut self.compilers[compiler_index].upvalues;
        upvalues.push(Upvalue { index, is_local });
        upvalues.len() - 1
    }

    fn identifier_constant(&mut self, name: &Token) -> usize {
        let ptr = self.object_manager.intern_copy(self.strings, name.value);
        self.make_constant(make_object_value(ptr as *mut Object))
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.prev_token();
        let index = self.identifier_constant(&name);
        self.emit_index_op(OpCode::Constant, OpCode::ConstantLong, index);

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_op(OpCode::SetField);
        } else {
            self.emit_op(OpCode::GetField);
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenType::RightBracket, "Expect ']' after index.");

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_op(OpCode::SetField);
        } else {
            self.emit_op(OpCode::GetField);
        }
    }

    fn list(&mut self) {
        let mut count: usize = 0;
        if !self.check(TokenType::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if !self.match_token(TokenType::Comma) {
                    break;
                }
                // Allow a trailing comma.
                if self.check(TokenType::RightBracket) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightBracket, "Expect ']' after list elements.");

        if count > MAX_CONSTANT_INDEX {
            self.error("Too many list elements in initializer.");
        }
        self.emit_index_op(OpCode::List, OpCode::ListLong, count);
    }

    fn dict(&mut self) {
        let mut count: usize = 0;
        if !self.check(TokenType::RightBrace) {
            loop {
                self.consume(TokenType::Identifier, "Expect dict key.");
                let key = self.prev_token();
                let ptr = self.object_manager.intern_copy(self.strings, key.value);
                self.emit_constant(make_object_value(ptr as *mut Object));

                self.consume(TokenType::Colon, "Expect ':' after dict key.");
                self.expression();
                count += 1;

                if !self.match_token(TokenType::Comma) {
                    break;
                }
                if self.check(TokenType::RightBrace) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightBrace, "Expect '}' after dict entries.");

        if count > MAX_CONSTANT_INDEX {
            self.error("Too many dict entries in initializer.");
        }
        self.emit_index_op(OpCode::Dict, OpCode::DictLong, count);
    }

    fn await_expression(&mut self) {
        self.parse_precedence(Precedence::Unary);
        self.emit_op(OpCode::Await);
    }

    fn yield_expression(&mut self) {
        if self.check(TokenType::Semicolon)
            || self.check(TokenType::RightParen)
            || self.check(TokenType::RightBrace)
            || self.check(TokenType::Comma)
            || self.check(TokenType::Eof)
        {
            self.emit_op(OpCode::Nil);
        } else {
            self.parse_precedence(Precedence::Assignment);
        }
        self.emit_op(OpCode::Yield);
    }

    // ---- errors ---------------------------------------------------------

    fn error(&mut self, message: &str) {
        self.error_at(self.prev_token(), message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current_token();
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }

        self.panic_mode = true;
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "[line {}] Error", token.line);
        match token.token_type {
            TokenType::Eof => {
                let _ = write!(stderr, " at end");
            }
            TokenType::Error => {}
            TokenType::Newline => {
                let _ = write!(stderr, " at newline");
            }
            _ => {
                let _ = write!(stderr, " at '{}'", token.value);
            }
        }
        let _ = writeln!(stderr, ": {}", message);
        self.had_error = true;
    }
}

fn identifiers_equal(left: &Token, right: &Token) -> bool {
    left.token_type == right.token_type && left.value == right.value
}

#[cfg(feature = "debug_print_code")]
mod debug_feature {
    use super::*;
    use crate::debug;

    pub fn disassemble_function(parser: &Parser) {
        if parser.had_error {
            return;
        }
        let name = match parser.current_function().name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            Some(_) => "<fn>".to_string(),
            None => "<script>".to_string(),
        };
        debug::disassemble_chunk(parser.current_chunk(), &name);
    }
}

#[cfg(not(feature = "debug_print_code"))]
mod debug_feature {
    use super::*;

    pub fn disassemble_function(_parser: &Parser) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{as_number, values_equal};

    fn compile_source(source: &str) -> Option<Box<ObjectFunction>> {
        let mut manager = ObjectManager::new();
        let mut strings = Table::new();
        Parser::new(&mut manager, &mut strings, source).compile()
    }

    #[test]
    fn compiles_a_comparison_expression() {
        let mut manager = ObjectManager::new();
        let mut strings = Table::new();
        let parser = Parser::new(&mut manager, &mut strings, "!(5 - 4 > 3 * 2 == !nil);");
        let function = parser.compile().expect("expression should compile");
        let chunk = &function.chunk;

        assert_eq!(as_number(&chunk.get_constant(0)), 5.0);
        assert_eq!(as_number(&chunk.get_constant(1)), 4.0);

        let expected = [
            OpCode::Constant.to_byte(),
            0,
            OpCode::Constant.to_byte(),
            1,
            OpCode::Subtract.to_byte(),
            OpCode::Constant.to_byte(),
            2,
            OpCode::Constant.to_byte(),
            3,
            OpCode::Multiply.to_byte(),
            OpCode::Greater.to_byte(),
            OpCode::Nil.to_byte(),
            OpCode::Not.to_byte(),
            OpCode::Equal.to_byte(),
            OpCode::Not.to_byte(),
            OpCode::Pop.to_byte(),
            OpCode::Nil.to_byte(),
            OpCode::Return.to_byte(),
        ];
        for (offset, &byte) in expected.iter().enumerate() {
            assert_eq!(chunk.read_from_offset(offset), Some(byte));
        }
    }

    #[test]
    fn string_literals_are_interned_across_compiles() {
        let mut manager = ObjectManager::new();
        let mut strings = Table::new();

        let result = Parser::new(&mut manager, &mut strings, "\"this is a test string\";")
            .compile();
        assert!(result.is_some());

        let result = Parser::new(&mut manager, &mut strings, "\"this is a test string\";")
            .compile();
        assert!(result.is_some());

        assert_eq!(strings.len(), 1);
    }

    #[test]
    fn top_level_variables_compile_to_locals() {
        let function = compile_source("var x = 1; x = x + 2;").expect("should compile");
        let chunk = &function.chunk;
        // var x = 1;  ->  Constant 0 (stays in slot 1)
        // x = x + 2;  ->  GetLocal 1; Constant; Add; SetLocal 1; Pop
        let code: Vec<u8> = (0..chunk.len())
            .map(|offset| chunk.read_from_offset(offset).unwrap())
            .collect();
        assert!(code.contains(&OpCode::GetLocal.to_byte()));
        assert!(code.contains(&OpCode::SetLocal.to_byte()));
        assert!(!code.contains(&OpCode::GetGlobal.to_byte()));
    }

    #[test]
    fn free_identifiers_compile_to_globals() {
        let function = compile_source("clock();").expect("should compile");
        let chunk = &function.chunk;
        assert_eq!(
            chunk.read_from_offset(0),
            Some(OpCode::GetGlobal.to_byte())
        );
    }

    #[test]
    fn function_declarations_compile() {
        let result = compile_source(
            "fun sum(a, b, c) {
                 return a + b + c;
             }
             sum(5, 6, 7);",
        );
        assert!(result.is_some());
    }

    #[test]
    fn captured_upvalues_are_deduplicated() {
        // Keep the manager alive: the function constants point into it.
        let mut manager = ObjectManager::new();
        let mut strings = Table::new();
        let script = Parser::new(
            &mut manager,
            &mut strings,
            "fun outer() {
                 var x = 1;
                 fun inner() {
                     return x + x;
                 }
                 return inner;
             }",
        )
        .compile()
        .expect("should compile");

        // outer is a constant of the script chunk; inner is a constant of
        // outer's chunk. Both uses of x share one upvalue slot.
        let mut inner_upvalues = None;
        for constant in script.chunk.iter_constants() {
            if crate::value::is_obj_kind(constant, crate::objects::object::ObjectType::Function) {
                let outer = crate::value::as_object(constant) as *mut ObjectFunction;
                for nested in unsafe { (*outer).chunk.iter_constants() } {
                    if crate::value::is_obj_kind(
                        nested,
                        crate::objects::object::ObjectType::Function,
                    ) {
                        let inner = crate::value::as_object(nested) as *mut ObjectFunction;
                        inner_upvalues = Some(unsafe { (*inner).upvalue_count });
                    }
                }
            }
        }
        assert_eq!(inner_upvalues, Some(1));
    }

    #[test]
    fn reading_a_local_in_its_own_initializer_falls_through() {
        let result = compile_source("var a = 1; { var a = a + 1; }");
        assert!(result.is_some());
    }

    #[test]
    fn shadowing_in_one_scope_is_permitted() {
        let result = compile_source("{ var a = 1; var a = 2; }");
        assert!(result.is_some());
    }

    #[test]
    fn newlines_terminate_statements() {
        let result = compile_source("var x = 1\nvar y = 2\n");
        assert!(result.is_some());
    }

    #[test]
    fn break_outside_a_loop_is_an_error() {
        assert!(compile_source("break;").is_none());
    }

    #[test]
    fn continue_outside_a_loop_is_an_error() {
        assert!(compile_source("continue;").is_none());
    }

    #[test]
    fn break_inside_a_loop_compiles() {
        let result = compile_source(
            "for var i = 0; i < 10; i = i + 1 {
                 if i == 5 { break; }
                 continue;
             }",
        );
        assert!(result.is_some());
    }

    #[test]
    fn invalid_assignment_target_is_an_error() {
        assert!(compile_source("1 = 2;").is_none());
        assert!(compile_source("a + b = 1;").is_none());
    }

    #[test]
    fn return_at_top_level_is_an_error() {
        assert!(compile_source("return 1;").is_none());
    }

    #[test]
    fn coroutine_declarations_emit_the_wrapper() {
        let function = compile_source(
            "coroutine ticker() {
                 yield 1;
             }",
        )
        .expect("should compile");
        let code: Vec<u8> = (0..function.chunk.len())
            .map(|offset| function.chunk.read_from_offset(offset).unwrap())
            .collect();
        assert!(code.contains(&OpCode::Coroutine.to_byte()));
    }

    #[test]
    fn jumps_stay_within_chunk_bounds() {
        let function = compile_source(
            "var i = 0;
             while i < 3 {
                 if i == 1 {
                     i = i + 2;
                 } else {
                     i = i + 1;
                 }
             }",
        )
        .expect("should compile");
        let chunk = &function.chunk;

        let mut offset = 0;
        while offset < chunk.len() {
            let op = OpCode::from_byte(chunk.read_from_offset(offset).unwrap())
                .expect("valid opcode stream");
            let operand = |at: usize| chunk.read_from_offset(at).unwrap() as usize;
            match op {
                OpCode::Jump | OpCode::JumpIfFalse => {
                    let jump = operand(offset + 1) << 24
                        | operand(offset + 2) << 16
                        | operand(offset + 3) << 8
                        | operand(offset + 4);
                    assert!(offset + 5 + jump <= chunk.len());
                    offset += 5;
                }
                OpCode::Loop => {
                    let jump = operand(offset + 1) << 24
                        | operand(offset + 2) << 16
                        | operand(offset + 3) << 8
                        | operand(offset + 4);
                    assert!(jump <= offset + 5);
                    offset += 5;
                }
                OpCode::Constant | OpCode::GetLocal | OpCode::SetLocal | OpCode::Call
                | OpCode::GetGlobal | OpCode::SetGlobal | OpCode::GetUpvalue
                | OpCode::SetUpvalue | OpCode::List | OpCode::Dict | OpCode::Closure => {
                    offset += 2;
                }
                OpCode::ConstantLong | OpCode::GetLocalLong | OpCode::SetLocalLong
                | OpCode::GetGlobalLong | OpCode::SetGlobalLong | OpCode::ListLong
                | OpCode::DictLong | OpCode::ClosureLong => {
                    offset += 4;
                }
                _ => offset += 1,
            }
        }
    }

    #[test]
    fn dict_literal_compiles_keys_as_constants() {
        let mut manager = ObjectManager::new();
        let mut strings = Table::new();
        let function = Parser::new(&mut manager, &mut strings, "var d = {a: 1, b: 2};")
            .compile()
            .expect("should compile");
        let mut string_constants = 0;
        for constant in function.chunk.iter_constants() {
            if crate::value::is_string(constant) {
                string_constants += 1;
            }
        }
        assert_eq!(string_constants, 2);
    }

    #[test]
    fn equal_number_literals_share_one_constant() {
        let function = compile_source("1 + 1;").expect("should compile");
        let constants: Vec<f64> = function
            .chunk
            .iter_constants()
            .filter(|value| crate::value::is_number(value))
            .map(|value| as_number(value))
            .collect();
        assert_eq!(constants, vec![1.0]);
        assert!(values_equal(
            &function.chunk.get_constant(0),
            &make_number_value(1.0)
        ));
    }
}
