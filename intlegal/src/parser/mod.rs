//! Recursive-descent parser for the textual IR

use std::collections::HashMap;

use crate::error::{CompileError, Result};
use crate::ir::{
    BinaryOp, Block, CastOp, Constant, Elem, Function, IntPredicate, MemAttrs, Module, Opcode, SubgroupOp, Type,
    Value, ValueDef,
};
use crate::lexer::Token;
use crate::span::Span;

#[cfg(test)]
mod tests;

/// Parse tokens into a module
pub fn parse(_filename: &str, source: &str, tokens: Vec<(Token, Span)>) -> Result<Module> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        eof: Span::new(source.len(), source.len()),
    };
    let mut module = Module::new();
    while !parser.at_end() {
        let func = parser.function()?;
        if module.function(&func.name).is_some() {
            return Err(CompileError::parser(
                format!("duplicate function @{}", func.name),
                parser.prev_span(),
            ));
        }
        module.functions.push(func);
    }
    Ok(module)
}

/// Tokenize and parse in one step.
pub fn parse_str(filename: &str, source: &str) -> Result<Module> {
    let tokens = crate::lexer::tokenize(source)?;
    parse(filename, source, tokens)
}

struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    eof: Span,
}

/// Name resolution state for the function being parsed.
struct Scope {
    values: HashMap<String, Value>,
    /// Referenced before definition: placeholder value and first use site.
    pending: HashMap<String, Span>,
    blocks: HashMap<String, Block>,
}

impl Parser {
    // ========================================================================
    // Token cursor
    // ========================================================================

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(t, _)| t)
    }

    fn span(&self) -> Span {
        self.tokens.get(self.pos).map(|(_, s)| *s).unwrap_or(self.eof)
    }

    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|p| self.tokens.get(p))
            .map(|(_, s)| *s)
            .unwrap_or(self.eof)
    }

    fn next(&mut self) -> Result<(Token, Span)> {
        match self.tokens.get(self.pos) {
            Some(entry) => {
                self.pos += 1;
                Ok(entry.clone())
            }
            None => Err(CompileError::parser("unexpected end of input", self.eof)),
        }
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(CompileError::parser(message, self.span()))
    }

    fn expect(&mut self, want: Token) -> Result<Span> {
        let (tok, span) = self.next()?;
        if tok == want {
            Ok(span)
        } else {
            Err(CompileError::parser(format!("expected `{want}`, found `{tok}`"), span))
        }
    }

    fn eat(&mut self, want: &Token) -> bool {
        if self.peek() == Some(want) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(s)) if s == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, word: &str) -> Result<()> {
        if self.eat_keyword(word) {
            Ok(())
        } else {
            self.error(format!("expected `{word}`"))
        }
    }

    fn ident(&mut self) -> Result<(String, Span)> {
        match self.next()? {
            (Token::Ident(s), span) => Ok((s, span)),
            (tok, span) => Err(CompileError::parser(format!("expected identifier, found `{tok}`"), span)),
        }
    }

    fn local(&mut self) -> Result<(String, Span)> {
        match self.next()? {
            (Token::Local(s), span) => Ok((s, span)),
            (tok, span) => Err(CompileError::parser(format!("expected `%name`, found `{tok}`"), span)),
        }
    }

    fn int(&mut self) -> Result<i128> {
        match self.next()? {
            (Token::Int(n), _) => Ok(n),
            (tok, span) => Err(CompileError::parser(format!("expected integer, found `{tok}`"), span)),
        }
    }

    fn uint(&mut self) -> Result<u32> {
        let span = self.span();
        let n = self.int()?;
        u32::try_from(n).map_err(|_| CompileError::parser(format!("{n} is out of range"), span))
    }

    // ========================================================================
    // Types
    // ========================================================================

    fn ty(&mut self) -> Result<Type> {
        if self.eat(&Token::Lt) {
            let lanes = self.uint()?;
            self.expect_keyword("x")?;
            let span = self.span();
            let elem = self.ty()?;
            self.expect(Token::Gt)?;
            if lanes == 0 {
                return Err(CompileError::parser("vector must have at least one lane", span));
            }
            return Type::vector(elem, lanes)
                .ok_or_else(|| CompileError::parser(format!("`{elem}` cannot be a vector lane"), span));
        }
        let (name, span) = self.ident()?;
        parse_type_name(&name).ok_or_else(|| CompileError::parser(format!("unknown type `{name}`"), span))
    }

    // ========================================================================
    // Functions and blocks
    // ========================================================================

    fn function(&mut self) -> Result<Function> {
        self.expect(Token::Fn)?;
        let name = match self.next()? {
            (Token::Global(name), _) => name,
            (tok, span) => return Err(CompileError::parser(format!("expected `@name`, found `{tok}`"), span)),
        };
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                let ty = self.ty()?;
                let (pname, span) = self.local()?;
                params.push((ty, pname, span));
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(Token::Comma)?;
            }
        }
        self.expect(Token::Arrow)?;
        let ret_ty = self.ty()?;
        self.expect(Token::LBrace)?;

        let mut func = Function::new(name, ret_ty);
        let mut scope = Scope {
            values: HashMap::new(),
            pending: HashMap::new(),
            blocks: HashMap::new(),
        };
        for (ty, pname, span) in params {
            if scope.values.contains_key(&pname) {
                return Err(CompileError::parser(format!("duplicate parameter %{pname}"), span));
            }
            let v = func.add_param(ty, pname.clone());
            scope.values.insert(pname, v);
        }

        // Labels are declared up front so the block layout follows the text.
        let mut depth = 0usize;
        let mut k = self.pos;
        while let Some((tok, span)) = self.tokens.get(k) {
            match tok {
                Token::LBrace => depth += 1,
                Token::RBrace if depth == 0 => break,
                Token::RBrace => depth -= 1,
                Token::Ident(label) if matches!(self.tokens.get(k + 1), Some((Token::Colon, _))) => {
                    if scope.blocks.contains_key(label) {
                        return Err(CompileError::parser(format!("duplicate block label `{label}`"), *span));
                    }
                    let b = func.add_block(label.clone());
                    scope.blocks.insert(label.clone(), b);
                }
                _ => {}
            }
            k += 1;
        }

        if scope.blocks.is_empty() {
            return self.error("function body must start with a block label");
        }
        let mut current: Option<Block> = None;
        while !self.eat(&Token::RBrace) {
            if self.at_end() {
                return self.error("unexpected end of input in function body");
            }
            if let (Some(Token::Ident(label)), Some(Token::Colon)) = (self.peek(), self.peek_at(1)) {
                current = scope.blocks.get(label).copied();
                self.pos += 2;
                continue;
            }
            let Some(block) = current else {
                return self.error("instruction outside of a block");
            };
            self.instruction(&mut func, &mut scope, block)?;
        }

        if let Some((name, span)) = scope.pending.iter().min_by_key(|(_, s)| s.start) {
            return Err(CompileError::parser(format!("use of undefined value %{name}"), *span));
        }
        Ok(func)
    }

    fn block_ref(&mut self, scope: &Scope) -> Result<Block> {
        let (name, span) = self.local()?;
        scope
            .blocks
            .get(&name)
            .copied()
            .ok_or_else(|| CompileError::parser(format!("unknown block %{name}"), span))
    }

    // ========================================================================
    // Operands
    // ========================================================================

    fn operand(&mut self, func: &mut Function, scope: &mut Scope) -> Result<Value> {
        let ty = self.ty()?;
        self.value_of_type(func, scope, ty)
    }

    fn value_of_type(&mut self, func: &mut Function, scope: &mut Scope, ty: Type) -> Result<Value> {
        let span = self.span();
        match self.next()? {
            (Token::Local(name), span) => {
                if let Some(&v) = scope.values.get(&name) {
                    if func.value_type(v) != ty {
                        return Err(CompileError::parser(
                            format!("%{name} has type {}, used as {ty}", func.value_type(v)),
                            span,
                        ));
                    }
                    return Ok(v);
                }
                let v = func.new_value(ty, ValueDef::Const(Constant::Undef), Some(name.clone()));
                scope.values.insert(name.clone(), v);
                scope.pending.insert(name, span);
                Ok(v)
            }
            (Token::Int(n), span) => match ty {
                Type::Int(_) => Ok(func.const_int(ty, n as u128)),
                _ => Err(CompileError::parser(format!("integer literal of type {ty}"), span)),
            },
            (Token::Lt, _) => {
                let mut lanes = Vec::new();
                loop {
                    lanes.push(self.int()? as u128);
                    if self.eat(&Token::Gt) {
                        break;
                    }
                    self.expect(Token::Comma)?;
                }
                match ty {
                    Type::Vector(Elem::Int(_), n) if n as usize == lanes.len() => Ok(func.const_vector(ty, lanes)),
                    _ => Err(CompileError::parser(format!("vector literal does not match {ty}"), span)),
                }
            }
            (Token::Ident(word), _) if word == "zeroinitializer" => Ok(func.zero(ty)),
            (Token::Ident(word), _) if word == "undef" => Ok(func.undef(ty)),
            (Token::Ident(word), _) if word == "constexpr" => match self.next()? {
                (Token::Str(text), _) => Ok(func.const_expr(ty, text)),
                (tok, span) => Err(CompileError::parser(format!("expected string, found `{tok}`"), span)),
            },
            (tok, span) => Err(CompileError::parser(format!("expected value, found `{tok}`"), span)),
        }
    }

    fn operands(&mut self, func: &mut Function, scope: &mut Scope, n: usize) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(n);
        for k in 0..n {
            if k > 0 {
                self.expect(Token::Comma)?;
            }
            out.push(self.operand(func, scope)?);
        }
        Ok(out)
    }

    fn mem_attrs(&mut self) -> Result<u32> {
        self.expect(Token::Comma)?;
        self.expect_keyword("align")?;
        let span = self.span();
        let align = self.uint()?;
        if align == 0 || !align.is_power_of_two() {
            return Err(CompileError::parser(format!("alignment {align} is not a power of two"), span));
        }
        Ok(align)
    }

    // ========================================================================
    // Instructions
    // ========================================================================

    fn instruction(&mut self, func: &mut Function, scope: &mut Scope, block: Block) -> Result<()> {
        let start = self.span();
        let result_name = if matches!(self.peek(), Some(Token::Local(_))) {
            let (name, span) = self.local()?;
            self.expect(Token::Eq)?;
            Some((name, span))
        } else {
            None
        };

        let (mnemonic, mspan) = self.ident()?;
        let (op, args, ty) = self.instruction_body(func, scope, &mnemonic, mspan)?;

        let result = match (result_name, ty.is_void()) {
            (Some((name, span)), false) => Some(self.define(func, scope, name, ty, span)?),
            (None, true) => None,
            (Some(_), true) => return Err(CompileError::parser(format!("`{mnemonic}` produces no value"), start)),
            (None, false) => return Err(CompileError::parser(format!("result of `{mnemonic}` must be named"), start)),
        };
        func.append_with_result(block, op, args, result);
        Ok(())
    }

    fn define(&mut self, func: &mut Function, scope: &mut Scope, name: String, ty: Type, span: Span) -> Result<Value> {
        if let Some(&v) = scope.values.get(&name) {
            if scope.pending.remove(&name).is_none() {
                return Err(CompileError::parser(format!("redefinition of %{name}"), span));
            }
            if func.value_type(v) != ty {
                return Err(CompileError::parser(
                    format!("%{name} defined as {ty} but used earlier as {}", func.value_type(v)),
                    span,
                ));
            }
            return Ok(v);
        }
        let v = func.new_value(ty, ValueDef::Const(Constant::Undef), Some(name.clone()));
        scope.values.insert(name, v);
        Ok(v)
    }

    fn instruction_body(
        &mut self,
        func: &mut Function,
        scope: &mut Scope,
        mnemonic: &str,
        mspan: Span,
    ) -> Result<(Opcode, Vec<Value>, Type)> {
        if let Some(op) = BinaryOp::from_mnemonic(mnemonic) {
            let args = self.operands(func, scope, 2)?;
            let ty = func.value_type(args[0]);
            return Ok((Opcode::Binary(op), args, ty));
        }
        if let Some(op) = CastOp::from_mnemonic(mnemonic) {
            let args = self.operands(func, scope, 1)?;
            self.expect_keyword("to")?;
            let ty = self.ty()?;
            return Ok((Opcode::Cast(op), args, ty));
        }
        if let Some(op) = SubgroupOp::from_mnemonic(mnemonic) {
            let n = if op.is_lane_move() { 2 } else { 1 };
            let args = self.operands(func, scope, n)?;
            let ty = func.value_type(args[0]);
            return Ok((Opcode::Subgroup(op), args, ty));
        }
        let parsed = match mnemonic {
            "icmp" => {
                let (pred, span) = self.ident()?;
                let pred = IntPredicate::from_mnemonic(&pred)
                    .ok_or_else(|| CompileError::parser(format!("unknown predicate `{pred}`"), span))?;
                let args = self.operands(func, scope, 2)?;
                let ty = func.value_type(args[0]).bool_shape();
                (Opcode::ICmp(pred), args, ty)
            }
            "select" => {
                let args = self.operands(func, scope, 3)?;
                let ty = func.value_type(args[1]);
                (Opcode::Select, args, ty)
            }
            "freeze" => {
                let args = self.operands(func, scope, 1)?;
                let ty = func.value_type(args[0]);
                (Opcode::Freeze, args, ty)
            }
            "phi" => {
                let ty = self.ty()?;
                let mut args = Vec::new();
                let mut blocks = Vec::new();
                while self.eat(&Token::LBracket) {
                    args.push(self.value_of_type_after(func, scope, ty)?);
                    self.expect(Token::Comma)?;
                    blocks.push(self.block_ref(scope)?);
                    self.expect(Token::RBracket)?;
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                (Opcode::Phi(blocks), args, ty)
            }
            "extractelement" => {
                let args = self.operands(func, scope, 2)?;
                let ty = func.value_type(args[0]).scalar();
                (Opcode::ExtractElement, args, ty)
            }
            "insertelement" => {
                let args = self.operands(func, scope, 3)?;
                let ty = func.value_type(args[0]);
                (Opcode::InsertElement, args, ty)
            }
            "shufflevector" => {
                let args = self.operands(func, scope, 2)?;
                self.expect(Token::Comma)?;
                self.expect(Token::LBracket)?;
                let mut mask = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        mask.push(self.uint()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                let elem = func.value_type(args[0]).scalar();
                let ty = Type::vector(elem, mask.len() as u32)
                    .ok_or_else(|| CompileError::parser("shufflevector of non-vector", mspan))?;
                (Opcode::ShuffleVector(mask), args, ty)
            }
            "load" => {
                let volatile = self.eat_keyword("volatile");
                let ty = self.ty()?;
                self.expect(Token::Comma)?;
                let args = self.operands(func, scope, 1)?;
                let align = self.mem_attrs()?;
                (Opcode::Load(MemAttrs { align, volatile }), args, ty)
            }
            "store" => {
                let volatile = self.eat_keyword("volatile");
                let args = self.operands(func, scope, 2)?;
                let align = self.mem_attrs()?;
                (Opcode::Store(MemAttrs { align, volatile }), args, Type::Void)
            }
            "ptradd" => {
                let args = self.operands(func, scope, 2)?;
                (Opcode::PtrAdd, args, Type::Ptr)
            }
            "call" => {
                let ty = self.ty()?;
                let callee = match self.next()? {
                    (Token::Global(name), _) => name,
                    (tok, span) => {
                        return Err(CompileError::parser(format!("expected `@callee`, found `{tok}`"), span));
                    }
                };
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.operand(func, scope)?);
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                (Opcode::Call(callee), args, ty)
            }
            "br" => {
                let target = self.block_ref(scope)?;
                (Opcode::Br(target), Vec::new(), Type::Void)
            }
            "condbr" => {
                let args = self.operands(func, scope, 1)?;
                self.expect(Token::Comma)?;
                let t = self.block_ref(scope)?;
                self.expect(Token::Comma)?;
                let f = self.block_ref(scope)?;
                (Opcode::CondBr(t, f), args, Type::Void)
            }
            "ret" => {
                if self.eat_keyword("void") {
                    (Opcode::Ret, Vec::new(), Type::Void)
                } else {
                    let args = self.operands(func, scope, 1)?;
                    (Opcode::Ret, args, Type::Void)
                }
            }
            _ => return Err(CompileError::parser(format!("unknown instruction `{mnemonic}`"), mspan)),
        };
        Ok(parsed)
    }

    /// A phi incoming value: `ty value`, checked against the phi's type.
    fn value_of_type_after(&mut self, func: &mut Function, scope: &mut Scope, want: Type) -> Result<Value> {
        let span = self.span();
        let ty = self.ty()?;
        if ty != want {
            return Err(CompileError::parser(format!("phi incoming of type {ty}, expected {want}"), span));
        }
        self.value_of_type(func, scope, ty)
    }
}

fn parse_type_name(name: &str) -> Option<Type> {
    match name {
        "ptr" => return Some(Type::Ptr),
        "void" => return Some(Type::Void),
        _ => {}
    }
    if let Some(w) = name.strip_prefix('i') {
        let w: u32 = w.parse().ok()?;
        return (1..=128).contains(&w).then_some(Type::Int(w));
    }
    if let Some(w) = name.strip_prefix('f') {
        let w: u32 = w.parse().ok()?;
        return matches!(w, 16 | 32 | 64).then_some(Type::Float(w));
    }
    None
}
