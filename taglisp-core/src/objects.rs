//! Heap object constructors and typed accessors.
//!
//! Every constructor either returns a fully initialized tagged value or
//! fails with `OutOfMemory`; partially built objects are never visible.
//! Constructors root their value arguments on the evaluation stack around
//! each allocation, so a collection triggered mid-construction cannot
//! reclaim them.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::context::Context;
use crate::error::HeapResult;
use crate::gc::types::{
    iref_words, jref_words, pack_count, unpack_count, BlockKind, IrefKind, JrefKind, HEADER_WORDS,
};
use crate::value::{Addr, LVal, Tag, Word, WORD_SIZE};

// Symbol slots.
pub const SYM_NAME: usize = 0;
pub const SYM_PACKAGE: usize = 1;
pub const SYM_VALUE: usize = 2;
pub const SYM_FUNCTION: usize = 3;
pub const SYM_SLOTS: usize = 4;

// Package slots.
pub const PKG_NAMES: usize = 0;
pub const PKG_EXTERNAL: usize = 1;
pub const PKG_INTERNAL: usize = 2;
pub const PKG_SLOTS: usize = 3;

// Function slots.
pub const FUN_NAME: usize = 0;
pub const FUN_LAMBDA_LIST: usize = 1;
pub const FUN_BODY: usize = 2;
pub const FUN_SLOTS: usize = 3;

/// Bucket count of a package symbol table.
pub const SYMBOL_TABLE_BUCKETS: usize = 127;

impl Context {
    // -----------------------------------------------------------------------
    // Cons cells and lists
    // -----------------------------------------------------------------------

    /// Allocate a cons cell.
    pub fn make_cons(&mut self, car: LVal, cdr: LVal) -> HeapResult<LVal> {
        self.push(car);
        self.push(cdr);
        let res = self.checked_alloc_block(2, BlockKind::Cons, self.sp());
        let cdr = self.pop();
        let car = self.pop();
        let addr = res?;
        self.heap.set_word(addr, 0, car.raw());
        self.heap.set_word(addr, 1, cdr.raw());
        Ok(LVal::from_addr(addr, Tag::Cons))
    }

    /// Build the two-element list `(a b)`.
    pub fn make_list2(&mut self, a: LVal, b: LVal) -> HeapResult<LVal> {
        let depth = self.sp();
        self.push(a);
        let r = self
            .make_cons(b, LVal::NIL)
            .and_then(|tail| {
                let a = self.pop();
                self.make_cons(a, tail)
            });
        self.unwind(depth);
        r
    }

    /// `car`, nil for anything that is not a cons. Matches the permissive
    /// list convention where `(car nil)` is nil.
    pub fn car(&self, v: LVal) -> LVal {
        if v.is_cons() {
            let addr = self.cons_addr(v);
            LVal::from_raw(self.heap.word(addr, 0))
        } else {
            LVal::NIL
        }
    }

    /// `cdr`, nil for anything that is not a cons.
    pub fn cdr(&self, v: LVal) -> LVal {
        if v.is_cons() {
            let addr = self.cons_addr(v);
            LVal::from_raw(self.heap.word(addr, 1))
        } else {
            LVal::NIL
        }
    }

    /// Store into a cons cell's car. Panics on a non-cons.
    pub fn set_car(&mut self, v: LVal, val: LVal) {
        let addr = self.cons_addr(v);
        self.heap.set_word(addr, 0, val.raw());
    }

    /// Store into a cons cell's cdr. Panics on a non-cons.
    pub fn set_cdr(&mut self, v: LVal, val: LVal) {
        let addr = self.cons_addr(v);
        self.heap.set_word(addr, 1, val.raw());
    }

    fn cons_addr(&self, v: LVal) -> Addr {
        let addr = v.addr(Tag::Cons);
        self.heap.expect_block(addr, BlockKind::Cons);
        addr
    }

    // -----------------------------------------------------------------------
    // Iref objects
    // -----------------------------------------------------------------------

    /// Allocate a header+slots object with all slots nil.
    fn alloc_iref(&mut self, kind: IrefKind, slots: usize) -> HeapResult<Addr> {
        let addr = self.checked_alloc_block(iref_words(slots), BlockKind::Iref, self.sp())?;
        self.heap.set_word(addr, 0, pack_count(slots));
        self.heap.set_word(addr, 1, kind as Word);
        Ok(addr)
    }

    /// Allocate a simple vector of `len` nil-initialized elements.
    pub fn make_vector(&mut self, len: usize) -> HeapResult<LVal> {
        let addr = self.alloc_iref(IrefKind::SimpleVector, len)?;
        Ok(LVal::from_addr(addr, Tag::Iref))
    }

    /// Allocate a symbol with the given print name and home package.
    /// Value and function bindings start nil.
    pub fn make_symbol(&mut self, name: LVal, home: LVal) -> HeapResult<LVal> {
        self.push(name);
        self.push(home);
        let res = self.alloc_iref(IrefKind::Symbol, SYM_SLOTS);
        let home = self.pop();
        let name = self.pop();
        let addr = res?;
        self.set_slot(addr, SYM_NAME, name);
        self.set_slot(addr, SYM_PACKAGE, home);
        Ok(LVal::from_addr(addr, Tag::Iref))
    }

    /// Allocate a function object carrying only its name; the lambda list
    /// and body slots stay nil until an evaluator fills them.
    pub fn make_function(&mut self, name: LVal) -> HeapResult<LVal> {
        self.push(name);
        let res = self.alloc_iref(IrefKind::Function, FUN_SLOTS);
        let name = self.pop();
        let addr = res?;
        self.set_slot(addr, FUN_NAME, name);
        Ok(LVal::from_addr(addr, Tag::Iref))
    }

    /// Allocate a package: a name/nickname list plus two fresh symbol-table
    /// vectors.
    pub fn make_package(&mut self, name: &str, nickname: &str) -> HeapResult<LVal> {
        let depth = self.sp();
        let r = self.build_package(name, nickname);
        self.unwind(depth);
        r
    }

    fn build_package(&mut self, name: &str, nickname: &str) -> HeapResult<LVal> {
        let name = self.make_string(name)?;
        self.push(name);
        let nickname = self.make_string(nickname)?;
        self.push(nickname);
        let names = self.make_list2(name, nickname)?;
        self.push(names);
        let external = self.make_vector(SYMBOL_TABLE_BUCKETS)?;
        self.push(external);
        let internal = self.make_vector(SYMBOL_TABLE_BUCKETS)?;
        self.push(internal);
        let addr = self.alloc_iref(IrefKind::Package, PKG_SLOTS)?;
        self.set_slot(addr, PKG_NAMES, names);
        self.set_slot(addr, PKG_EXTERNAL, external);
        self.set_slot(addr, PKG_INTERNAL, internal);
        Ok(LVal::from_addr(addr, Tag::Iref))
    }

    /// Subtype of an iref object, when its code is known.
    pub fn iref_kind(&self, v: LVal) -> Option<IrefKind> {
        IrefKind::from_word(self.subtype_word(v))
    }

    /// Raw subtype word of an iref or jref object.
    pub(crate) fn subtype_word(&self, v: LVal) -> Word {
        let addr = match v.tag() {
            Tag::Iref => {
                let a = v.addr(Tag::Iref);
                self.heap.expect_block(a, BlockKind::Iref);
                a
            }
            _ => {
                let a = v.addr(Tag::Jref);
                self.heap.expect_block(a, BlockKind::Jref);
                a
            }
        };
        self.heap.word(addr, 1)
    }

    /// Payload slot `i` of an iref object. Panics on a non-iref or an
    /// out-of-range slot.
    pub fn iref_slot(&self, v: LVal, i: usize) -> LVal {
        let addr = self.iref_addr(v);
        let slots = unpack_count(self.heap.word(addr, 0));
        assert!(i < slots, "slot {} out of range for {} slots", i, slots);
        LVal::from_raw(self.heap.word(addr, HEADER_WORDS + i))
    }

    fn iref_addr(&self, v: LVal) -> Addr {
        let addr = v.addr(Tag::Iref);
        self.heap.expect_block(addr, BlockKind::Iref);
        addr
    }

    fn set_slot(&mut self, addr: Addr, i: usize, val: LVal) {
        self.heap.set_word(addr, HEADER_WORDS + i, val.raw());
    }

    // -----------------------------------------------------------------------
    // Vectors
    // -----------------------------------------------------------------------

    pub fn vector_len(&self, v: LVal) -> usize {
        let addr = self.iref_addr(v);
        unpack_count(self.heap.word(addr, 0))
    }

    pub fn vector_ref(&self, v: LVal, i: usize) -> LVal {
        self.iref_slot(v, i)
    }

    pub fn vector_set(&mut self, v: LVal, i: usize, val: LVal) {
        let addr = self.iref_addr(v);
        let slots = unpack_count(self.heap.word(addr, 0));
        assert!(i < slots, "slot {} out of range for {} slots", i, slots);
        self.set_slot(addr, i, val);
    }

    // -----------------------------------------------------------------------
    // Symbols and packages
    // -----------------------------------------------------------------------

    pub fn symbol_name(&self, sym: LVal) -> LVal {
        self.iref_slot(sym, SYM_NAME)
    }

    pub fn symbol_package(&self, sym: LVal) -> LVal {
        self.iref_slot(sym, SYM_PACKAGE)
    }

    pub fn symbol_value(&self, sym: LVal) -> LVal {
        self.iref_slot(sym, SYM_VALUE)
    }

    pub fn set_symbol_value(&mut self, sym: LVal, val: LVal) {
        let addr = self.iref_addr(sym);
        self.set_slot(addr, SYM_VALUE, val);
    }

    pub fn symbol_function(&self, sym: LVal) -> LVal {
        self.iref_slot(sym, SYM_FUNCTION)
    }

    pub fn set_symbol_function(&mut self, sym: LVal, val: LVal) {
        let addr = self.iref_addr(sym);
        self.set_slot(addr, SYM_FUNCTION, val);
    }

    /// A package's primary name as a Rust string.
    pub fn package_name(&self, pkg: LVal) -> String {
        let names = self.iref_slot(pkg, PKG_NAMES);
        self.string_str(self.car(names))
    }

    /// Intern `name` in a package's internal symbol table. The same name
    /// always yields the identical symbol for a given package.
    pub fn intern(&mut self, name: &str, package: LVal) -> HeapResult<LVal> {
        let depth = self.sp();
        let r = self.intern_inner(name, package);
        self.unwind(depth);
        r
    }

    fn intern_inner(&mut self, name: &str, package: LVal) -> HeapResult<LVal> {
        let table = self.iref_slot(package, PKG_INTERNAL);
        let bucket = Self::bucket_index(name);
        let mut chain = self.vector_ref(table, bucket);
        while chain.is_cons() {
            let sym = self.car(chain);
            if self.string_equals(self.symbol_name(sym), name) {
                return Ok(sym);
            }
            chain = self.cdr(chain);
        }
        self.push(package);
        let print_name = self.make_string(name)?;
        self.push(print_name);
        let sym = self.make_symbol(print_name, package)?;
        self.push(sym);
        // Objects never move, so the table reference read above is stable
        // across the allocations; only the chain head must be re-read.
        let chain = self.vector_ref(table, bucket);
        let entry = self.make_cons(sym, chain)?;
        self.vector_set(table, bucket, entry);
        Ok(sym)
    }

    fn bucket_index(name: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        (hasher.finish() as usize) % SYMBOL_TABLE_BUCKETS
    }

    // -----------------------------------------------------------------------
    // Jref objects
    // -----------------------------------------------------------------------

    /// Allocate a simple string holding `s`'s bytes plus a NUL terminator.
    pub fn make_string(&mut self, s: &str) -> HeapResult<LVal> {
        let bytes = s.as_bytes();
        let addr =
            self.checked_alloc_block(jref_words(bytes.len()), BlockKind::Jref, self.sp())?;
        self.heap.set_word(addr, 0, pack_count(bytes.len()));
        self.heap.set_word(addr, 1, JrefKind::SimpleString as Word);
        let payload = addr + HEADER_WORDS * WORD_SIZE;
        for (i, &b) in bytes.iter().enumerate() {
            self.heap.set_byte(payload + i, b);
        }
        self.heap.set_byte(payload + bytes.len(), 0);
        Ok(LVal::from_addr(addr, Tag::Jref))
    }

    /// Allocate a boxed double holding the IEEE-754 bit pattern of `x`.
    pub fn make_double(&mut self, x: f64) -> HeapResult<LVal> {
        let bytes = x.to_le_bytes();
        let addr = self.checked_alloc_block(jref_words(bytes.len()), BlockKind::Jref, self.sp())?;
        self.heap.set_word(addr, 0, pack_count(bytes.len()));
        self.heap.set_word(addr, 1, JrefKind::Double as Word);
        let payload = addr + HEADER_WORDS * WORD_SIZE;
        for (i, &b) in bytes.iter().enumerate() {
            self.heap.set_byte(payload + i, b);
        }
        self.heap.set_byte(payload + bytes.len(), 0);
        Ok(LVal::from_addr(addr, Tag::Jref))
    }

    /// Subtype of a jref object, when its code is known.
    pub fn jref_kind(&self, v: LVal) -> Option<JrefKind> {
        let addr = self.jref_addr(v);
        JrefKind::from_word(self.heap.word(addr, 1))
    }

    /// Byte length of a jref object's payload, terminator excluded.
    pub fn string_len(&self, v: LVal) -> usize {
        let addr = self.jref_addr(v);
        unpack_count(self.heap.word(addr, 0))
    }

    /// Copy a string object's bytes out as a Rust `String`.
    pub fn string_str(&self, v: LVal) -> String {
        let addr = self.jref_addr(v);
        assert!(
            JrefKind::from_word(self.heap.word(addr, 1)) == Some(JrefKind::SimpleString),
            "string read on a non-string byte object"
        );
        let len = unpack_count(self.heap.word(addr, 0));
        let payload = addr + HEADER_WORDS * WORD_SIZE;
        let bytes: Vec<u8> = (0..len).map(|i| self.heap.byte(payload + i)).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Compare a string object's bytes against a Rust string without
    /// allocating.
    pub fn string_equals(&self, v: LVal, s: &str) -> bool {
        let addr = self.jref_addr(v);
        if JrefKind::from_word(self.heap.word(addr, 1)) != Some(JrefKind::SimpleString) {
            return false;
        }
        let len = unpack_count(self.heap.word(addr, 0));
        let bytes = s.as_bytes();
        if len != bytes.len() {
            return false;
        }
        let payload = addr + HEADER_WORDS * WORD_SIZE;
        bytes.iter().enumerate().all(|(i, &b)| self.heap.byte(payload + i) == b)
    }

    /// Read a boxed double back.
    pub fn double_value(&self, v: LVal) -> f64 {
        let addr = self.jref_addr(v);
        assert!(
            JrefKind::from_word(self.heap.word(addr, 1)) == Some(JrefKind::Double),
            "double read on a non-double byte object"
        );
        let payload = addr + HEADER_WORDS * WORD_SIZE;
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.heap.byte(payload + i);
        }
        f64::from_le_bytes(bytes)
    }

    fn jref_addr(&self, v: LVal) -> Addr {
        let addr = v.addr(Tag::Jref);
        self.heap.expect_block(addr, BlockKind::Jref);
        addr
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
