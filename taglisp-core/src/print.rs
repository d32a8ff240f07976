//! Value printing.
//!
//! `render` is a pure reader of heap state: no allocation, no mutation.
//! Anything without a printed representation is reported as
//! `UnsupportedValue` rather than silently approximated.

use crate::context::Context;
use crate::error::{PrintError, PrintResult};
use crate::gc::types::{IrefKind, JrefKind};
use crate::objects::FUN_NAME;
use crate::value::{LVal, Tag};

/// Render a value as its textual Lisp representation. Symbols print
/// package-qualified unless their home package is `active_package`.
pub fn render(ctx: &Context, value: LVal, active_package: LVal) -> PrintResult<String> {
    let mut out = String::new();
    write_value(ctx, value, active_package, &mut out)?;
    Ok(out)
}

fn write_value(ctx: &Context, v: LVal, active: LVal, out: &mut String) -> PrintResult<()> {
    match v.tag() {
        Tag::Atom => {
            if v.is_nil() {
                out.push_str("nil");
            } else if v.is_char() {
                out.push_str("#\\");
                out.push(v.as_char());
            } else {
                out.push_str(&v.as_fixnum().to_string());
            }
            Ok(())
        }
        Tag::Cons => {
            out.push('(');
            write_value(ctx, ctx.car(v), active, out)?;
            let mut rest = ctx.cdr(v);
            while rest.is_cons() {
                out.push(' ');
                write_value(ctx, ctx.car(rest), active, out)?;
                rest = ctx.cdr(rest);
            }
            if !rest.is_nil() {
                out.push_str(" . ");
                write_value(ctx, rest, active, out)?;
            }
            out.push(')');
            Ok(())
        }
        Tag::Iref => match ctx.iref_kind(v) {
            Some(IrefKind::Symbol) => write_symbol(ctx, v, active, out),
            Some(IrefKind::SimpleVector) => {
                out.push_str("#(");
                for i in 0..ctx.vector_len(v) {
                    if i > 0 {
                        out.push(' ');
                    }
                    write_value(ctx, ctx.vector_ref(v, i), active, out)?;
                }
                out.push(')');
                Ok(())
            }
            Some(IrefKind::Package) => {
                out.push_str("#<package ");
                out.push_str(&ctx.package_name(v));
                out.push('>');
                Ok(())
            }
            Some(IrefKind::Function) => {
                out.push_str("#<function ");
                write_value(ctx, ctx.iref_slot(v, FUN_NAME), active, out)?;
                out.push('>');
                Ok(())
            }
            None => Err(PrintError::UnsupportedValue {
                tag: Tag::Iref,
                subtype: ctx.subtype_word(v),
            }),
        },
        Tag::Jref => match ctx.jref_kind(v) {
            Some(JrefKind::SimpleString) => {
                out.push('"');
                for c in ctx.string_str(v).chars() {
                    if c == '\\' || c == '"' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
                Ok(())
            }
            _ => Err(PrintError::UnsupportedValue {
                tag: Tag::Jref,
                subtype: ctx.subtype_word(v),
            }),
        },
    }
}

fn write_symbol(ctx: &Context, sym: LVal, active: LVal, out: &mut String) -> PrintResult<()> {
    let home = ctx.symbol_package(sym);
    if home.is_nil() {
        out.push_str("#:");
    } else if home != active {
        out.push_str(&ctx.package_name(home));
        out.push(':');
    }
    out.push_str(&ctx.string_str(ctx.symbol_name(sym)));
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
