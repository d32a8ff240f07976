//! taglisp — standalone harness for the heap runtime.
//!
//! Bootstraps an execution context, renders a few sample structures, and in
//! `testall` mode runs the allocator-exhaustion smoke check. There is no
//! evaluator or reader yet; this binary exists to observe the memory
//! subsystem.

use std::process::ExitCode;

use taglisp_core::{render, Context, HeapError, LVal};

/// Arena for the exhaustion smoke: just enough for the package bootstrap
/// plus a little headroom to fill and reclaim.
const SMOKE_ARENA_WORDS: usize = 2048;
const SMOKE_STACK_WORDS: usize = 256;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let testall = std::env::args().nth(1).as_deref() == Some("testall");

    let mut ctx = match Context::with_defaults() {
        Ok(ctx) => ctx,
        Err(e) => {
            log::error!("context bootstrap failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "context ready: {} arena words, {} free",
        ctx.heap().arena_words(),
        ctx.free_words()
    );

    if let Err(e) = print_samples(&mut ctx) {
        log::error!("sample construction failed: {}", e);
        return ExitCode::FAILURE;
    }

    if testall {
        if let Err(e) = exhaustion_smoke() {
            log::error!("exhaustion smoke failed: {}", e);
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}

/// Render the active package and the classic sample structure
/// `((nil 3) (5 nil))`.
fn print_samples(ctx: &mut Context) -> Result<(), HeapError> {
    let pkg = ctx.pkg;
    println!("{}", render(ctx, pkg, pkg).expect("packages always render"));

    let left = ctx.make_list2(LVal::NIL, LVal::from_fixnum(3))?;
    let right = ctx.make_list2(LVal::from_fixnum(5), LVal::NIL)?;
    let sample = ctx.make_list2(left, right)?;
    println!("{}", render(ctx, sample, pkg).expect("lists always render"));
    Ok(())
}

/// Fill a small heap with unreferenced 2-word blocks until raw allocation
/// fails, then verify that a collection restores capacity.
fn exhaustion_smoke() -> Result<(), HeapError> {
    let mut ctx = Context::new(SMOKE_ARENA_WORDS, SMOKE_STACK_WORDS)?;
    let mut filled = 0usize;
    while ctx.allocate(2).is_some() {
        filled += 1;
    }
    log::info!("exhausted the arena after {} raw blocks", filled);

    let rescued = ctx.checked_allocate(2, ctx.sp())?;
    log::info!(
        "collection reclaimed the garbage, retry allocated at {:#x}, {} words free",
        rescued,
        ctx.free_words()
    );

    let pkg = ctx.pkg;
    let c = ctx.make_cons(LVal::from_fixnum(1), LVal::from_fixnum(2))?;
    println!("{}", render(&ctx, c, pkg).expect("pairs always render"));
    Ok(())
}
