//! Command-line exercise harness.
//!
//! Builds one allocator from the `-b` (basic block size) and `-s` (total
//! memory size) flags and stresses it with an Ackermann-function workload:
//! every recursive call holds a live allocation across its subcalls, fills
//! it with a distinct byte, and verifies the fill survived before freeing.
//! The arena must be fully coalesced once the workload completes.

use std::process::ExitCode;

use buddy_arena::{AllocError, BuddyAllocator};
use tracing::Level;

const DEFAULT_BLOCK_SIZE: usize = 128;
const DEFAULT_MEMORY_SIZE: usize = 512 * 1024;

const ACKERMANN_M: u64 = 2;
const ACKERMANN_N: u64 = 3;

struct Config {
    block_size: usize,
    memory_size: usize,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Config, String> {
    let mut config = Config {
        block_size: DEFAULT_BLOCK_SIZE,
        memory_size: DEFAULT_MEMORY_SIZE,
    };

    while let Some(flag) = args.next() {
        let field = match flag.as_str() {
            "-b" | "--block-size" => &mut config.block_size,
            "-s" | "--memory-size" => &mut config.memory_size,
            other => return Err(format!("unrecognized argument: {other}")),
        };

        let value = args
            .next()
            .ok_or_else(|| format!("missing value for {flag}"))?;
        *field = value
            .parse()
            .map_err(|_| format!("invalid value for {flag}: {value}"))?;
    }

    Ok(config)
}

/// Computes the Ackermann function while keeping one allocation live per
/// recursion level, the classic churn pattern for shaking out split and
/// coalesce bookkeeping errors.
fn ackermann(
    arena: &mut BuddyAllocator,
    m: u64,
    n: u64,
    calls: &mut u64,
) -> Result<u64, AllocError> {
    *calls += 1;
    let fill = *calls as u8;

    let len = ((m * 7 + n) % 512) as usize;
    let handle = arena.alloc(len)?;
    arena.region_mut(handle)?.fill(fill);

    let value = if m == 0 {
        n + 1
    } else if n == 0 {
        ackermann(arena, m - 1, 1, calls)?
    } else {
        let inner = ackermann(arena, m, n - 1, calls)?;
        ackermann(arena, m - 1, inner, calls)?
    };

    assert!(
        arena.region(handle)?.iter().all(|&b| b == fill),
        "allocation was clobbered during recursion"
    );
    arena.free(handle)?;

    Ok(value)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    let config = match parse_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut arena = match BuddyAllocator::new(config.block_size, config.memory_size) {
        Ok(arena) => arena,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    println!(
        "arena: block size {} bytes, total {} bytes",
        arena.block_size(),
        arena.memory_size()
    );
    println!("free lists before:\n{}", arena.report());

    let mut calls = 0;
    match ackermann(&mut arena, ACKERMANN_M, ACKERMANN_N, &mut calls) {
        Ok(value) => {
            println!("ackermann({ACKERMANN_M}, {ACKERMANN_N}) = {value} across {calls} allocations")
        }
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    }

    println!("free lists after:\n{}", arena.report());

    let mut counts = arena.free_counts();
    if counts.pop() != Some(1) || counts.iter().any(|&count| count != 0) {
        eprintln!("error: arena failed to coalesce after the workload");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
