//! Work-group geometry: hardware threads per group, the execution mask for
//! a partial last thread, and group-size suggestion.

use xe_common::config::SuggestGroupSizeMode;
use xe_common::math::div_ceil_u32;

/// Hardware threads needed to run `items` work items at `simd` lanes each.
#[must_use]
pub const fn threads_per_group(items: u32, simd: u32) -> u32 {
    div_ceil_u32(items, simd)
}

/// Lane mask of the last thread in a group of `items` work items.
#[must_use]
pub const fn right_execution_mask(items: u32, simd: u32) -> u32 {
    let remainder = items % simd;
    let lanes = if remainder == 0 { simd } else { remainder };
    if lanes >= 32 {
        u32::MAX
    } else {
        (1u32 << lanes) - 1
    }
}

fn largest_divisor_at_most(value: u32, limit: u32) -> u32 {
    let mut candidate = value.min(limit).max(1);
    while candidate > 1 && value % candidate != 0 {
        candidate -= 1;
    }
    candidate
}

/// Each dimension in turn takes the largest divisor of its global size that
/// still fits under `max_group_size`.
fn suggest_nd(global: [u32; 3], work_dim: usize, max_group_size: u32) -> [u32; 3] {
    let mut local = [1u32; 3];
    let mut remaining = max_group_size.max(1);
    for dim in 0..work_dim {
        local[dim] = largest_divisor_at_most(global[dim], remaining);
        remaining /= local[dim];
    }
    local
}

fn suggest_one_d(global: [u32; 3], max_group_size: u32) -> [u32; 3] {
    [largest_divisor_at_most(global[0], max_group_size), 1, 1]
}

/// First two dimensions share the budget: each is capped at the square root
/// of the group limit before the remainder goes to the second.
fn suggest_two_d(global: [u32; 3], work_dim: usize, max_group_size: u32) -> [u32; 3] {
    if work_dim < 2 {
        return suggest_nd(global, work_dim, max_group_size);
    }
    let side = max_group_size.isqrt().max(1);
    let x = largest_divisor_at_most(global[0], side);
    let y = largest_divisor_at_most(global[1], max_group_size / x);
    let z = if work_dim == 3 {
        largest_divisor_at_most(global[2], max_group_size / (x * y))
    } else {
        1
    };
    [x, y, z]
}

/// Equal x and y when a common divisor exists, otherwise the ND heuristic.
fn suggest_squared(global: [u32; 3], work_dim: usize, max_group_size: u32) -> [u32; 3] {
    if work_dim < 2 {
        return suggest_nd(global, work_dim, max_group_size);
    }
    let mut side = max_group_size.isqrt().min(global[0]).min(global[1]);
    while side > 1 && (global[0] % side != 0 || global[1] % side != 0) {
        side -= 1;
    }
    if side <= 1 {
        return suggest_nd(global, work_dim, max_group_size);
    }
    let z = if work_dim == 3 {
        largest_divisor_at_most(global[2], max_group_size / (side * side))
    } else {
        1
    };
    [side, side, z]
}

/// A group size dividing `global` in every dimension with a product no
/// larger than `max_group_size`. Zero global dimensions are treated as 1.
#[must_use]
pub fn suggest_group_size(
    mode: SuggestGroupSizeMode,
    global: [u32; 3],
    work_dim: usize,
    max_group_size: u32,
) -> [u32; 3] {
    let global = global.map(|g| g.max(1));
    let work_dim = work_dim.clamp(1, 3);
    let max_group_size = max_group_size.max(1);
    match mode {
        SuggestGroupSizeMode::Nd => suggest_nd(global, work_dim, max_group_size),
        SuggestGroupSizeMode::OneD => suggest_one_d(global, max_group_size),
        SuggestGroupSizeMode::TwoD => suggest_two_d(global, work_dim, max_group_size),
        SuggestGroupSizeMode::Squared => suggest_squared(global, work_dim, max_group_size),
    }
}
